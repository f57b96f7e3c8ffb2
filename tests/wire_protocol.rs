use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use farmslot::booking::BookingService;
use farmslot::engine::Engine;
use farmslot::wire;

const PASSWORD: &str = "farmslot";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("farmslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("farmslot.wal")).unwrap());
    let service = Arc::new(BookingService::new(engine.clone()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let service = service.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, service, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect_with(addr: SocketAddr, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("farmslot")
        .user("farmer")
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> Client {
    connect_with(addr, PASSWORD).await.unwrap()
}

async fn add_machine(client: &Client, charge: u64) -> Ulid {
    let id = Ulid::new();
    let owner = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO machines (id, name, description, base_hourly_charge, owner_id) \
             VALUES ('{id}', 'Tractor', '75hp', {charge}, '{owner}')"
        ))
        .await
        .unwrap();
    id
}

fn booking_sql(machine: Ulid, farmer: Ulid, date: &str, slots: &str) -> String {
    format!(
        "INSERT INTO bookings (machine_id, farmer_id, date, slots) \
         VALUES ('{machine}', '{farmer}', '{date}', '{slots}')"
    )
}

/// Data rows of a simple query, as maps of column name to text value.
fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<Vec<(String, Option<String>)>> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.name().to_string(), row.get(i).map(str::to_string)))
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

fn field<'a>(row: &'a [(String, Option<String>)], name: &str) -> &'a str {
    row.iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, v)| v.as_deref())
        .unwrap_or_else(|| panic!("no column {name}"))
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_and_query_over_simple_protocol() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let machine = add_machine(&client, 1000).await;
    let farmer = Ulid::new();

    let receipt = data_rows(
        client
            .simple_query(&booking_sql(machine, farmer, "2024-06-01", "[1,2,3]"))
            .await
            .unwrap(),
    );
    assert_eq!(receipt.len(), 1);
    assert_eq!(field(&receipt[0], "machine_id"), machine.to_string());
    assert_eq!(field(&receipt[0], "slots_booked"), "[1,2,3]");
    assert_eq!(field(&receipt[0], "total_cost"), "3000");

    let free = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM availability WHERE machine_id = '{machine}' AND date = '2024-06-01'"
            ))
            .await
            .unwrap(),
    );
    let slots: Vec<&str> = free.iter().map(|r| field(r, "slot")).collect();
    assert_eq!(slots.len(), 21);
    assert_eq!(slots.first(), Some(&"4"));
    assert_eq!(slots.last(), Some(&"24"));

    let invoice_id = field(&receipt[0], "invoice_id").to_string();
    let invoice = data_rows(
        client
            .simple_query(&format!("SELECT * FROM invoices WHERE id = '{invoice_id}'"))
            .await
            .unwrap(),
    );
    assert_eq!(field(&invoice[0], "amount"), "3000");
    assert_eq!(field(&invoice[0], "booking_id"), field(&receipt[0], "booking_id"));
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let machine = add_machine(&client, 250).await;
    let farmer = Ulid::new();

    let rows = client
        .query(
            "INSERT INTO bookings (machine_id, farmer_id, date, slots) VALUES ($1, $2, $3, $4)",
            &[&machine.to_string(), &farmer.to_string(), &"2024-06-02", &"[7, 8]"],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<_, i64>("total_cost"), 500);
    assert_eq!(rows[0].get::<_, String>("slots_booked"), "[7,8]");

    let booked = client
        .query(
            "SELECT * FROM booked_slots WHERE machine_id = $1 AND date = $2",
            &[&machine.to_string(), &"2024-06-02"],
        )
        .await
        .unwrap();
    let slots: Vec<i32> = booked.iter().map(|r| r.get("slot")).collect();
    assert_eq!(slots, vec![7, 8]);

    let history = client
        .query("SELECT * FROM bookings WHERE farmer_id = $1", &[&farmer.to_string()])
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].get::<_, String>("date"), "2024-06-02");
    assert_eq!(history[0].get::<_, i64>("total_cost"), 500);
}

#[tokio::test]
async fn conflicting_booking_is_unique_violation() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let machine = add_machine(&client, 1000).await;

    client
        .simple_query(&booking_sql(machine, Ulid::new(), "2024-06-01", "[1,2,3]"))
        .await
        .unwrap();
    let err = client
        .simple_query(&booking_sql(machine, Ulid::new(), "2024-06-01", "[2]"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(&SqlState::UNIQUE_VIOLATION));
    assert_eq!(engine.booking_count(), 1);
}

#[tokio::test]
async fn unknown_machine_is_no_data_found() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;

    let err = client
        .simple_query(&booking_sql(Ulid::new(), Ulid::new(), "2024-06-01", "[5]"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(&SqlState::NO_DATA_FOUND));
    assert_eq!(engine.booking_count(), 0);
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let machine = add_machine(&client, 1000).await;

    let out_of_range = client
        .simple_query(&booking_sql(machine, Ulid::new(), "2024-06-01", "[25]"))
        .await
        .unwrap_err();
    assert_eq!(out_of_range.code(), Some(&SqlState::INVALID_PARAMETER_VALUE));

    let empty = client
        .simple_query(&booking_sql(machine, Ulid::new(), "2024-06-01", "[]"))
        .await
        .unwrap_err();
    assert_eq!(empty.code(), Some(&SqlState::INVALID_PARAMETER_VALUE));

    let syntax = client.simple_query("SELEC nonsense").await.unwrap_err();
    assert_eq!(syntax.code(), Some(&SqlState::SYNTAX_ERROR));
}

#[tokio::test]
async fn concurrent_clients_race_for_one_slot() {
    let (addr, engine) = start_test_server().await;
    let setup = connect(addr).await;
    let machine = add_machine(&setup, 1000).await;

    let mut handles = Vec::new();
    for _ in 0..6 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            client
                .simple_query(&booking_sql(machine, Ulid::new(), "2024-06-01", "[12]"))
                .await
        }));
    }

    let mut won = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(e) => assert_eq!(e.code(), Some(&SqlState::UNIQUE_VIOLATION)),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(engine.booking_count(), 1);
}

#[tokio::test]
async fn list_machines() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let a = add_machine(&client, 100).await;
    let b = add_machine(&client, 200).await;

    let rows = client.query("SELECT * FROM machines", &[]).await.unwrap();
    let ids: Vec<String> = rows.iter().map(|r| r.get("id")).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&a.to_string()));
    assert!(ids.contains(&b.to_string()));
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let (addr, _engine) = start_test_server().await;
    assert!(connect_with(addr, "not-the-password").await.is_err());
}
