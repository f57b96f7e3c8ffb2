use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const SLOTS_PER_DAY: u64 = 24;

#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
    password: String,
}

async fn connect(target: &Target) -> Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname("farmslot")
        .user("bench")
        .password(&target.password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()
}

/// Date and slot of the `i`th hour counted from the bench's base date.
fn nth_slot(i: u64) -> (NaiveDate, u64) {
    let date = base_date() + Days::new(i / SLOTS_PER_DAY);
    (date, i % SLOTS_PER_DAY + 1)
}

async fn add_machine(client: &Client, charge: u64) -> Ulid {
    let id = Ulid::new();
    let owner = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO machines (id, name, description, base_hourly_charge, owner_id) \
             VALUES ('{id}', 'bench', 'stress machine', {charge}, '{owner}')"
        ))
        .await
        .unwrap();
    id
}

async fn book(client: &Client, machine: Ulid, date: NaiveDate, slots: &str) -> Result<(), tokio_postgres::Error> {
    let farmer = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (machine_id, farmer_id, date, slots) \
             VALUES ('{machine}', '{farmer}', '{date}', '{slots}')"
        ))
        .await
}

async fn phase1_sequential(target: &Target) {
    let client = connect(target).await;
    let machine = add_machine(&client, 1000).await;

    let n = 2000u64;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let (date, slot) = nth_slot(i);
        let t = Instant::now();
        book(&client, machine, date, &format!("[{slot}]")).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(target: &Target) {
    let n_tasks = 10;
    let n_per_task = 200u64;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let target = target.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target).await;
            // One machine per task, so writers never touch the same day calendar
            let machine = add_machine(&client, 500).await;
            for j in 0..n_per_task {
                let (date, slot) = nth_slot(j);
                book(&client, machine, date, &format!("[{slot}]")).await.unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks as u64 * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_contention(target: &Target) {
    let n_clients = 20;
    let days = 10u64;

    let setup = connect(target).await;
    let machine = add_machine(&setup, 1000).await;
    drop(setup);

    let won = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    // Every client asks for every slot of every day; each slot can be won once
    for _ in 0..n_clients {
        let target = target.clone();
        let won = won.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target).await;
            for i in 0..days * SLOTS_PER_DAY {
                let (date, slot) = nth_slot(i);
                match book(&client, machine, date, &format!("[{slot}]")).await {
                    Ok(()) => {
                        won.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                        conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => panic!("unexpected booking error: {e}"),
                }
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let conflicts = conflicts.load(Ordering::Relaxed);
    println!(
        "  {n_clients} clients over {} slots: {won} booked, {conflicts} conflicts in {:.2}s",
        days * SLOTS_PER_DAY,
        elapsed.as_secs_f64()
    );
    assert_eq!(won as u64, days * SLOTS_PER_DAY, "each slot must be booked exactly once");
}

async fn phase4_read_under_load(target: &Target) {
    let setup = connect(target).await;
    let machine = add_machine(&setup, 1000).await;
    for i in 0..SLOTS_PER_DAY / 2 {
        let (date, slot) = nth_slot(i * 2);
        book(&setup, machine, date, &format!("[{slot}]")).await.unwrap();
    }
    drop(setup);

    // Writer tasks: continuously add bookings on their own machines in the background
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let target = target.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&target).await;
            let own = add_machine(&client, 100).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let (date, slot) = nth_slot(i);
                let _ = book(&client, own, date, &format!("[{slot}]")).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let target = target.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&target).await;
            let date = base_date();
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                let rows = client
                    .query(
                        "SELECT * FROM availability WHERE machine_id = $1 AND date = $2",
                        &[&machine.to_string(), &date.to_string()],
                    )
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
                assert_eq!(rows.len() as u64, SLOTS_PER_DAY / 2);
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let target = Target {
        host: std::env::var("FARMSLOT_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("FARMSLOT_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid FARMSLOT_PORT"),
        password: std::env::var("FARMSLOT_PASSWORD").expect("FARMSLOT_PASSWORD must be set"),
    };

    println!("=== farmslot stress benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] concurrent bookings on separate machines");
    phase2_concurrent(&target).await;

    println!("\n[phase 3] contention on shared slots");
    phase3_contention(&target).await;

    println!("\n[phase 4] availability latency under write load");
    phase4_read_under_load(&target).await;

    println!("\n=== benchmark complete ===");
}
