use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::FarmslotAuthSource;
use crate::booking::{BookingRequest, BookingService};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError, Target};

/// The booking service as served over the wire.
pub type Service = BookingService<Arc<Engine>>;

pub struct FarmslotHandler {
    service: Arc<Service>,
    query_parser: Arc<FarmslotQueryParser>,
}

impl FarmslotHandler {
    pub fn new(service: Arc<Service>) -> Self {
        Self {
            service,
            query_parser: Arc::new(FarmslotQueryParser),
        }
    }

    fn engine(&self) -> &Engine {
        self.service.store()
    }

    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertMachine {
                id,
                name,
                description,
                base_hourly_charge,
                owner_id,
            } => {
                self.engine()
                    .add_machine(Machine {
                        id,
                        name,
                        description,
                        base_hourly_charge,
                        owner_id,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertBooking {
                machine_id,
                farmer_id,
                date,
                slots,
            } => {
                let receipt = self
                    .service
                    .book(BookingRequest {
                        machine_id,
                        farmer_id,
                        date,
                        slots,
                    })
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(receipt_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&receipt.booking_id.to_string())?;
                encoder.encode_field(&receipt.invoice_id.to_string())?;
                encoder.encode_field(&receipt.machine_id.to_string())?;
                encoder.encode_field(&slots_json(&receipt.slots_booked))?;
                encoder.encode_field(&amount_field(receipt.total_cost)?)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectMachines => {
                let machines = self.engine().list_machines();
                let schema = Arc::new(machines_schema());
                let rows: Vec<PgWireResult<_>> = machines
                    .into_iter()
                    .map(|m| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&m.id.to_string())?;
                        encoder.encode_field(&m.name)?;
                        encoder.encode_field(&m.description)?;
                        encoder.encode_field(&amount_field(m.base_hourly_charge)?)?;
                        encoder.encode_field(&m.owner_id.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAvailability { machine_id, date } => {
                let slots = self
                    .service
                    .available_slots(machine_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(slot_rows(machine_id, date, slots))
            }
            Command::SelectBookedSlots { machine_id, date } => {
                let slots = self
                    .service
                    .booked_slots(machine_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(slot_rows(machine_id, date, slots))
            }
            Command::SelectBookings { farmer_id } => {
                let bookings = self
                    .service
                    .all_bookings(farmer_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.booking_id.to_string())?;
                        encoder.encode_field(&b.machine_id.to_string())?;
                        encoder.encode_field(&b.farmer_id.to_string())?;
                        encoder.encode_field(&b.date.to_string())?;
                        encoder.encode_field(&slots_json(&b.slots))?;
                        encoder.encode_field(&b.invoice_id.to_string())?;
                        encoder.encode_field(&amount_field(b.total_cost)?)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectInvoice { id } => {
                let schema = Arc::new(invoice_schema());
                let rows: Vec<PgWireResult<_>> = self
                    .engine()
                    .get_invoice(&id)
                    .into_iter()
                    .map(|inv| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&inv.id.to_string())?;
                        encoder.encode_field(&inv.booking_id.to_string())?;
                        encoder.encode_field(&inv.date_generated.to_string())?;
                        encoder.encode_field(&amount_field(inv.amount)?)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn slot_rows(machine_id: ulid::Ulid, date: chrono::NaiveDate, slots: Vec<SlotNumber>) -> Response {
    let schema = Arc::new(slot_schema());
    let mid = machine_id.to_string();
    let day = date.to_string();
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&mid)?;
            encoder.encode_field(&day)?;
            encoder.encode_field(&i32::from(slot.get()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn slots_json(slots: &[SlotNumber]) -> String {
    let numbers: Vec<u8> = slots.iter().map(|s| s.get()).collect();
    serde_json::Value::from(numbers).to_string()
}

fn amount_field(amount: Amount) -> PgWireResult<i64> {
    i64::try_from(amount).map_err(|_| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "22003".into(),
            format!("amount {amount} out of range"),
        )))
    })
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn receipt_schema() -> Vec<FieldInfo> {
    vec![
        text("booking_id"),
        text("invoice_id"),
        text("machine_id"),
        text("slots_booked"),
        int8("total_cost"),
    ]
}

fn machines_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        text("description"),
        int8("base_hourly_charge"),
        text("owner_id"),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text("machine_id"),
        text("date"),
        FieldInfo::new("slot".into(), None, None, Type::INT4, FieldFormat::Text),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text("booking_id"),
        text("machine_id"),
        text("farmer_id"),
        text("date"),
        text("slots"),
        text("invoice_id"),
        int8("total_cost"),
    ]
}

fn invoice_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("booking_id"),
        text("date_generated"),
        int8("amount"),
    ]
}

/// Row description of a statement, empty for plain INSERTs.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::statement_target(sql) {
        Some(Target::Insert(table)) if table == "bookings" => receipt_schema(),
        Some(Target::Select(table)) => match table.as_str() {
            "machines" => machines_schema(),
            "availability" | "booked_slots" => slot_schema(),
            "bookings" => bookings_schema(),
            "invoices" => invoice_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for FarmslotHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FarmslotQueryParser;

#[async_trait]
impl QueryParser for FarmslotQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FarmslotHandler {
    type Statement = String;
    type QueryParser = FarmslotQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// One left-to-right pass: each placeholder is replaced once, and text that
/// came from a bound value is never scanned again. Placeholders without a
/// bound value are left as written.
fn substitute_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let bound = sql[start + 1..i]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = bound {
            result.push_str(&sql[copied..start]);
            match param {
                Some(value) => {
                    let text = String::from_utf8_lossy(value);
                    result.push('\'');
                    result.push_str(&text.replace('\'', "''"));
                    result.push('\'');
                }
                None => result.push_str("NULL"),
            }
            copied = i;
        }
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FarmslotFactory {
    handler: Arc<FarmslotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FarmslotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FarmslotFactory {
    pub fn new(service: Arc<Service>, password: String) -> Self {
        let auth_source = FarmslotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FarmslotHandler::new(service)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FarmslotFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    service: Arc<Service>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = FarmslotFactory::new(service, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotConflict { .. } | EngineError::AlreadyExists(_) => "23505",
        EngineError::MachineNotFound(_) | EngineError::NotFound(_) => "P0002",
        EngineError::InvalidRequest(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Integrity(_) | EngineError::Storage(_) | EngineError::WalError(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::SlotOutOfRange(_) => "22023",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_mapping() {
        let id = ulid::Ulid::new();
        let date = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let conflict = EngineError::SlotConflict {
            machine_id: id,
            date,
            slot: SlotNumber::new(3).unwrap(),
        };
        assert_eq!(engine_sqlstate(&conflict), "23505");
        assert_eq!(engine_sqlstate(&EngineError::MachineNotFound(id)), "P0002");
        assert_eq!(engine_sqlstate(&EngineError::InvalidRequest("x")), "22023");
        assert_eq!(engine_sqlstate(&EngineError::Storage("disk".into())), "XX000");
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM machines"), 0);
        assert_eq!(count_params("SELECT * FROM availability WHERE machine_id = $1 AND date = $2"), 2);
        assert_eq!(count_params("VALUES ($2, $10, $1)"), 10);
    }

    #[test]
    fn substitute_params_quotes_and_orders() {
        let params: Vec<Option<Bytes>> = (1..=10)
            .map(|i| Some(Bytes::from(format!("v{i}"))))
            .collect();
        let sql = substitute_params("SELECT $1, $10", &params);
        assert_eq!(sql, "SELECT 'v1', 'v10'");

        let quoted = substitute_params("SELECT $1", &[Some(Bytes::from("it's"))]);
        assert_eq!(quoted, "SELECT 'it''s'");

        let null = substitute_params("SELECT $1", &[None]);
        assert_eq!(null, "SELECT NULL");
    }

    #[test]
    fn bound_values_are_not_substituted_again() {
        let params = [Some(Bytes::from("m1")), Some(Bytes::from("a$1"))];
        let sql = substitute_params("VALUES ($1, $2)", &params);
        assert_eq!(sql, "VALUES ('m1', 'a$1')");

        let reversed = substitute_params("VALUES ($2, $1)", &[Some(Bytes::from("$2")), Some(Bytes::from("x"))]);
        assert_eq!(reversed, "VALUES ('x', '$2')");
    }

    #[test]
    fn unbound_placeholders_are_left_alone() {
        let sql = substitute_params("SELECT $1, $3, $0, $", &[Some(Bytes::from("v"))]);
        assert_eq!(sql, "SELECT 'v', $3, $0, $");
    }

    #[test]
    fn slots_render_as_json() {
        let slots: Vec<SlotNumber> = [1, 2, 24].iter().map(|&n| SlotNumber::new(n).unwrap()).collect();
        assert_eq!(slots_json(&slots), "[1,2,24]");
    }

    #[test]
    fn schemas_follow_statement_target() {
        let names = |fields: Vec<FieldInfo>| -> Vec<String> {
            fields.iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names(result_schema("SELECT * FROM availability WHERE machine_id = $1 AND date = $2")),
            vec!["machine_id", "date", "slot"]
        );
        assert_eq!(
            names(result_schema("INSERT INTO bookings (machine_id, farmer_id, date, slots) VALUES ($1, $2, $3, $4)")),
            vec!["booking_id", "invoice_id", "machine_id", "slots_booked", "total_cost"]
        );
        assert!(result_schema("INSERT INTO machines (id) VALUES ($1)").is_empty());
    }
}
