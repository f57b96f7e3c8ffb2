use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertMachine {
        id: Ulid,
        name: String,
        description: String,
        base_hourly_charge: Amount,
        owner_id: Ulid,
    },
    InsertBooking {
        machine_id: Ulid,
        farmer_id: Ulid,
        date: NaiveDate,
        slots: Vec<SlotNumber>,
    },
    SelectMachines,
    SelectAvailability {
        machine_id: Ulid,
        date: NaiveDate,
    },
    SelectBookedSlots {
        machine_id: Ulid,
        date: NaiveDate,
    },
    SelectBookings {
        farmer_id: Ulid,
    },
    SelectInvoice {
        id: Ulid,
    },
}

const MACHINE_COLUMNS: &[&str] = &["id", "name", "description", "base_hourly_charge", "owner_id"];
const BOOKING_COLUMNS: &[&str] = &["machine_id", "farmer_id", "date", "slots"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.as_slice() {
        [] => Err(SqlError::Empty),
        [stmt] => match stmt {
            Statement::Insert(insert) => parse_insert(insert),
            Statement::Query(query) => parse_select(query),
            other => Err(SqlError::Unsupported(format!("{other}"))),
        },
        _ => Err(SqlError::Unsupported("multiple statements".into())),
    }
}

/// Table a statement writes to or reads from, known before parameters are bound.
#[derive(Debug, PartialEq, Eq)]
pub enum Target {
    Insert(String),
    Select(String),
}

/// Best-effort target of a statement that may still contain `$n` placeholders.
pub fn statement_target(sql: &str) -> Option<Target> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => insert_table_name(insert).ok().map(Target::Insert),
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => {
                let from = select.from.first()?;
                table_factor_name(&from.relation).ok().map(Target::Select)
            }
            _ => None,
        },
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let values = extract_single_row(insert)?;

    match table.as_str() {
        "machines" => {
            let row = Row::new("machines", MACHINE_COLUMNS, &columns, &values)?;
            Ok(Command::InsertMachine {
                id: parse_ulid_expr(row.get("id")?)?,
                name: parse_string_expr(row.get("name")?)?,
                description: match row.try_get("description") {
                    Some(expr) => parse_string_or_null(expr)?.unwrap_or_default(),
                    None => String::new(),
                },
                base_hourly_charge: parse_amount_expr(row.get("base_hourly_charge")?)?,
                owner_id: parse_ulid_expr(row.get("owner_id")?)?,
            })
        }
        "bookings" => {
            let row = Row::new("bookings", BOOKING_COLUMNS, &columns, &values)?;
            Ok(Command::InsertBooking {
                machine_id: parse_ulid_expr(row.get("machine_id")?)?,
                farmer_id: parse_ulid_expr(row.get("farmer_id")?)?,
                date: parse_date_expr(row.get("date")?)?,
                slots: parse_slots_expr(row.get("slots")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col| find_filter(&filters, col);

    match table.as_str() {
        "machines" => Ok(Command::SelectMachines),
        "availability" => Ok(Command::SelectAvailability {
            machine_id: parse_ulid_expr(filter("machine_id")?)?,
            date: parse_date_expr(filter("date")?)?,
        }),
        "booked_slots" => Ok(Command::SelectBookedSlots {
            machine_id: parse_ulid_expr(filter("machine_id")?)?,
            date: parse_date_expr(filter("date")?)?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            farmer_id: parse_ulid_expr(filter("farmer_id")?)?,
        }),
        "invoices" => Ok(Command::SelectInvoice {
            id: parse_ulid_expr(filter("id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn find_filter<'a>(filters: &[(String, &'a Expr)], col: &'static str) -> Result<&'a Expr, SqlError> {
    filters
        .iter()
        .find(|(name, _)| name == col)
        .map(|(_, expr)| *expr)
        .ok_or(SqlError::MissingFilter(col))
}

/// Collect `column = value` pairs joined by AND. Anything else in a WHERE is rejected.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

/// One VALUES row, addressed by column name. Without an explicit column list
/// the values are taken in the table's declared order.
struct Row<'a> {
    table: &'static str,
    pairs: Vec<(&'a str, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        declared: &'static [&'static str],
        columns: &'a [String],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let pairs: Vec<(&str, &Expr)> = if columns.is_empty() {
            if values.len() > declared.len() {
                return Err(SqlError::WrongArity(table, declared.len(), values.len()));
            }
            declared.iter().copied().zip(values.iter()).collect()
        } else {
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            if let Some(unknown) = columns.iter().find(|c| !declared.contains(&c.as_str())) {
                return Err(SqlError::UnknownColumn(table, unknown.clone()));
            }
            columns.iter().map(String::as_str).zip(values.iter()).collect()
        };
        Ok(Self { table, pairs })
    }

    fn try_get(&self, col: &str) -> Option<&'a Expr> {
        self.pairs.iter().find(|(name, _)| *name == col).map(|(_, e)| *e)
    }

    fn get(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.try_get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_single_row(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_amount_expr(expr: &Expr) -> Result<Amount, SqlError> {
    let v = parse_i64_expr(expr)?;
    Amount::try_from(v).map_err(|_| SqlError::Parse(format!("amount {v} must not be negative")))
}

/// Dates are ISO `YYYY-MM-DD` strings.
fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// Slots come either as a JSON array in a string (`'[1,2,3]'`) or as `ARRAY[1,2,3]`.
fn parse_slots_expr(expr: &Expr) -> Result<Vec<SlotNumber>, SqlError> {
    let numbers: Vec<i64> = match expr {
        Expr::Array(array) => array
            .elem
            .iter()
            .map(parse_i64_expr)
            .collect::<Result<_, _>>()?,
        _ => {
            let s = parse_string_expr(expr)?;
            serde_json::from_str(&s).map_err(|e| SqlError::Parse(format!("bad slot list {s:?}: {e}")))?
        }
    };
    numbers
        .into_iter()
        .map(|n| SlotNumber::try_from(n).map_err(SqlError::SlotOutOfRange))
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    SlotOutOfRange(i64),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::SlotOutOfRange(n) => write!(f, "slot {n} out of range 1..=24"),
        }
    }
}

impl std::error::Error for SqlError {}
