use chrono::{DateTime, NaiveDate};
use sqlparser::ast::{self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::lifecycle::Decision;
use crate::model::*;
use crate::money::Money;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVehicle {
        vehicle: Vehicle,
    },
    DeleteVehicle {
        id: Ulid,
    },
    InsertLocation {
        location: Location,
    },
    DeleteLocation {
        id: Ulid,
    },
    InsertReservation {
        request: ReservationRequest,
    },
    InsertDecision {
        reservation_id: Ulid,
        decision: Decision,
    },
    InsertPayment {
        reservation_id: Ulid,
    },
    InsertCancellation {
        reservation_id: Ulid,
        party: Party,
    },
    SelectVehicles,
    SelectLocations,
    SelectReservation {
        id: Ulid,
    },
    SelectReservations {
        vehicle_id: Ulid,
    },
    SelectBlocked {
        vehicle_id: Ulid,
    },
    SelectAvailability {
        vehicle_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        min_days: Option<i64>,
    },
    SelectQuote {
        vehicle_id: Ulid,
        pickup_at: Ms,
        return_at: Ms,
        pickup_location: Ulid,
        dropoff_location: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

const VEHICLE_COLUMNS: &[&str] =
    &["id", "name", "rate_per_day", "deposit", "min_rental_days", "confirmation"];
const LOCATION_COLUMNS: &[&str] = &["id", "name", "kind", "delivery_fee"];
const RESERVATION_COLUMNS: &[&str] = &[
    "id",
    "vehicle_id",
    "pickup_at",
    "return_at",
    "pickup_location",
    "dropoff_location",
    "phone",
    "age",
];
const DECISION_COLUMNS: &[&str] = &["reservation_id", "decision"];
const PAYMENT_COLUMNS: &[&str] = &["reservation_id"];
const CANCELLATION_COLUMNS: &[&str] = &["reservation_id", "party"];

/// One VALUES row keyed by column. Without a column list the values are read in the
/// table's documented order.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(&'static str, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        known: &[&'static str],
        named: &[ast::Ident],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        if named.is_empty() {
            if values.len() > known.len() {
                return Err(SqlError::WrongArity(table, known.len(), values.len()));
            }
            let cells = known.iter().copied().zip(values.iter()).collect();
            return Ok(Self { table, cells });
        }
        if named.len() != values.len() {
            return Err(SqlError::WrongArity(table, named.len(), values.len()));
        }
        let mut cells: Vec<(&'static str, &'a Expr)> = Vec::with_capacity(named.len());
        for (ident, value) in named.iter().zip(values) {
            let name = ident.value.to_lowercase();
            let column = known
                .iter()
                .copied()
                .find(|c| *c == name)
                .ok_or_else(|| SqlError::UnknownColumn(table, name.clone()))?;
            if cells.iter().any(|(c, _)| *c == column) {
                return Err(SqlError::Parse(format!("{table}: column {column} given twice")));
            }
            cells.push((column, value));
        }
        Ok(Self { table, cells })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(c, _)| *c == column).map(|(_, e)| *e)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let row = |name: &'static str, known: &[&'static str]| {
        Row::new(name, known, &insert.columns, &values)
    };

    match table.as_str() {
        "vehicles" => {
            let row = row("vehicles", VEHICLE_COLUMNS)?;
            let deposit = match row.get("deposit") {
                Some(e) => parse_money_or_null(e)?.unwrap_or(Money::ZERO),
                None => Money::ZERO,
            };
            let min_rental_days = match row.get("min_rental_days") {
                Some(e) => parse_u32_or_null(e)?.unwrap_or(1),
                None => 1,
            };
            let confirmation = match row.get("confirmation") {
                Some(e) => {
                    let s = parse_string(e)?;
                    ConfirmationMode::parse(&s)
                        .ok_or_else(|| SqlError::Parse(format!("bad confirmation mode: {s}")))?
                }
                None => ConfirmationMode::Instant,
            };
            let name = match row.get("name") {
                Some(e) => parse_string_or_null(e)?,
                None => None,
            };
            Ok(Command::InsertVehicle {
                vehicle: Vehicle {
                    id: parse_ulid(row.required("id")?)?,
                    name,
                    rate_per_day: parse_money(row.required("rate_per_day")?)?,
                    deposit,
                    min_rental_days,
                    confirmation,
                },
            })
        }
        "locations" => {
            let row = row("locations", LOCATION_COLUMNS)?;
            let kind = parse_string(row.required("kind")?)?;
            Ok(Command::InsertLocation {
                location: Location {
                    id: parse_ulid(row.required("id")?)?,
                    name: parse_string(row.required("name")?)?,
                    kind: LocationKind::parse(&kind)
                        .ok_or_else(|| SqlError::Parse(format!("bad location kind: {kind}")))?,
                    delivery_fee: parse_money(row.required("delivery_fee")?)?,
                },
            })
        }
        "reservations" => {
            let row = row("reservations", RESERVATION_COLUMNS)?;
            Ok(Command::InsertReservation {
                request: ReservationRequest {
                    id: parse_ulid(row.required("id")?)?,
                    vehicle_id: parse_ulid(row.required("vehicle_id")?)?,
                    pickup_at: parse_ms(row.required("pickup_at")?)?,
                    return_at: parse_ms(row.required("return_at")?)?,
                    pickup_location: parse_ulid(row.required("pickup_location")?)?,
                    dropoff_location: parse_ulid(row.required("dropoff_location")?)?,
                    renter: RenterContact {
                        phone: parse_string(row.required("phone")?)?,
                        age: parse_u32(row.required("age")?)?,
                    },
                },
            })
        }
        "decisions" => {
            let row = row("decisions", DECISION_COLUMNS)?;
            let s = parse_string(row.required("decision")?)?;
            Ok(Command::InsertDecision {
                reservation_id: parse_ulid(row.required("reservation_id")?)?,
                decision: Decision::parse(&s)
                    .ok_or_else(|| SqlError::Parse(format!("bad decision: {s}")))?,
            })
        }
        "payments" => {
            let row = row("payments", PAYMENT_COLUMNS)?;
            Ok(Command::InsertPayment {
                reservation_id: parse_ulid(row.required("reservation_id")?)?,
            })
        }
        "cancellations" => {
            let row = row("cancellations", CANCELLATION_COLUMNS)?;
            let s = parse_string(row.required("party")?)?;
            Ok(Command::InsertCancellation {
                reservation_id: parse_ulid(row.required("reservation_id")?)?,
                party: Party::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad party: {s}")))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "vehicles" => Ok(Command::DeleteVehicle { id }),
        "locations" => Ok(Command::DeleteLocation { id }),
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
        collect_filters(selection, &mut filters);
    }
    let find = |col: &str, op: BinaryOperator| {
        filters
            .iter()
            .find(|(c, o, _)| c == col && *o == op)
            .map(|(_, _, e)| *e)
    };
    let required = |col: &'static str| find(col, BinaryOperator::Eq).ok_or(SqlError::MissingFilter(col));

    match table.as_str() {
        "vehicles" => Ok(Command::SelectVehicles),
        "locations" => Ok(Command::SelectLocations),
        "reservations" => {
            if let Some(e) = find("id", BinaryOperator::Eq) {
                Ok(Command::SelectReservation { id: parse_ulid(e)? })
            } else {
                Ok(Command::SelectReservations {
                    vehicle_id: parse_ulid(required("vehicle_id")?)?,
                })
            }
        }
        "blocked" => Ok(Command::SelectBlocked {
            vehicle_id: parse_ulid(required("vehicle_id")?)?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            vehicle_id: parse_ulid(required("vehicle_id")?)?,
            start: parse_date(find("start", BinaryOperator::GtEq).ok_or(SqlError::MissingFilter("start"))?)?,
            end: parse_date(find("end", BinaryOperator::LtEq).ok_or(SqlError::MissingFilter("end"))?)?,
            min_days: find("min_days", BinaryOperator::Eq).map(parse_i64_expr).transpose()?,
        }),
        "quote" => Ok(Command::SelectQuote {
            vehicle_id: parse_ulid(required("vehicle_id")?)?,
            pickup_at: parse_ms(required("pickup_at")?)?,
            return_at: parse_ms(required("return_at")?)?,
            pickup_location: parse_ulid(required("pickup_location")?)?,
            dropoff_location: parse_ulid(required("dropoff_location")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten an AND-tree of `column <op> value` comparisons.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, BinaryOperator, &'a Expr)>) {
    match expr {
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_filters(left, out);
            collect_filters(right, out);
        }
        Expr::BinaryOp { left, op, right } => {
            if let Some(col) = expr_column_name(left) {
                out.push((col, op.clone(), right.as_ref()));
            }
        }
        Expr::Nested(inner) => collect_filters(inner, out),
        _ => {}
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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

/// First VALUES row. Multi-row inserts are refused so a partial batch can't commit.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.len() {
            0 => Err(SqlError::Parse("empty VALUES".into())),
            1 => Ok(values.rows[0].clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u32(expr).map(Some)
}

/// Unix milliseconds, or an RFC 3339 string.
fn parse_ms(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err() {
            return DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.timestamp_millis())
                .map_err(|e| SqlError::Parse(format!("bad timestamp {s}: {e}")));
        }
    parse_i64_expr(expr)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

/// Decimal amount with at most two fractional digits. Never goes through a float.
fn parse_money(expr: &Expr) -> Result<Money, SqlError> {
    let raw = match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s.clone(),
        Some(value) => return Err(SqlError::Parse(format!("expected amount, got {value:?}"))),
        None => match expr {
            Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } => {
                return parse_money(expr).map(|m| Money::from_minor(-m.minor()));
            }
            _ => return Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
        },
    };
    raw.parse::<Money>().map_err(|e| SqlError::Parse(format!("bad amount {raw}: {e}")))
}

fn parse_money_or_null(expr: &Expr) -> Result<Option<Money>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_money(expr).map(Some)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::UnknownColumn(t, col) => write!(f, "{t}: unknown column {col}"),
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing value for {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
