use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
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

use crate::auth::AgencyAuthSource;
use crate::engine::{now_ms, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::pricing::PriceBreakdown;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct KeyturnHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<KeyturnQueryParser>,
}

impl KeyturnHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(KeyturnQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, engine: &Engine, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(|e| {
            metrics::counter!(observability::QUERIES_TOTAL, "command" => "parse", "status" => "error")
                .increment(1);
            sql_err(e)
        })?;
        let label = observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let now = now_ms();
        match cmd {
            Command::InsertVehicle { vehicle } => {
                engine.list_vehicle(vehicle).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteVehicle { id } => {
                engine.delist_vehicle(id, now).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertLocation { location } => {
                engine.add_location(location).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteLocation { id } => {
                engine.remove_location(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertReservation { request } => {
                engine
                    .submit_reservation(request, now)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertDecision { reservation_id, decision } => {
                engine
                    .owner_decide(reservation_id, decision, now)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertPayment { reservation_id } => {
                engine
                    .capture_payment(reservation_id, now)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertCancellation { reservation_id, party } => {
                engine
                    .cancel_reservation(reservation_id, party, now)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectVehicles => {
                let vehicles = engine.list_vehicles().await;
                Ok(vec![query_response(vehicles_schema(), vehicles, encode_vehicle)])
            }
            Command::SelectLocations => {
                let locations = engine.list_locations();
                Ok(vec![query_response(locations_schema(), locations, encode_location)])
            }
            Command::SelectReservation { id } => {
                let r = engine.get_reservation(id, now).await.map_err(engine_err)?;
                Ok(vec![query_response(reservations_schema(), vec![r], encode_reservation)])
            }
            Command::SelectReservations { vehicle_id } => {
                let rs = engine
                    .list_reservations(vehicle_id, now)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![query_response(reservations_schema(), rs, encode_reservation)])
            }
            Command::SelectBlocked { vehicle_id } => {
                let windows = engine
                    .list_blocking_windows(vehicle_id, now)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![query_response(windows_schema(), windows, encode_window)])
            }
            Command::SelectAvailability { vehicle_id, start, end, min_days } => {
                let windows = engine
                    .available_windows(vehicle_id, start, end, min_days, now)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![query_response(windows_schema(), windows, encode_window)])
            }
            Command::SelectQuote {
                vehicle_id,
                pickup_at,
                return_at,
                pickup_location,
                dropoff_location,
            } => {
                let quote = engine
                    .quote(vehicle_id, pickup_at, return_at, pickup_location, dropoff_location)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![query_response(quote_schema(), vec![quote], encode_quote)])
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn vehicles_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        text("rate_per_day"),
        text("deposit"),
        int8("min_rental_days"),
        text("confirmation"),
    ]
}

fn encode_vehicle(e: &mut DataRowEncoder, v: &Vehicle) -> PgWireResult<()> {
    e.encode_field(&v.id.to_string())?;
    e.encode_field(&v.name)?;
    e.encode_field(&v.rate_per_day.to_string())?;
    e.encode_field(&v.deposit.to_string())?;
    e.encode_field(&i64::from(v.min_rental_days))?;
    e.encode_field(&v.confirmation.as_str().to_string())
}

fn locations_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("name"), text("kind"), text("delivery_fee")]
}

fn encode_location(e: &mut DataRowEncoder, l: &Location) -> PgWireResult<()> {
    e.encode_field(&l.id.to_string())?;
    e.encode_field(&l.name)?;
    e.encode_field(&l.kind.as_str().to_string())?;
    e.encode_field(&l.delivery_fee.to_string())
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("vehicle_id"),
        text("start"),
        text("end"),
        int8("pickup_at"),
        int8("return_at"),
        text("pickup_location"),
        text("dropoff_location"),
        text("phone"),
        int8("age"),
        text("confirmation"),
        text("status"),
        text("hold"),
        int8("owner_decision_deadline"),
        int8("days"),
        text("subtotal"),
        text("delivery_fee"),
        text("total"),
        text("deposit"),
        int8("created_at"),
        int8("updated_at"),
    ]
}

fn encode_reservation(e: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    e.encode_field(&r.id.to_string())?;
    e.encode_field(&r.vehicle_id.to_string())?;
    e.encode_field(&r.window.start.to_string())?;
    e.encode_field(&r.window.end.to_string())?;
    e.encode_field(&r.pickup_at)?;
    e.encode_field(&r.return_at)?;
    e.encode_field(&r.pickup_location.to_string())?;
    e.encode_field(&r.dropoff_location.to_string())?;
    e.encode_field(&r.renter.phone)?;
    e.encode_field(&i64::from(r.renter.age))?;
    e.encode_field(&r.confirmation.as_str().to_string())?;
    e.encode_field(&r.status.label().to_string())?;
    e.encode_field(&r.hold.as_str().to_string())?;
    e.encode_field(&r.owner_decision_deadline())?;
    encode_price(e, &r.price)?;
    e.encode_field(&r.created_at)?;
    e.encode_field(&r.updated_at)
}

fn windows_schema() -> Vec<FieldInfo> {
    vec![text("start"), text("end"), int8("days")]
}

fn encode_window(e: &mut DataRowEncoder, w: &Window) -> PgWireResult<()> {
    e.encode_field(&w.start.to_string())?;
    e.encode_field(&w.end.to_string())?;
    e.encode_field(&w.days())
}

fn quote_schema() -> Vec<FieldInfo> {
    vec![
        int8("days"),
        text("subtotal"),
        text("delivery_fee"),
        text("total"),
        text("deposit"),
    ]
}

fn encode_quote(e: &mut DataRowEncoder, p: &PriceBreakdown) -> PgWireResult<()> {
    encode_price(e, p)
}

fn encode_price(e: &mut DataRowEncoder, p: &PriceBreakdown) -> PgWireResult<()> {
    e.encode_field(&p.days)?;
    e.encode_field(&p.subtotal.to_string())?;
    e.encode_field(&p.delivery_fee.to_string())?;
    e.encode_field(&p.total.to_string())?;
    e.encode_field(&p.deposit.to_string())
}

/// Schema of a SELECT by its FROM table; empty for everything else.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let Some(idx) = lower.find(" from ") else {
        return vec![];
    };
    let table: String = lower[idx + 6..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    match table.as_str() {
        "vehicles" => vehicles_schema(),
        "locations" => locations_schema(),
        "reservations" => reservations_schema(),
        "blocked" | "availability" => windows_schema(),
        "quote" => quote_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for KeyturnHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct KeyturnQueryParser;

#[async_trait]
impl QueryParser for KeyturnQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for KeyturnHandler {
    type Statement = String;
    type QueryParser = KeyturnQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&engine, &sql).await?;
        Ok(responses.remove(0))
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
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
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
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>() {
                    max = max.max(n);
                }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        result = result.replace(&format!("${}", i + 1), &quote_param(param.as_deref()));
    }
    result
}

fn quote_param(param: Option<&[u8]>) -> String {
    match param {
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            format!("'{}'", text.replace('\'', "''"))
        }
        None => "NULL".to_string(),
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct KeyturnFactory {
    handler: Arc<KeyturnHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<AgencyAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl KeyturnFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = AgencyAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(KeyturnHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for KeyturnFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = KeyturnFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// SQLSTATE per engine error class.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict { .. } => "23P01",
        EngineError::Validation(_) => "22023",
        EngineError::Payment { .. } => "P0002",
        EngineError::InvalidTransition { .. } | EngineError::HasBlockingReservations(_) => "55000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
        EngineError::NotFound(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
