use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::warn;

use crate::auth::{Operators, SlotbookAuthSource};
use crate::engine::{Cancellation, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, RowShape, SqlError};

pub struct SlotbookHandler {
    engine: Arc<Engine>,
    operators: Arc<Operators>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>, operators: Arc<Operators>) -> Self {
        Self {
            engine,
            operators,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    /// The connection's user name, set during startup.
    fn caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<String> {
        client
            .metadata()
            .get("user")
            .cloned()
            .ok_or_else(|| user_error("08006", "connection has no user".into()))
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str, format: &Format) -> PgWireResult<Response> {
        let caller = self.caller(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);

        if cmd.requires_operator(&caller) && !self.operators.is_privileged(&caller) {
            warn!("{caller} denied {label}");
            metrics::counter!(observability::PRIVILEGE_DENIALS_TOTAL, "command" => label).increment(1);
            return Err(user_error(
                "42501",
                format!("permission denied: {label} requires an operator"),
            ));
        }

        let start = Instant::now();
        let result = self.execute_command(&caller, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, caller: &str, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertSlot { slot, returning } => {
                let id = engine.create_slot(slot).await.map_err(engine_err)?;
                if !returning {
                    return Ok(Response::Execution(Tag::new("INSERT").with_rows(1)));
                }
                let slot = engine
                    .get_slot(id)
                    .await
                    .ok_or_else(|| engine_err(EngineError::SlotNotFound(id)))?;
                slot_rows(vec![slot], format)
            }
            Command::InsertBooking {
                slot_id,
                user_id,
                address,
                note,
                returning,
            } => {
                let new = NewBooking {
                    user_id: user_id.unwrap_or_else(|| caller.to_string()),
                    slot_id,
                    address,
                    note,
                };
                let booking = engine.create_booking(new).await.map_err(engine_err)?;
                if returning {
                    booking_rows(vec![booking], format)
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::CancelBooking { id } => {
                let rows = match engine.cancel_booking(id).await.map_err(engine_err)? {
                    Cancellation::Cancelled(_) => 1,
                    Cancellation::AlreadyCancelled => 0,
                };
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(rows)))
            }
            Command::SelectSlots { date } => {
                let slots = match date {
                    Some(date) => engine.list_slots_for_day(date).await,
                    None => engine.list_slots(SlotFilter::all()).await,
                };
                slot_rows(slots, format)
            }
            Command::SelectBookableSlots { date } => slot_rows(engine.list_bookable_slots(date).await, format),
            Command::SelectBookableDays => day_rows(engine.list_bookable_days().await, format),
            Command::SelectBooking { id } => {
                let bookings = engine.get_booking(id).await.into_iter().collect();
                booking_rows(bookings, format)
            }
            Command::SelectBookingsForSlot { slot_id } => {
                booking_rows(engine.list_bookings_for_slot(slot_id).await, format)
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

const SLOT_COLUMNS: [(&str, Type); 8] = [
    ("id", Type::INT8),
    ("date", Type::VARCHAR),
    ("time_start", Type::VARCHAR),
    ("time_end", Type::VARCHAR),
    ("zone", Type::VARCHAR),
    ("capacity", Type::INT4),
    ("booked_count", Type::INT4),
    ("remaining", Type::INT4),
];

const BOOKING_COLUMNS: [(&str, Type); 7] = [
    ("id", Type::INT8),
    ("user_id", Type::VARCHAR),
    ("slot_id", Type::INT8),
    ("address", Type::VARCHAR),
    ("note", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("created_at", Type::VARCHAR),
];

const DAY_COLUMNS: [(&str, Type); 1] = [("date", Type::VARCHAR)];

fn fields(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new(name.to_string(), None, None, ty.clone(), format.format_for(i)))
        .collect()
}

fn schema_for(shape: Option<RowShape>, format: &Format) -> Vec<FieldInfo> {
    match shape {
        Some(RowShape::Slots) => fields(&SLOT_COLUMNS, format),
        Some(RowShape::Bookings) => fields(&BOOKING_COLUMNS, format),
        Some(RowShape::Days) => fields(&DAY_COLUMNS, format),
        None => vec![],
    }
}

/// Counts fit in INT4: capacity is bounded well below `i32::MAX`.
fn int4(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn slot_rows(slots: Vec<Slot>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(fields(&SLOT_COLUMNS, format));
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot.id)?;
            encoder.encode_field(&slot.date.format("%Y-%m-%d").to_string())?;
            encoder.encode_field(&slot.time_start.format("%H:%M:%S").to_string())?;
            encoder.encode_field(&slot.time_end.format("%H:%M:%S").to_string())?;
            encoder.encode_field(&slot.zone)?;
            encoder.encode_field(&int4(slot.capacity))?;
            encoder.encode_field(&int4(slot.booked_count))?;
            encoder.encode_field(&int4(slot.remaining()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn booking_rows(bookings: Vec<Booking>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(fields(&BOOKING_COLUMNS, format));
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id)?;
            encoder.encode_field(&b.user_id)?;
            encoder.encode_field(&b.slot_id)?;
            encoder.encode_field(&b.address)?;
            encoder.encode_field(&b.note)?;
            encoder.encode_field(&b.status.to_string())?;
            encoder.encode_field(&b.created_at.to_rfc3339())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn day_rows(days: Vec<chrono::NaiveDate>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(fields(&DAY_COLUMNS, format));
    let rows: Vec<PgWireResult<_>> = days
        .into_iter()
        .map(|d| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&d.format("%Y-%m-%d").to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
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
        Ok(vec![self.run(client, query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        let format = column_format.unwrap_or(&Format::UnifiedText);
        Ok(schema_for(sql::describe_rows(stmt), format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql, &portal.result_column_format).await
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
        let fields = schema_for(sql::describe_rows(&target.statement), &Format::UnifiedText);
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        let fields = schema_for(sql::describe_rows(&target.statement.statement), &target.result_column_format);
        Ok(DescribePortalResponse::new(fields))
    }
}

/// Byte ranges and indexes of the `$N` placeholders outside quoted text.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves the state unchanged.
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if i > start + 1
                    && let Ok(n) = sql[start + 1..i].parse::<usize>()
                {
                    found.push((start..i, n));
                }
            }
            None => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace each `$N` with its bound value as a quoted text literal, in one pass.
/// Bound text is never rescanned, so a value containing `$1` stays as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>, operators: Arc<Operators>, password: String) -> Self {
        let auth_source = SlotbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(engine, operators)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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
    engine: Arc<Engine>,
    operators: Arc<Operators>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotbookFactory::new(engine, operators, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotNotFound(_) | EngineError::BookingNotFound(_) => "P0002",
        EngineError::SlotFull { .. } => "53400",
        EngineError::InvalidInput(_) => "22023",
        EngineError::IntegrityViolation(_) => "23503",
        EngineError::IoFailure(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
