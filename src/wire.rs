use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
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

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct CourtholdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<CourtholdQueryParser>,
}

impl CourtholdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(CourtholdQueryParser),
        }
    }

    /// Parse and execute one statement, recording query metrics either way.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertCourt { id, name, zone } => {
                engine
                    .create_court(Court { id, name, zone })
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteCourt { id } => {
                engine.delete_court(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertHold {
                request,
                holder_id,
                ttl_ms,
            } => {
                engine
                    .acquire(request, &holder_id, ttl_ms)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertHolds {
                holder_id,
                ttl_ms,
                requests,
            } => {
                let holds = engine
                    .acquire_many(&holder_id, ttl_ms, requests)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(holds.len())))
            }
            Command::InsertFixedHold {
                request,
                holder_id,
                weeks,
                ttl_ms,
            } => {
                let holds = engine
                    .acquire_recurring(request, &holder_id, weeks, ttl_ms)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(holds.len())))
            }
            Command::RenewHold { id } => {
                engine.renew(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteHold { id } => {
                let released = engine.release(id).await.map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(released)),
                ))
            }
            Command::DeleteHolderHolds { holder_id } => {
                let count = engine.release_all(&holder_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(count)))
            }
            Command::InsertBooking { id, hold_id } => {
                engine.promote(hold_id, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Checkout { holder_id } => {
                let bookings = engine.promote_all(&holder_id).await.map_err(engine_err)?;
                Ok(Response::Execution(
                    Tag::new("INSERT").with_rows(bookings.len()),
                ))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectCourts { zone } => {
                let courts = engine.list_courts(zone.as_deref());
                court_rows(courts)
            }
            Command::SelectHolds { id, holder_id } => {
                let holds = match id {
                    Some(id) => engine
                        .get_hold(id)
                        .await
                        .filter(|h| holder_id.as_deref().is_none_or(|x| x == h.holder_id))
                        .into_iter()
                        .collect(),
                    None => {
                        let holder = holder_id.unwrap_or_default();
                        engine.holds_for_holder(&holder).await
                    }
                };
                hold_rows(holds)
            }
            Command::SelectBookings { filter } => {
                let bookings = engine.bookings_for(&filter).await;
                booking_rows(bookings)
            }
            Command::SelectAvailability {
                date,
                range,
                zone,
                weeks,
            } => {
                let courts = engine
                    .available_fixed_courts(zone.as_deref(), date, range, weeks)
                    .await
                    .map_err(engine_err)?;
                let mut priced = Vec::with_capacity(courts.len());
                for court in courts {
                    let segments = engine
                        .quote(court.id, date, range, weeks)
                        .map_err(engine_err)?;
                    let price: Price = segments.iter().map(|s| s.price).sum();
                    priced.push((court, price));
                }
                availability_rows(priced)
            }
            Command::SelectBlockedStartTimes {
                date,
                duration,
                zone,
                weeks,
            } => {
                let starts = engine
                    .unavailable_fixed_start_times(zone.as_deref(), date, duration, weeks)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(blocked_start_times_schema());
                let rows: Vec<PgWireResult<_>> = starts
                    .into_iter()
                    .map(|start| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&format_clock(start))?;
                        encoder.encode_field(&i32::from(start))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectFreeTime { court_id, date } => {
                let free = engine
                    .free_ranges(court_id, date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(free_time_schema());
                let court = court_id.to_string();
                let rows: Vec<PgWireResult<_>> = free
                    .into_iter()
                    .map(|range| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&court)?;
                        encoder.encode_field(&format_clock(range.start))?;
                        encoder.encode_field(&format_clock(range.end))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectPrices {
                court_id,
                date,
                range,
                weeks,
            } => {
                let segments = engine
                    .quote(court_id, date, range, weeks)
                    .map_err(engine_err)?;
                let schema = Arc::new(prices_schema());
                let rows: Vec<PgWireResult<_>> = segments
                    .into_iter()
                    .map(|segment| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&segment.date.to_string())?;
                        encoder.encode_field(&format_clock(segment.range.start))?;
                        encoder.encode_field(&format_clock(segment.range.end))?;
                        encoder.encode_field(&price_field(segment.price))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectCart { holder_id } => {
                let cart = engine.cart(&holder_id).await;
                let schema = Arc::new(carts_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&cart.holder_id)?;
                encoder.encode_field(&i32::try_from(cart.holds.len()).unwrap_or(i32::MAX))?;
                encoder.encode_field(&price_field(cart.total))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

/// Prices go out as INT8.
fn price_field(price: Price) -> i64 {
    i64::try_from(price).unwrap_or(i64::MAX)
}

fn availability_rows(courts: Vec<(Court, Price)>) -> PgWireResult<Response> {
    let schema = Arc::new(availability_schema());
    let rows: Vec<PgWireResult<_>> = courts
        .into_iter()
        .map(|(court, price)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&court.id.to_string())?;
            encoder.encode_field(&court.name)?;
            encoder.encode_field(&court.zone)?;
            encoder.encode_field(&price_field(price))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn court_rows(courts: Vec<Court>) -> PgWireResult<Response> {
    let schema = Arc::new(courts_schema());
    let rows: Vec<PgWireResult<_>> = courts
        .into_iter()
        .map(|court| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&court.id.to_string())?;
            encoder.encode_field(&court.name)?;
            encoder.encode_field(&court.zone)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn hold_rows(holds: Vec<Hold>) -> PgWireResult<Response> {
    let schema = Arc::new(holds_schema());
    let rows: Vec<PgWireResult<_>> = holds
        .into_iter()
        .map(|hold| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&hold.id.to_string())?;
            encoder.encode_field(&hold.court_id.to_string())?;
            encoder.encode_field(&hold.date.to_string())?;
            encoder.encode_field(&format_clock(hold.range.start))?;
            encoder.encode_field(&format_clock(hold.range.end))?;
            encoder.encode_field(&hold.holder_id)?;
            encoder.encode_field(&hold.expires_at)?;
            encoder.encode_field(&price_field(hold.price))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn booking_rows(bookings: Vec<Booking>) -> PgWireResult<Response> {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|booking| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&booking.id.to_string())?;
            encoder.encode_field(&booking.hold_id.to_string())?;
            encoder.encode_field(&booking.court_id.to_string())?;
            encoder.encode_field(&booking.date.to_string())?;
            encoder.encode_field(&format_clock(booking.range.start))?;
            encoder.encode_field(&format_clock(booking.range.end))?;
            encoder.encode_field(&booking.customer_id)?;
            encoder.encode_field(&booking.status.as_str().to_string())?;
            encoder.encode_field(&booking.confirmed_at)?;
            encoder.encode_field(&price_field(booking.price))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn courts_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("name"), text_field("zone")]
}

fn holds_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("court_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
        text_field("holder_id"),
        int8_field("expires_at"),
        int8_field("price"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("hold_id"),
        text_field("court_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
        text_field("customer_id"),
        text_field("status"),
        int8_field("confirmed_at"),
        int8_field("price"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    let mut fields = courts_schema();
    fields.push(int8_field("price"));
    fields
}

fn prices_schema() -> Vec<FieldInfo> {
    vec![
        text_field("date"),
        text_field("start"),
        text_field("end"),
        int8_field("price"),
    ]
}

fn carts_schema() -> Vec<FieldInfo> {
    vec![
        text_field("holder_id"),
        FieldInfo::new("holds".into(), None, None, Type::INT4, FieldFormat::Text),
        int8_field("total"),
    ]
}

fn blocked_start_times_schema() -> Vec<FieldInfo> {
    vec![
        text_field("start"),
        FieldInfo::new("minute".into(), None, None, Type::INT4, FieldFormat::Text),
    ]
}

fn free_time_schema() -> Vec<FieldInfo> {
    vec![text_field("court_id"), text_field("start"), text_field("end")]
}

/// Row description for a SELECT, chosen by the table after FROM.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower
        .split(|c: char| c.is_whitespace() || c == ';')
        .filter(|w| !w.is_empty());
    if words.next() != Some("select") {
        return vec![];
    }
    let table = words.skip_while(|w| *w != "from").nth(1).unwrap_or("");
    match table.trim_matches('"') {
        "courts" => courts_schema(),
        "availability" => availability_schema(),
        "holds" => holds_schema(),
        "bookings" => bookings_schema(),
        "blocked_start_times" => blocked_start_times_schema(),
        "free_time" => free_time_schema(),
        "prices" => prices_schema(),
        "carts" => carts_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CourtholdHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
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
pub struct CourtholdQueryParser;

#[async_trait]
impl QueryParser for CourtholdQueryParser {
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
impl ExtendedQueryHandler for CourtholdHandler {
    type Statement = String;
    type QueryParser = CourtholdQueryParser;

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
        let sql = substitute_params(portal);
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

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound parameters (text format) as quoted literals.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so `$1` never clobbers the prefix of `$10`.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &value);
    }
    result
}

// ── Auth ─────────────────────────────────────────────────────────

/// One shared password for every user name.
#[derive(Debug)]
pub struct CourtholdAuthSource {
    password: String,
}

#[async_trait]
impl AuthSource for CourtholdAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CourtholdFactory {
    handler: Arc<CourtholdHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<CourtholdAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl CourtholdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(CourtholdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                CourtholdAuthSource { password },
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtholdFactory {
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
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(CourtholdFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM courts"), 0);
        assert_eq!(count_params("INSERT INTO bookings VALUES ($2, $1)"), 2);
        assert_eq!(count_params("SELECT * FROM holds WHERE holder_id = $12"), 12);
        assert_eq!(count_params("SELECT '$' FROM courts"), 0);
    }

    #[test]
    fn result_schema_follows_from_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("SELECT * FROM courts WHERE zone = $1"), ["id", "name", "zone"]);
        assert_eq!(
            names("select * from availability where date = $1"),
            ["id", "name", "zone", "price"]
        );
        assert_eq!(names("SELECT * FROM holds WHERE holder_id = $1").len(), 8);
        assert_eq!(names("SELECT * FROM bookings").len(), 10);
        assert_eq!(names("SELECT * FROM prices WHERE court_id = $1"), ["date", "start", "end", "price"]);
        assert_eq!(names("SELECT * FROM carts WHERE holder_id = $1"), ["holder_id", "holds", "total"]);
        assert_eq!(names("SELECT * FROM free_time WHERE court_id = $1"), ["court_id", "start", "end"]);
        assert!(names("INSERT INTO holds VALUES ($1)").is_empty());
        assert!(names("DELETE FROM bookings WHERE id = $1").is_empty());
    }
}
