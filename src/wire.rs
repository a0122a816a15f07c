use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use tracing::{debug, error};

use crate::auth::SalondAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, AppointmentFilter, Command};

pub struct SalondHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SalondQueryParser>,
}

impl SalondHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SalondQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::SelectSlots { date, service_id } => {
                let board = engine
                    .get_available_slots(date, service_id)
                    .await
                    .map_err(engine_err)?;
                let duration = engine
                    .catalog()
                    .service(&service_id)
                    .map(|s| s.duration_minutes as Ms * MINUTE_MS)
                    .unwrap_or_default();
                let mut slots: Vec<(Ms, bool)> = board
                    .available
                    .iter()
                    .map(|s| (*s, false))
                    .chain(board.booked.iter().map(|s| (*s, true)))
                    .collect();
                slots.sort_by_key(|(start, _)| *start);

                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|(start, booked)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&start)?;
                        encoder.encode_field(&(start + duration))?;
                        encoder.encode_field(&booked)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::InsertAppointment {
                id,
                client_id,
                service_id,
                start,
                origin,
                notes,
            } => {
                engine
                    .create_appointment(id, client_id, service_id, start, origin, notes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertCancellation {
                appointment_id,
                actor,
                reason,
            } => {
                engine
                    .cancel_appointment(appointment_id, actor, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertReschedule {
                appointment_id,
                start,
            } => {
                engine
                    .reschedule_appointment(appointment_id, start)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertTransition {
                appointment_id,
                status,
            } => {
                engine
                    .transition_appointment(appointment_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertPayment {
                appointment_id,
                outcome,
            } => {
                engine
                    .record_payment(appointment_id, outcome)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertHidden {
                client_id,
                appointment_id,
            } => {
                engine
                    .hide_from_history(client_id, appointment_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::SelectAppointments { filter } => {
                let appointments: Vec<Appointment> = match filter {
                    AppointmentFilter::Id(id) => {
                        engine.get_appointment(&id).await.into_iter().collect()
                    }
                    AppointmentFilter::Client(client_id) => engine.client_history(&client_id).await,
                };
                let schema = Arc::new(appointments_schema());
                let rows: Vec<PgWireResult<_>> = appointments
                    .iter()
                    .map(|appt| encode_appointment(&schema, appt))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::InsertSubscription {
                id,
                client_id,
                plan_id,
                start_date,
                commitment_end,
            } => {
                engine
                    .subscribe(id, client_id, plan_id, start_date, commitment_end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertPlanChange {
                subscription_id,
                plan_id,
            } => {
                engine
                    .change_plan(subscription_id, plan_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::InsertSubscriptionStatus {
                subscription_id,
                status,
            } => {
                engine
                    .set_subscription_status(subscription_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted()])
            }
            Command::DeleteSubscription { id } => {
                engine.cancel_subscription(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectEntitlement { subscription_id } => {
                let remaining = engine
                    .get_remaining_entitlement(subscription_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(entitlement_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&subscription_id.to_string())?;
                encoder.encode_field(&(remaining.monthly as i64))?;
                encoder.encode_field(&remaining.weekly.map(i64::from))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("booked", Type::BOOL),
    ]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("client_id", Type::VARCHAR),
        text_field("service_id", Type::VARCHAR),
        text_field("subscription_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("origin", Type::VARCHAR),
        text_field("payment", Type::VARCHAR),
        text_field("notes", Type::VARCHAR),
        text_field("canceled_by", Type::VARCHAR),
        text_field("penalized", Type::BOOL),
    ]
}

fn entitlement_schema() -> Vec<FieldInfo> {
    vec![
        text_field("subscription_id", Type::VARCHAR),
        text_field("monthly", Type::INT8),
        text_field("weekly", Type::INT8),
    ]
}

fn encode_appointment(
    schema: &Arc<Vec<FieldInfo>>,
    appt: &Appointment,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&appt.id.to_string())?;
    encoder.encode_field(&appt.client_id.to_string())?;
    encoder.encode_field(&appt.service_id.to_string())?;
    encoder.encode_field(&appt.subscription_id.map(|id| id.to_string()))?;
    encoder.encode_field(&appt.span.start)?;
    encoder.encode_field(&appt.span.end)?;
    encoder.encode_field(&appt.status.label())?;
    encoder.encode_field(&appt.origin.label())?;
    encoder.encode_field(&appt.payment.label())?;
    encoder.encode_field(&appt.notes)?;
    encoder.encode_field(&appt.cancellation.as_ref().map(|c| c.actor.label()))?;
    encoder.encode_field(&appt.cancellation.as_ref().map(|c| c.penalized))?;
    Ok(encoder.take_row())
}

/// Result columns for a statement, picked by the table it reads.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return Vec::new();
    }
    if upper.contains("SLOTS") {
        slots_schema()
    } else if upper.contains("ENTITLEMENT") {
        entitlement_schema()
    } else if upper.contains("APPOINTMENTS") {
        appointments_schema()
    } else {
        Vec::new()
    }
}

#[async_trait]
impl SimpleQueryHandler for SalondHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SalondQueryParser;

#[async_trait]
impl QueryParser for SalondQueryParser {
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
impl ExtendedQueryHandler for SalondHandler {
    type Statement = String;
    type QueryParser = SalondQueryParser;

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
        let mut responses = self.run(&sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
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

/// Highest `$N` placeholder in the SQL string.
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

/// Inline bound text parameters as quoted literals, highest index first so
/// `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        sql = sql.replace(&placeholder, &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SalondFactory {
    handler: Arc<SalondHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SalondAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SalondFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(SalondHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SalondAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SalondFactory {
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
    let factory = SalondFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine outcome. Clients branch on the code, not the text.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotConflict(_) => "23505",
        EngineError::AlreadyExists(_) => "42710",
        EngineError::EntitlementDenied(_) => "SB001",
        EngineError::RescheduleBlocked { .. } => "SB002",
        EngineError::AlreadyTerminal(_) => "SB003",
        EngineError::ClosedDay(_) => "SB004",
        EngineError::NotBookable(_) => "SB005",
        EngineError::InvalidTransition { .. } => "SB006",
        EngineError::CommitmentActive(_) => "SB007",
        EngineError::SubscriptionInactive(_) => "SB008",
        EngineError::NotFound(_) => "02000",
        EngineError::NotOwner(_) => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Integrity(_) | EngineError::JournalError(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let message = if e.is_user_facing() {
        debug!("request refused: {e}");
        e.to_string()
    } else {
        error!("request failed: {e}");
        "internal error".to_string()
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        message,
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
