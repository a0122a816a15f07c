use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Which appointments a history query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentFilter {
    Id(Ulid),
    Client(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectSlots {
        date: NaiveDate,
        service_id: Ulid,
    },
    InsertAppointment {
        id: Ulid,
        client_id: Ulid,
        service_id: Ulid,
        start: Ms,
        origin: Origin,
        notes: Option<String>,
    },
    InsertCancellation {
        appointment_id: Ulid,
        actor: Actor,
        reason: Option<String>,
    },
    InsertReschedule {
        appointment_id: Ulid,
        start: Ms,
    },
    InsertTransition {
        appointment_id: Ulid,
        status: AppointmentStatus,
    },
    InsertPayment {
        appointment_id: Ulid,
        outcome: PaymentOutcome,
    },
    InsertHidden {
        client_id: Ulid,
        appointment_id: Ulid,
    },
    SelectAppointments {
        filter: AppointmentFilter,
    },
    InsertSubscription {
        id: Ulid,
        client_id: Ulid,
        plan_id: Ulid,
        start_date: NaiveDate,
        commitment_end: Option<NaiveDate>,
    },
    InsertPlanChange {
        subscription_id: Ulid,
        plan_id: Ulid,
    },
    InsertSubscriptionStatus {
        subscription_id: Ulid,
        status: SubscriptionStatus,
    },
    DeleteSubscription {
        id: Ulid,
    },
    SelectEntitlement {
        subscription_id: Ulid,
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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "appointments" => {
            let row = Row::from_insert(
                "appointments",
                insert,
                &["id", "client_id", "service_id", "start", "origin", "notes"],
            )?;
            Ok(Command::InsertAppointment {
                id: parse_ulid_expr(row.required("id")?)?,
                client_id: parse_ulid_expr(row.required("client_id")?)?,
                service_id: parse_ulid_expr(row.required("service_id")?)?,
                start: parse_i64_expr(row.required("start")?)?,
                origin: parse_origin(row.required("origin")?)?,
                notes: row.optional("notes").map(parse_string_expr).transpose()?,
            })
        }
        "cancellations" => {
            let row = Row::from_insert(
                "cancellations",
                insert,
                &["appointment_id", "actor", "reason"],
            )?;
            Ok(Command::InsertCancellation {
                appointment_id: parse_ulid_expr(row.required("appointment_id")?)?,
                actor: parse_actor(row.required("actor")?)?,
                reason: row.optional("reason").map(parse_string_expr).transpose()?,
            })
        }
        "reschedules" => {
            let row = Row::from_insert("reschedules", insert, &["appointment_id", "start"])?;
            Ok(Command::InsertReschedule {
                appointment_id: parse_ulid_expr(row.required("appointment_id")?)?,
                start: parse_i64_expr(row.required("start")?)?,
            })
        }
        "transitions" => {
            let row = Row::from_insert("transitions", insert, &["appointment_id", "status"])?;
            Ok(Command::InsertTransition {
                appointment_id: parse_ulid_expr(row.required("appointment_id")?)?,
                status: parse_transition_target(row.required("status")?)?,
            })
        }
        "payments" => {
            let row = Row::from_insert("payments", insert, &["appointment_id", "outcome"])?;
            Ok(Command::InsertPayment {
                appointment_id: parse_ulid_expr(row.required("appointment_id")?)?,
                outcome: parse_outcome(row.required("outcome")?)?,
            })
        }
        "hidden_appointments" => {
            let row = Row::from_insert(
                "hidden_appointments",
                insert,
                &["client_id", "appointment_id"],
            )?;
            Ok(Command::InsertHidden {
                client_id: parse_ulid_expr(row.required("client_id")?)?,
                appointment_id: parse_ulid_expr(row.required("appointment_id")?)?,
            })
        }
        "subscriptions" => {
            let row = Row::from_insert(
                "subscriptions",
                insert,
                &["id", "client_id", "plan_id", "start_date", "commitment_end"],
            )?;
            Ok(Command::InsertSubscription {
                id: parse_ulid_expr(row.required("id")?)?,
                client_id: parse_ulid_expr(row.required("client_id")?)?,
                plan_id: parse_ulid_expr(row.required("plan_id")?)?,
                start_date: parse_date_expr(row.required("start_date")?)?,
                commitment_end: row.optional("commitment_end").map(parse_date_expr).transpose()?,
            })
        }
        "plan_changes" => {
            let row = Row::from_insert("plan_changes", insert, &["subscription_id", "plan_id"])?;
            Ok(Command::InsertPlanChange {
                subscription_id: parse_ulid_expr(row.required("subscription_id")?)?,
                plan_id: parse_ulid_expr(row.required("plan_id")?)?,
            })
        }
        "subscription_status" => {
            let row = Row::from_insert(
                "subscription_status",
                insert,
                &["subscription_id", "status"],
            )?;
            Ok(Command::InsertSubscriptionStatus {
                subscription_id: parse_ulid_expr(row.required("subscription_id")?)?,
                status: parse_subscription_status(row.required("status")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "subscriptions" => Ok(Command::DeleteSubscription { id }),
        "appointments" => Err(SqlError::Unsupported(
            "appointments are never deleted; insert into cancellations or hidden_appointments".into(),
        )),
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

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &'static str| filters.get(col).copied().ok_or(SqlError::MissingFilter(col));

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            date: parse_date_expr(filter("date")?)?,
            service_id: parse_ulid_expr(filter("service_id")?)?,
        }),
        "appointments" => {
            let filter = if let Some(id) = filters.get("id") {
                AppointmentFilter::Id(parse_ulid_expr(id)?)
            } else if let Some(client) = filters.get("client_id") {
                AppointmentFilter::Client(parse_ulid_expr(client)?)
            } else {
                return Err(SqlError::MissingFilter("id or client_id"));
            };
            Ok(Command::SelectAppointments { filter })
        }
        "entitlement" => Ok(Command::SelectEntitlement {
            subscription_id: parse_ulid_expr(filter("subscription_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND …` into column → value expression.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) -> Result<(), SqlError> {
    match expr {
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
            out.insert(col, right.as_ref());
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

/// One VALUES row addressed by column name. Without a column list the values are
/// read positionally in the table's canonical order.
struct Row<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn from_insert(
        table: &'static str,
        insert: &'a ast::Insert,
        canonical: &[&'static str],
    ) -> Result<Self, SqlError> {
        let rows = extract_all_insert_rows(insert)?;
        if rows.len() != 1 {
            return Err(SqlError::Unsupported(format!(
                "{table}: one row per statement, got {}",
                rows.len()
            )));
        }
        let row = &rows[0];
        let values = if insert.columns.is_empty() {
            if row.len() > canonical.len() {
                return Err(SqlError::WrongArity(table, canonical.len(), row.len()));
            }
            canonical
                .iter()
                .zip(row)
                .map(|(col, expr)| (col.to_string(), expr))
                .collect()
        } else {
            if insert.columns.len() != row.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), row.len()));
            }
            insert
                .columns
                .iter()
                .zip(row)
                .map(|(col, expr)| (column_key(col), expr))
                .collect()
        };
        Ok(Self { table, values })
    }

    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        match self.values.get(col) {
            Some(expr) if !is_null(expr) => Ok(expr),
            _ => Err(SqlError::MissingColumn(self.table, col)),
        }
    }

    /// Absent and NULL both read as `None`.
    fn optional(&self, col: &str) -> Option<&'a Expr> {
        self.values.get(col).copied().filter(|expr| !is_null(expr))
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
}

/// Unquoted, lowercased last segment of a column reference.
fn column_key(col: &impl std::fmt::Display) -> String {
    let text = col.to_string();
    let last = text.rsplit('.').next().unwrap_or(&text);
    last.trim_matches('"').to_lowercase()
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// ISO `YYYY-MM-DD` string.
fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let text = parse_string_expr(expr)?;
    text.parse()
        .map_err(|e| SqlError::Parse(format!("bad date {text}: {e}")))
}

/// Case-insensitive label lookup.
fn parse_label<T: Copy>(expr: &Expr, what: &str, options: &[(&str, T)]) -> Result<T, SqlError> {
    let raw = parse_string_expr(expr)?;
    let wanted = raw.to_lowercase();
    options
        .iter()
        .find(|(label, _)| *label == wanted)
        .map(|(_, v)| *v)
        .ok_or_else(|| SqlError::Parse(format!("unknown {what}: {raw}")))
}

fn parse_origin(expr: &Expr) -> Result<Origin, SqlError> {
    parse_label(
        expr,
        "origin",
        &[
            ("subscription", Origin::Subscription),
            ("single", Origin::Single),
            ("voucher", Origin::Voucher),
            ("admin_created", Origin::AdminCreated),
        ],
    )
}

fn parse_actor(expr: &Expr) -> Result<Actor, SqlError> {
    parse_label(
        expr,
        "actor",
        &[
            ("client", Actor::Client),
            ("staff", Actor::Staff),
            ("system", Actor::System),
        ],
    )
}

/// Cancellation has its own table, so only the forward edges are accepted here.
fn parse_transition_target(expr: &Expr) -> Result<AppointmentStatus, SqlError> {
    parse_label(
        expr,
        "transition status",
        &[
            ("confirmed", AppointmentStatus::Confirmed),
            ("completed", AppointmentStatus::Completed),
            ("no_show", AppointmentStatus::NoShow),
        ],
    )
}

fn parse_outcome(expr: &Expr) -> Result<PaymentOutcome, SqlError> {
    parse_label(
        expr,
        "payment outcome",
        &[
            ("succeeded", PaymentOutcome::Succeeded),
            ("failed", PaymentOutcome::Failed),
        ],
    )
}

fn parse_subscription_status(expr: &Expr) -> Result<SubscriptionStatus, SqlError> {
    parse_label(
        expr,
        "subscription status",
        &[
            ("active", SubscriptionStatus::Active),
            ("past_due", SubscriptionStatus::PastDue),
        ],
    )
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
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
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing value for {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
