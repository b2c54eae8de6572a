use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;
use thiserror::Error;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSlot {
        slot: NewSlot,
        returning: bool,
    },
    /// `user_id` is `None` when the statement leaves it to the connection user.
    InsertBooking {
        slot_id: SlotId,
        user_id: Option<String>,
        address: Option<String>,
        note: Option<String>,
        returning: bool,
    },
    CancelBooking {
        id: BookingId,
    },
    SelectSlots {
        date: Option<NaiveDate>,
    },
    SelectBookableSlots {
        date: Option<NaiveDate>,
    },
    SelectBookableDays,
    SelectBooking {
        id: BookingId,
    },
    SelectBookingsForSlot {
        slot_id: SlotId,
    },
}

impl Command {
    /// Statements only operators may run.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Command::InsertSlot { .. } | Command::CancelBooking { .. })
    }

    /// Whether `caller` needs operator rights to run this. Booking on behalf of
    /// another user counts as privileged.
    pub fn requires_operator(&self, caller: &str) -> bool {
        match self {
            Command::InsertBooking { user_id: Some(user), .. } => user.trim() != caller,
            other => other.is_privileged(),
        }
    }

    /// Shape of the rows this command returns, if any.
    pub fn row_shape(&self) -> Option<RowShape> {
        match self {
            Command::InsertSlot { returning, .. } => returning.then_some(RowShape::Slots),
            Command::InsertBooking { returning, .. } => returning.then_some(RowShape::Bookings),
            Command::CancelBooking { .. } => None,
            Command::SelectSlots { .. } | Command::SelectBookableSlots { .. } => Some(RowShape::Slots),
            Command::SelectBookableDays => Some(RowShape::Days),
            Command::SelectBooking { .. } | Command::SelectBookingsForSlot { .. } => Some(RowShape::Bookings),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    Slots,
    Bookings,
    Days,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == ';' || c.is_whitespace()) {
        return Err(SqlError::Empty);
    }
    if first_word_is(trimmed, "update") {
        return parse_update(trimmed);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(parse_err)?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Row shape of a statement that has not had its `$N` parameters bound yet.
pub fn describe_rows(sql: &str) -> Option<RowShape> {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    if normalized.starts_with("select") {
        if normalized.contains("bookable_days") {
            Some(RowShape::Days)
        } else if normalized.contains("bookable_slots") || normalized.contains("from slots") {
            Some(RowShape::Slots)
        } else if normalized.contains("from bookings") {
            Some(RowShape::Bookings)
        } else {
            None
        }
    } else if normalized.starts_with("insert") && normalized.contains("returning") {
        if normalized.contains("into slots") {
            Some(RowShape::Slots)
        } else if normalized.contains("into bookings") {
            Some(RowShape::Bookings)
        } else {
            None
        }
    } else {
        None
    }
}

fn first_word_is(sql: &str, word: &str) -> bool {
    sql.split_whitespace()
        .next()
        .is_some_and(|w| w.eq_ignore_ascii_case(word))
}

// ── INSERT ────────────────────────────────────────────────────

const SLOT_COLUMNS: [&str; 5] = ["date", "time_start", "time_end", "capacity", "zone"];
const BOOKING_COLUMNS: [&str; 4] = ["slot_id", "user_id", "address", "note"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let names: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let returning = insert.returning.is_some();

    match table.as_str() {
        "slots" => {
            let row = InsertRow::new(&names, &SLOT_COLUMNS, &values)?;
            let slot = NewSlot {
                date: parse_date(row.required("date")?)?,
                time_start: parse_time(row.required("time_start")?)?,
                time_end: parse_time(row.required("time_end")?)?,
                capacity: parse_u32(row.required("capacity")?)?,
                zone: row.optional("zone").map(parse_text_or_null).transpose()?.flatten(),
            };
            Ok(Command::InsertSlot { slot, returning })
        }
        "bookings" => {
            let row = InsertRow::new(&names, &BOOKING_COLUMNS, &values)?;
            let text = |col| row.optional(col).map(parse_text_or_null).transpose().map(Option::flatten);
            Ok(Command::InsertBooking {
                slot_id: parse_i64(row.required("slot_id")?)?,
                user_id: text("user_id")?,
                address: text("address")?,
                note: text("note")?,
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Values of one VALUES row, keyed by column name.
struct InsertRow<'a> {
    cells: Vec<(&'static str, &'a Expr)>,
}

impl<'a> InsertRow<'a> {
    /// Pair `values` with the named columns, or with `known` in order when none are named.
    fn new(names: &[String], known: &[&'static str], values: &'a [Expr]) -> Result<Self, SqlError> {
        let mut cells = Vec::with_capacity(values.len());
        if names.is_empty() {
            if values.len() > known.len() {
                return Err(SqlError::Parse(format!(
                    "expected at most {} values, got {}",
                    known.len(),
                    values.len()
                )));
            }
            cells.extend(known.iter().copied().zip(values));
        } else {
            if names.len() != values.len() {
                return Err(SqlError::Parse(format!(
                    "{} columns but {} values",
                    names.len(),
                    values.len()
                )));
            }
            for (name, value) in names.iter().zip(values) {
                let col = known
                    .iter()
                    .copied()
                    .find(|k| k == name)
                    .ok_or_else(|| SqlError::UnknownColumn(name.clone()))?;
                cells.push((col, value));
            }
        }
        Ok(Self { cells })
    }

    fn optional(&self, col: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(c, _)| *c == col).map(|(_, e)| *e)
    }

    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(col).ok_or(SqlError::MissingColumn(col))
    }
}

// ── UPDATE ────────────────────────────────────────────────────

/// `UPDATE bookings SET status = 'cancelled' WHERE id = N`, the only accepted update.
fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(sql).map_err(parse_err)?;

    if !parser.parse_keyword(Keyword::UPDATE) {
        return Err(SqlError::Parse("expected UPDATE".into()));
    }
    let name = parser.parse_object_name(false).map_err(parse_err)?;
    let table = object_name_last(&name).ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    if !parser.parse_keyword(Keyword::SET) {
        return Err(SqlError::Parse("expected SET".into()));
    }
    let assignments = parser
        .parse_comma_separated(Parser::parse_assignment)
        .map_err(parse_err)?;
    if !parser.parse_keyword(Keyword::WHERE) {
        return Err(SqlError::MissingFilter("id"));
    }
    let selection = parser.parse_expr().map_err(parse_err)?;
    while parser.consume_token(&Token::SemiColon) {}
    if parser.peek_token().token != Token::EOF {
        return Err(SqlError::Parse("unexpected input after WHERE clause".into()));
    }

    let mut status = None;
    for assignment in &assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match column.as_deref() {
            Some("status") => {
                let text = parse_text(&assignment.value)?;
                status = Some(
                    BookingStatus::parse(&text)
                        .ok_or_else(|| SqlError::Parse(format!("bad booking status: {text}")))?,
                );
            }
            Some(other) => return Err(SqlError::Unsupported(format!("updating bookings.{other}"))),
            None => return Err(SqlError::Unsupported("tuple assignment".into())),
        }
    }

    match status {
        Some(BookingStatus::Cancelled) => Ok(Command::CancelBooking {
            id: extract_where_eq(&selection, "id")?,
        }),
        Some(BookingStatus::Confirmed) => Err(SqlError::Unsupported(
            "bookings can only be set to 'cancelled'".into(),
        )),
        None => Err(SqlError::MissingColumn("status")),
    }
}

// ── SELECT ────────────────────────────────────────────────────

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
    let find = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e);
    let reject_others = |allowed: &[&str]| match filters.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
        Some((c, _)) => Err(SqlError::UnknownColumn(c.clone())),
        None => Ok(()),
    };

    match table.as_str() {
        "slots" => {
            reject_others(&["date"])?;
            Ok(Command::SelectSlots {
                date: find("date").map(parse_date).transpose()?,
            })
        }
        "bookable_slots" => {
            reject_others(&["date"])?;
            Ok(Command::SelectBookableSlots {
                date: find("date").map(parse_date).transpose()?,
            })
        }
        "bookable_days" => {
            reject_others(&[])?;
            Ok(Command::SelectBookableDays)
        }
        "bookings" => {
            reject_others(&["id", "slot_id"])?;
            match (find("id"), find("slot_id")) {
                (Some(id), _) => Ok(Command::SelectBooking { id: parse_i64(id)? }),
                (None, Some(slot_id)) => Ok(Command::SelectBookingsForSlot {
                    slot_id: parse_i64(slot_id)?,
                }),
                (None, None) => Err(SqlError::MissingFilter("id or slot_id")),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y` into `(column, value)` pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn parse_err(e: ParserError) -> SqlError {
    SqlError::Parse(e.to_string())
}

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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
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

fn extract_where_eq(selection: &Expr, column: &'static str) -> Result<i64, SqlError> {
    match selection {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => parse_i64(right),
        _ => Err(SqlError::MissingFilter(column)),
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

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr)?;
    let t = s.trim();
    NaiveTime::parse_from_str(t, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
