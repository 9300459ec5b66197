use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr,
    Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

const ROOM_COLUMNS: &[&str] = &["room_no", "capacity"];
const BOOKING_COLUMNS: &[&str] = &["room_id", "guest_id", "starts_at", "ends_at", "status"];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom(NewRoom),
    UpdateRoom {
        id: Ulid,
        changes: RoomChanges,
    },
    DeleteRoom {
        id: Ulid,
    },
    SelectRooms {
        id: Option<Ulid>,
    },
    InsertBooking(NewBooking),
    UpdateBooking {
        id: Ulid,
        changes: BookingChanges,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        id: Option<Ulid>,
        query: BookingQuery,
    },
    SelectConflicts {
        room_id: Ulid,
        starts_at: String,
        ends_at: String,
        exclude_id: Option<Ulid>,
    },
}

/// Parse every statement in `sql`. An empty string yields no commands.
pub fn parse_statements(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    stmts.iter().map(parse_statement).collect()
}

/// Parse exactly one statement.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_statements(sql)?;
    match commands.len() {
        0 => Err(SqlError::Empty),
        1 => Ok(commands.remove(0)),
        n => Err(SqlError::Unsupported(format!("{n} statements in one query"))),
    }
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column → value pairs of a single-row INSERT.
struct Row<'a> {
    table: &'static str,
    fields: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.fields.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn insert_row<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    known: &[&str],
) -> Result<Row<'a>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let values = match rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    // Without a column list, values are positional in the table's order.
    let columns: Vec<String> = if insert.columns.is_empty() {
        known.iter().take(values.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    if let Some(unknown) = columns.iter().find(|c| !known.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(table, unknown.clone()));
    }
    Ok(Row {
        table,
        fields: columns.into_iter().zip(values.iter()).collect(),
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "rooms" => {
            let row = insert_row(insert, "rooms", ROOM_COLUMNS)?;
            Ok(Command::InsertRoom(NewRoom {
                room_no: parse_text(row.required("room_no")?)?,
                capacity: parse_i64_expr(row.required("capacity")?)?,
            }))
        }
        "bookings" => {
            let row = insert_row(insert, "bookings", BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking(NewBooking {
                room_id: parse_ulid_expr(row.required("room_id")?)?,
                guest_id: parse_text(row.required("guest_id")?)?,
                starts_at: parse_text(row.required("starts_at")?)?,
                ends_at: parse_text(row.required("ends_at")?)?,
                status: row.get("status").map(parse_text_or_null).transpose()?.flatten(),
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE / DELETE ───────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut sets = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((column, &assignment.value));
    }

    match table.as_str() {
        "rooms" => {
            let mut changes = RoomChanges::default();
            for (column, value) in sets {
                match column.as_str() {
                    "room_no" => changes.room_no = Patch::Set(parse_text(value)?),
                    "capacity" => changes.capacity = Patch::Set(parse_i64_expr(value)?),
                    other => return Err(SqlError::UnknownColumn("rooms", other.to_string())),
                }
            }
            Ok(Command::UpdateRoom { id, changes })
        }
        "bookings" => {
            let mut changes = BookingChanges::default();
            for (column, value) in sets {
                match column.as_str() {
                    "room_id" => changes.room_id = Patch::Set(parse_ulid_expr(value)?),
                    "guest_id" => changes.guest_id = Patch::Set(parse_text(value)?),
                    "starts_at" => changes.starts_at = Patch::Set(parse_text(value)?),
                    "ends_at" => changes.ends_at = Patch::Set(parse_text(value)?),
                    "status" => changes.status = Patch::Set(parse_text(value)?),
                    other => return Err(SqlError::UnknownColumn("bookings", other.to_string())),
                }
            }
            Ok(Command::UpdateBooking { id, changes })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(delete.selection.as_ref())?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    Gt,
    Lt,
}

/// One `column <op> value` conjunct of a WHERE clause.
struct Predicate<'a> {
    column: String,
    cmp: Cmp,
    value: &'a Expr,
}

fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                BinaryOperator::And => {
                    collect_predicates(left, out)?;
                    return collect_predicates(right, out);
                }
                BinaryOperator::Eq => Cmp::Eq,
                BinaryOperator::Gt => Cmp::Gt,
                BinaryOperator::Lt => Cmp::Lt,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push(Predicate { column, cmp, value: right });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn limit_offset(query: &ast::Query) -> Result<(Option<i64>, Option<i64>), SqlError> {
    match &query.limit_clause {
        None => Ok((None, None)),
        Some(LimitClause::LimitOffset { limit, offset, .. }) => Ok((
            limit.as_ref().map(parse_i64_expr).transpose()?,
            offset.as_ref().map(|o| parse_i64_expr(&o.value)).transpose()?,
        )),
        Some(LimitClause::OffsetCommaLimit { offset, limit }) => {
            Ok((Some(parse_i64_expr(limit)?), Some(parse_i64_expr(offset)?)))
        }
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

    let mut predicates = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut predicates)?;
    }
    let (limit, offset) = limit_offset(query)?;

    match table.as_str() {
        "rooms" => {
            let mut id = None;
            for p in predicates {
                match (p.column.as_str(), p.cmp) {
                    ("id", Cmp::Eq) => id = Some(parse_ulid_expr(p.value)?),
                    (other, _) => return Err(SqlError::UnsupportedFilter("rooms", other.to_string())),
                }
            }
            Ok(Command::SelectRooms { id })
        }
        "bookings" => {
            let mut id = None;
            let mut filter = BookingQuery { limit, offset, ..Default::default() };
            for p in predicates {
                match (p.column.as_str(), p.cmp) {
                    ("id", Cmp::Eq) => id = Some(parse_ulid_expr(p.value)?),
                    ("room_id", Cmp::Eq) => filter.room_id = Some(parse_ulid_expr(p.value)?),
                    ("status", Cmp::Eq) => filter.status = Some(parse_text(p.value)?),
                    ("ends_at", Cmp::Gt) => filter.from = Some(parse_text(p.value)?),
                    ("starts_at", Cmp::Lt) => filter.to = Some(parse_text(p.value)?),
                    (other, _) => return Err(SqlError::UnsupportedFilter("bookings", other.to_string())),
                }
            }
            Ok(Command::SelectBookings { id, query: filter })
        }
        "conflicts" => {
            let (mut room_id, mut starts_at, mut ends_at, mut exclude_id) = (None, None, None, None);
            for p in predicates {
                match (p.column.as_str(), p.cmp) {
                    ("room_id", Cmp::Eq) => room_id = Some(parse_ulid_expr(p.value)?),
                    ("starts_at", Cmp::Eq) => starts_at = Some(parse_text(p.value)?),
                    ("ends_at", Cmp::Eq) => ends_at = Some(parse_text(p.value)?),
                    ("exclude_id", Cmp::Eq) => exclude_id = parse_ulid_or_null(p.value)?,
                    (other, _) => return Err(SqlError::UnsupportedFilter("conflicts", other.to_string())),
                }
            }
            Ok(Command::SelectConflicts {
                room_id: room_id.ok_or(SqlError::MissingFilter("room_id"))?,
                starts_at: starts_at.ok_or(SqlError::MissingFilter("starts_at"))?,
                ends_at: ends_at.ok_or(SqlError::MissingFilter("ends_at"))?,
                exclude_id,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

/// `WHERE id = '<ulid>'`, nothing else.
fn extract_where_id(selection: Option<&Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        Some(Expr::Nested(inner)) => extract_where_id(Some(inner.as_ref())),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let text = parse_text(expr)?;
    Ulid::from_string(&text).map_err(|e| SqlError::Parse(format!("bad ULID {text}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

/// String literal, or a bare number taken verbatim (`room_no = 101`).
fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_text(expr).map(Some),
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
    UnsupportedFilter(&'static str, String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: {c} is required"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::UnsupportedFilter(t, c) => write!(f, "{t}: cannot filter on {c}"),
        }
    }
}

impl std::error::Error for SqlError {}
