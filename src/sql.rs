use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{BookingFilter, HoldRequest};
use crate::limits::DEFAULT_RECURRING_WEEKS;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCourt {
        id: Ulid,
        name: Option<String>,
        zone: Option<String>,
    },
    DeleteCourt {
        id: Ulid,
    },
    InsertHold {
        request: HoldRequest,
        holder_id: String,
        ttl_ms: Option<Ms>,
    },
    /// Multi-row INSERT INTO holds: one cart, acquired all-or-nothing.
    InsertHolds {
        holder_id: String,
        ttl_ms: Option<Ms>,
        requests: Vec<HoldRequest>,
    },
    InsertFixedHold {
        request: HoldRequest,
        holder_id: String,
        weeks: u32,
        ttl_ms: Option<Ms>,
    },
    RenewHold {
        id: Ulid,
    },
    DeleteHold {
        id: Ulid,
    },
    DeleteHolderHolds {
        holder_id: String,
    },
    InsertBooking {
        id: Ulid,
        hold_id: Ulid,
    },
    Checkout {
        holder_id: String,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectCourts {
        zone: Option<String>,
    },
    SelectHolds {
        id: Option<Ulid>,
        holder_id: Option<String>,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    /// `weeks > 1` asks for fixed courts: free on every weekly date.
    SelectAvailability {
        date: NaiveDate,
        range: TimeRange,
        zone: Option<String>,
        weeks: u32,
    },
    SelectBlockedStartTimes {
        date: NaiveDate,
        duration: Minute,
        zone: Option<String>,
        weeks: u32,
    },
    SelectPrices {
        court_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
        weeks: u32,
    },
    SelectCart {
        holder_id: String,
    },
    SelectFreeTime {
        court_id: Ulid,
        date: NaiveDate,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    let values = &rows[0];

    match table.as_str() {
        "courts" => {
            require("courts", values, 1)?;
            Ok(Command::InsertCourt {
                id: parse_ulid(&values[0])?,
                name: values.get(1).map(parse_text_or_null).transpose()?.flatten(),
                zone: values.get(2).map(parse_text_or_null).transpose()?.flatten(),
            })
        }
        "holds" => {
            let mut parsed = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let hold = parse_hold_row(row)
                    .map_err(|e| if rows.len() > 1 { e.in_row(i) } else { e })?;
                parsed.push(hold);
            }
            if parsed.len() == 1 {
                let (request, holder_id, ttl_ms) = parsed.remove(0);
                return Ok(Command::InsertHold {
                    request,
                    holder_id,
                    ttl_ms,
                });
            }
            let (_, holder_id, ttl_ms) = parsed[0].clone();
            if parsed.iter().any(|(_, h, t)| *h != holder_id || *t != ttl_ms) {
                return Err(SqlError::Parse(
                    "all rows of a cart must share holder_id and ttl_ms".into(),
                ));
            }
            Ok(Command::InsertHolds {
                holder_id,
                ttl_ms,
                requests: parsed.into_iter().map(|(r, _, _)| r).collect(),
            })
        }
        "fixed_holds" => {
            let (request, holder_id, _) = parse_hold_row(&values[..values.len().min(6)])?;
            let weeks = match values.get(6) {
                Some(expr) => parse_u32_or_null(expr)?.unwrap_or(DEFAULT_RECURRING_WEEKS),
                None => DEFAULT_RECURRING_WEEKS,
            };
            let ttl_ms = values.get(7).map(parse_i64_or_null).transpose()?.flatten();
            Ok(Command::InsertFixedHold {
                request,
                holder_id,
                weeks,
                ttl_ms,
            })
        }
        "renewals" => {
            require("renewals", values, 1)?;
            Ok(Command::RenewHold {
                id: parse_ulid(&values[0])?,
            })
        }
        "bookings" => {
            require("bookings", values, 2)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                hold_id: parse_ulid(&values[1])?,
            })
        }
        "checkouts" => {
            require("checkouts", values, 1)?;
            Ok(Command::Checkout {
                holder_id: parse_text(&values[0])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `(id, court_id, date, start, "end", holder_id[, ttl_ms])`
fn parse_hold_row(values: &[Expr]) -> Result<(HoldRequest, String, Option<Ms>), SqlError> {
    require("holds", values, 6)?;
    let start = parse_minute(&values[3])?;
    let end = parse_minute(&values[4])?;
    let range = TimeRange::try_new(start, end)
        .ok_or_else(|| SqlError::Parse(format!("empty or invalid range {start}..{end}")))?;
    let request = HoldRequest::new(
        parse_ulid(&values[0])?,
        parse_ulid(&values[1])?,
        parse_date(&values[2])?,
        range,
    );
    let holder_id = parse_text(&values[5])?;
    let ttl_ms = values.get(6).map(parse_i64_or_null).transpose()?.flatten();
    Ok((request, holder_id, ttl_ms))
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "courts" => Ok(Command::DeleteCourt {
            id: filters.ulid("id")?,
        }),
        "holds" => {
            if let Some(holder_id) = filters.opt_text("holder_id")? {
                return Ok(Command::DeleteHolderHolds { holder_id });
            }
            Ok(Command::DeleteHold {
                id: filters.ulid("id")?,
            })
        }
        "bookings" => Ok(Command::DeleteBooking {
            id: filters.ulid("id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "courts" => Ok(Command::SelectCourts {
            zone: filters.opt_text("zone")?,
        }),
        "holds" => {
            let id = filters.opt_ulid("id")?;
            let holder_id = filters.opt_text("holder_id")?;
            if id.is_none() && holder_id.is_none() {
                return Err(SqlError::MissingFilter("holder_id"));
            }
            Ok(Command::SelectHolds { id, holder_id })
        }
        "bookings" => Ok(Command::SelectBookings {
            filter: BookingFilter {
                court_id: filters.opt_ulid("court_id")?,
                date: filters.opt_date("date")?,
                customer_id: filters.opt_text("customer_id")?,
                include_cancelled: filters.opt_bool("include_cancelled")?.unwrap_or(false),
            },
        }),
        "availability" => Ok(Command::SelectAvailability {
            date: filters.date("date")?,
            range: filters.range()?,
            zone: filters.opt_text("zone")?,
            weeks: filters.weeks()?,
        }),
        "blocked_start_times" => Ok(Command::SelectBlockedStartTimes {
            date: filters.date("date")?,
            duration: filters.minute("duration")?,
            zone: filters.opt_text("zone")?,
            weeks: filters.weeks()?,
        }),
        "prices" => Ok(Command::SelectPrices {
            court_id: filters.ulid("court_id")?,
            date: filters.date("date")?,
            range: filters.range()?,
            weeks: filters.weeks()?,
        }),
        "carts" => Ok(Command::SelectCart {
            holder_id: filters.text("holder_id")?,
        }),
        "free_time" => Ok(Command::SelectFreeTime {
            court_id: filters.ulid("court_id")?,
            date: filters.date("date")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// `col = value` pairs joined by AND. Anything else in the clause is rejected.
struct Filters(Vec<(String, Expr)>);

fn where_filters(selection: Option<&Expr>) -> Result<Filters, SqlError> {
    let mut pairs = Vec::new();
    if let Some(expr) = selection {
        collect_eq(expr, &mut pairs)?;
    }
    Ok(Filters(pairs))
}

fn collect_eq(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq(left, out)?;
            collect_eq(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, (**right).clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

impl Filters {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.get(col).ok_or(SqlError::MissingFilter(col))?)
    }

    fn opt_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid).transpose()
    }

    fn opt_text(&self, col: &str) -> Result<Option<String>, SqlError> {
        Ok(self.get(col).map(parse_text_or_null).transpose()?.flatten())
    }

    fn text(&self, col: &'static str) -> Result<String, SqlError> {
        self.opt_text(col)?.ok_or(SqlError::MissingFilter(col))
    }

    fn date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date(self.get(col).ok_or(SqlError::MissingFilter(col))?)
    }

    fn opt_date(&self, col: &str) -> Result<Option<NaiveDate>, SqlError> {
        self.get(col).map(parse_date).transpose()
    }

    fn minute(&self, col: &'static str) -> Result<Minute, SqlError> {
        parse_minute(self.get(col).ok_or(SqlError::MissingFilter(col))?)
    }

    fn opt_bool(&self, col: &str) -> Result<Option<bool>, SqlError> {
        self.get(col).map(parse_bool).transpose()
    }

    /// `start` and `"end"` as one range.
    fn range(&self) -> Result<TimeRange, SqlError> {
        let start = self.minute("start")?;
        let end = self.minute("end")?;
        TimeRange::try_new(start, end)
            .ok_or_else(|| SqlError::Parse(format!("invalid range {start}..{end}")))
    }

    /// Weekly repeat count, one when absent.
    fn weeks(&self) -> Result<u32, SqlError> {
        Ok(self
            .get("weeks")
            .map(parse_u32_or_null)
            .transpose()?
            .flatten()
            .unwrap_or(1))
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn require(table: &'static str, values: &[Expr], at_least: usize) -> Result<(), SqlError> {
    if values.len() < at_least {
        return Err(SqlError::WrongArity(table, at_least, values.len()));
    }
    Ok(())
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
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

fn expect_value(expr: &Expr) -> Result<&Value, SqlError> {
    extract_value(expr).ok_or_else(|| SqlError::Parse(format!("expected value, got {expr}")))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match expect_value(expr)? {
        Value::SingleQuotedString(s) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        other => Err(SqlError::Parse(format!("expected ULID string, got {other}"))),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expect_value(expr)? {
        Value::Null => Ok(None),
        Value::SingleQuotedString(s) => Ok(Some(s.clone())),
        other => Err(SqlError::Parse(format!("expected string, got {other}"))),
    }
}

/// `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let text = parse_text(expr)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {text:?}: {e}")))
}

/// `'HH:MM'` or a minute-of-day number (bound parameters arrive as quoted text).
fn parse_minute(expr: &Expr) -> Result<Minute, SqlError> {
    let raw = match expect_value(expr)? {
        Value::Number(n, _) => n.clone(),
        Value::SingleQuotedString(s) => s.clone(),
        other => return Err(SqlError::Parse(format!("expected time, got {other}"))),
    };
    if raw.contains(':') {
        return parse_clock(&raw).ok_or_else(|| SqlError::Parse(format!("bad time {raw:?}")));
    }
    let minute: Minute = raw
        .trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("bad minute {raw:?}")))?;
    if minute > MINUTES_PER_DAY {
        return Err(SqlError::Parse(format!("minute {minute} past end of day")));
    }
    Ok(minute)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    match expect_value(expr)? {
        Value::Number(s, _) | Value::SingleQuotedString(s) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        other => Err(SqlError::Parse(format!("expected number, got {other}"))),
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_i64_expr(expr).map(Some),
    }
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    parse_i64_or_null(expr)?
        .map(|v| u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range"))))
        .transpose()
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match expect_value(expr)? {
        Value::Boolean(b) => Ok(*b),
        Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Value::Number(n, _) => Ok(n != "0"),
        other => Err(SqlError::Parse(format!("expected bool, got {other}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl SqlError {
    fn in_row(self, row: usize) -> Self {
        SqlError::Parse(format!("row {row}: {self}"))
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn parse_insert_court() {
        let sql = format!("INSERT INTO courts (id, name, zone) VALUES ('{A}', 'Court 1', 'A')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertCourt {
                id: ulid(A),
                name: Some("Court 1".into()),
                zone: Some("A".into()),
            }
        );
    }

    #[test]
    fn parse_insert_court_id_only_and_null_zone() {
        let cmd = parse_sql(&format!("INSERT INTO courts (id) VALUES ('{A}')")).unwrap();
        assert!(matches!(cmd, Command::InsertCourt { name: None, zone: None, .. }));
        let cmd = parse_sql(&format!("INSERT INTO courts (id, name, zone) VALUES ('{A}', 'x', NULL)"))
            .unwrap();
        assert!(matches!(cmd, Command::InsertCourt { zone: None, .. }));
    }

    #[test]
    fn parse_insert_hold_with_clock_times() {
        let sql = format!(
            r#"INSERT INTO holds (id, court_id, date, start, "end", holder_id) VALUES ('{A}', '{B}', '2025-03-14', '08:00', '09:30', 'alice')"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertHold {
                request: HoldRequest::new(ulid(A), ulid(B), date("2025-03-14"), TimeRange::new(480, 570)),
                holder_id: "alice".into(),
                ttl_ms: None,
            }
        );
    }

    #[test]
    fn parse_insert_hold_with_minutes_and_ttl() {
        let sql = format!(
            r#"INSERT INTO holds (id, court_id, date, start, "end", holder_id, ttl_ms) VALUES ('{A}', '{B}', '2025-03-14', 480, 540, 'alice', 60000)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertHold { request, ttl_ms, .. } => {
                assert_eq!(request.range, TimeRange::new(480, 540));
                assert_eq!(ttl_ms, Some(60_000));
            }
            other => panic!("expected InsertHold, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_hold_rejects_backwards_range() {
        let sql = format!(
            r#"INSERT INTO holds VALUES ('{A}', '{B}', '2025-03-14', '09:00', '08:00', 'alice')"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_multi_row_holds_is_a_cart() {
        let sql = format!(
            r#"INSERT INTO holds (id, court_id, date, start, "end", holder_id) VALUES
               ('{A}', '{B}', '2025-03-14', '08:00', '09:00', 'alice'),
               ('{B}', '{B}', '2025-03-14', '10:00', '11:00', 'alice')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertHolds {
                holder_id,
                ttl_ms,
                requests,
            } => {
                assert_eq!(holder_id, "alice");
                assert_eq!(ttl_ms, None);
                assert_eq!(requests.len(), 2);
                assert_eq!(requests[1].range, TimeRange::new(600, 660));
            }
            other => panic!("expected InsertHolds, got {other:?}"),
        }
    }

    #[test]
    fn parse_multi_row_holds_needs_one_holder() {
        let sql = format!(
            r#"INSERT INTO holds VALUES
               ('{A}', '{B}', '2025-03-14', '08:00', '09:00', 'alice'),
               ('{B}', '{B}', '2025-03-14', '10:00', '11:00', 'bob')"#
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_fixed_hold_defaults_to_four_weeks() {
        let sql = format!(
            r#"INSERT INTO fixed_holds VALUES ('{A}', '{B}', '2025-03-14', '18:00', '20:00', 'alice')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertFixedHold { weeks, ttl_ms, .. } => {
                assert_eq!(weeks, DEFAULT_RECURRING_WEEKS);
                assert_eq!(ttl_ms, None);
            }
            other => panic!("expected InsertFixedHold, got {other:?}"),
        }

        let sql = format!(
            r#"INSERT INTO fixed_holds VALUES ('{A}', '{B}', '2025-03-14', '18:00', '20:00', 'alice', 8, 1000)"#
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertFixedHold { weeks: 8, ttl_ms: Some(1000), .. }
        ));
    }

    #[test]
    fn parse_renew_promote_and_checkout() {
        assert_eq!(
            parse_sql(&format!("INSERT INTO renewals (hold_id) VALUES ('{A}')")).unwrap(),
            Command::RenewHold { id: ulid(A) }
        );
        assert_eq!(
            parse_sql(&format!("INSERT INTO bookings (id, hold_id) VALUES ('{B}', '{A}')")).unwrap(),
            Command::InsertBooking {
                id: ulid(B),
                hold_id: ulid(A)
            }
        );
        assert_eq!(
            parse_sql("INSERT INTO checkouts (holder_id) VALUES ('alice')").unwrap(),
            Command::Checkout {
                holder_id: "alice".into()
            }
        );
    }

    #[test]
    fn parse_deletes() {
        assert_eq!(
            parse_sql(&format!("DELETE FROM holds WHERE id = '{A}'")).unwrap(),
            Command::DeleteHold { id: ulid(A) }
        );
        assert_eq!(
            parse_sql("DELETE FROM holds WHERE holder_id = 'alice'").unwrap(),
            Command::DeleteHolderHolds {
                holder_id: "alice".into()
            }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM bookings WHERE id = '{A}'")).unwrap(),
            Command::DeleteBooking { id: ulid(A) }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM courts WHERE id = '{A}'")).unwrap(),
            Command::DeleteCourt { id: ulid(A) }
        );
        assert_eq!(
            parse_sql("DELETE FROM bookings").unwrap_err(),
            SqlError::MissingFilter("id")
        );
    }

    #[test]
    fn parse_select_courts_and_holds() {
        assert_eq!(
            parse_sql("SELECT * FROM courts").unwrap(),
            Command::SelectCourts { zone: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM courts WHERE zone = 'B'").unwrap(),
            Command::SelectCourts {
                zone: Some("B".into())
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM holds WHERE holder_id = 'alice'").unwrap(),
            Command::SelectHolds {
                id: None,
                holder_id: Some("alice".into())
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM holds").unwrap_err(),
            SqlError::MissingFilter("holder_id")
        );
    }

    #[test]
    fn parse_select_bookings_filter() {
        let sql = format!(
            "SELECT * FROM bookings WHERE court_id = '{A}' AND date = '2025-03-14' AND include_cancelled = true"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings {
                filter: BookingFilter {
                    court_id: Some(ulid(A)),
                    date: Some(date("2025-03-14")),
                    customer_id: None,
                    include_cancelled: true,
                }
            }
        );
    }

    #[test]
    fn parse_select_availability() {
        let sql = r#"SELECT * FROM availability WHERE date = '2025-03-14' AND start = '08:00' AND "end" = '09:00' AND zone = 'A'"#;
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectAvailability {
                date: date("2025-03-14"),
                range: TimeRange::new(480, 540),
                zone: Some("A".into()),
                weeks: 1,
            }
        );
        let missing = r#"SELECT * FROM availability WHERE date = '2025-03-14' AND start = '08:00'"#;
        assert_eq!(parse_sql(missing).unwrap_err(), SqlError::MissingFilter("end"));
    }

    #[test]
    fn parse_select_blocked_start_times_and_free_time() {
        assert_eq!(
            parse_sql("SELECT * FROM blocked_start_times WHERE date = '2025-03-14' AND duration = 90")
                .unwrap(),
            Command::SelectBlockedStartTimes {
                date: date("2025-03-14"),
                duration: 90,
                zone: None,
                weeks: 1,
            }
        );
        assert_eq!(
            parse_sql(&format!(
                "SELECT * FROM free_time WHERE court_id = '{A}' AND date = '2025-03-14'"
            ))
            .unwrap(),
            Command::SelectFreeTime {
                court_id: ulid(A),
                date: date("2025-03-14"),
            }
        );
    }

    #[test]
    fn parse_weekly_filters() {
        let sql = r#"SELECT * FROM availability WHERE date = '2025-03-14' AND start = '18:00' AND "end" = '20:00' AND weeks = 4"#;
        assert!(matches!(
            parse_sql(sql).unwrap(),
            Command::SelectAvailability { weeks: 4, zone: None, .. }
        ));
        let sql = "SELECT * FROM blocked_start_times WHERE date = '2025-03-14' AND duration = 60 AND weeks = '4'";
        assert!(matches!(
            parse_sql(sql).unwrap(),
            Command::SelectBlockedStartTimes { weeks: 4, .. }
        ));
        let sql = "SELECT * FROM blocked_start_times WHERE date = '2025-03-14' AND duration = 60 AND weeks = -1";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_select_prices_and_carts() {
        let sql = format!(
            r#"SELECT * FROM prices WHERE court_id = '{A}' AND date = '2025-03-14' AND start = '16:00' AND "end" = '18:00' AND weeks = 4"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectPrices {
                court_id: ulid(A),
                date: date("2025-03-14"),
                range: TimeRange::new(960, 1080),
                weeks: 4,
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM carts WHERE holder_id = 'alice'").unwrap(),
            Command::SelectCart {
                holder_id: "alice".into()
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM carts").unwrap_err(),
            SqlError::MissingFilter("holder_id")
        );
    }

    #[test]
    fn parse_rejects_non_equality_filters() {
        let sql = "SELECT * FROM courts WHERE zone <> 'A'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_bad_values() {
        let bad_date = format!(
            r#"INSERT INTO holds VALUES ('{A}', '{B}', '14/03/2025', '08:00', '09:00', 'alice')"#
        );
        assert!(matches!(parse_sql(&bad_date), Err(SqlError::Parse(_))));
        let bad_ulid = "INSERT INTO renewals VALUES ('not-a-ulid')";
        assert!(matches!(parse_sql(bad_ulid), Err(SqlError::Parse(_))));
        let bad_time = format!(
            r#"INSERT INTO holds VALUES ('{A}', '{B}', '2025-03-14', '8h', '09:00', 'alice')"#
        );
        assert!(matches!(parse_sql(&bad_time), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO rackets (id) VALUES ('{A}')");
        assert_eq!(parse_sql(&sql).unwrap_err(), SqlError::UnknownTable("rackets".into()));
    }

    #[test]
    fn parse_wrong_arity() {
        assert_eq!(
            parse_sql(&format!("INSERT INTO bookings VALUES ('{A}')")).unwrap_err(),
            SqlError::WrongArity("bookings", 2, 1)
        );
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
