//! Prepared query executors.
//!
//! An [`Executor`] is a query descriptor compiled once into parameterised
//! SQL, together with the set of tables the statement reads. Executors are
//! immutable and shared through the [`ExecutorCache`](crate::cache::ExecutorCache).

use std::collections::BTreeSet;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Map, Number, Value};
use vigil_types::{Filter, FilterOp, QueryDescriptor};

use crate::interceptor;

/// A compiled, reusable query.
#[derive(Debug, Clone, PartialEq)]
pub struct Executor {
    sql: String,
    params: Vec<SqlValue>,
    identity_column: String,
    tables: BTreeSet<String>,
}

impl Executor {
    /// Compiles `descriptor` and intercepts the tables it reads.
    ///
    /// The descriptor must already be validated; identifiers are quoted but
    /// not escaped.
    ///
    /// # Errors
    ///
    /// Returns the prepare error if the statement does not compile against
    /// the current schema.
    pub fn build(conn: &Connection, descriptor: &QueryDescriptor) -> Result<Self, rusqlite::Error> {
        let (sql, params) = compile(descriptor);
        let mut tables = interceptor::read_tables(conn, &sql)?;
        tables.extend(descriptor.referenced_tables().map(str::to_string));
        tables.retain(|t| !t.starts_with("sqlite_"));

        Ok(Self {
            sql,
            params,
            identity_column: identity_column(descriptor),
            tables,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Key under which each result row carries its identity.
    pub fn identity_column(&self) -> &str {
        &self.identity_column
    }

    /// Every table whose mutation can change the result.
    pub fn tables(&self) -> &BTreeSet<String> {
        &self.tables
    }

    /// Runs the query and returns each row as a JSON object keyed by column.
    ///
    /// # Errors
    ///
    /// Returns any SQLite error raised while preparing or stepping.
    pub fn run(&self, conn: &Connection) -> Result<Vec<Value>, rusqlite::Error> {
        let mut stmt = conn.prepare_cached(&self.sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(self.params.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut object = Map::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                object.insert(name.clone(), sql_to_json(row.get_ref(i)?));
            }
            out.push(Value::Object(object));
        }
        Ok(out)
    }
}

/// Key under which result rows of `descriptor` carry their identity.
///
/// `relation.*` projections name columns without their table, explicit
/// projections keep the name they were given.
pub fn identity_column(descriptor: &QueryDescriptor) -> String {
    if descriptor.columns.is_empty() {
        unqualified(&descriptor.primary_key).to_string()
    } else {
        descriptor.primary_key.clone()
    }
}

fn unqualified(column: &str) -> &str {
    column.rsplit('.').next().unwrap_or(column)
}

fn quote(identifier: &str) -> String {
    identifier
        .split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join(".")
}

/// Builds the SQL text and its positional parameters.
pub(crate) fn compile(descriptor: &QueryDescriptor) -> (String, Vec<SqlValue>) {
    let relation = quote(&descriptor.relation);
    let mut params = Vec::new();

    let projection = if descriptor.columns.is_empty() {
        format!("{relation}.*")
    } else {
        let mut columns: Vec<&str> = descriptor.columns.iter().map(String::as_str).collect();
        if !columns.contains(&descriptor.primary_key.as_str()) {
            columns.insert(0, &descriptor.primary_key);
        }
        columns
            .iter()
            .map(|c| {
                if c.contains('.') {
                    format!("{} AS \"{c}\"", quote(c))
                } else {
                    quote(c)
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut sql = format!("SELECT {projection} FROM {relation}");

    for join in &descriptor.joins {
        sql.push_str(&format!(
            " INNER JOIN {} ON {} = {}",
            quote(&join.relation),
            quote(&join.left_column),
            quote(&join.right_column)
        ));
    }

    if !descriptor.filters.is_empty() {
        let clauses: Vec<String> = descriptor
            .filters
            .iter()
            .map(|f| compile_filter(f, &mut params))
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    if !descriptor.order_by.is_empty() {
        let orders: Vec<String> = descriptor
            .order_by
            .iter()
            .map(|o| {
                let direction = if o.descending { "DESC" } else { "ASC" };
                format!("{} {direction}", quote(&o.column))
            })
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&orders.join(", "));
    }

    match (descriptor.limit, descriptor.offset) {
        (None, None) => {}
        (limit, offset) => {
            // SQLite only accepts OFFSET after LIMIT; -1 means unbounded.
            let limit = limit.map(clamp_i64).unwrap_or(-1);
            params.push(SqlValue::Integer(limit));
            params.push(SqlValue::Integer(offset.map(clamp_i64).unwrap_or(0)));
            sql.push_str(" LIMIT ? OFFSET ?");
        }
    }

    (sql, params)
}

fn clamp_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn compile_filter(filter: &Filter, params: &mut Vec<SqlValue>) -> String {
    let column = quote(&filter.column);
    let binary = |op: &str, params: &mut Vec<SqlValue>| {
        params.push(json_to_sql(&filter.value));
        format!("{column} {op} ?")
    };

    match filter.op {
        FilterOp::Eq if filter.value.is_null() => format!("{column} IS NULL"),
        FilterOp::Ne if filter.value.is_null() => format!("{column} IS NOT NULL"),
        FilterOp::Eq => binary("=", params),
        FilterOp::Ne => binary("<>", params),
        FilterOp::Lt => binary("<", params),
        FilterOp::Le => binary("<=", params),
        FilterOp::Gt => binary(">", params),
        FilterOp::Ge => binary(">=", params),
        FilterOp::Like => binary("LIKE", params),
        FilterOp::IsNull => format!("{column} IS NULL"),
        FilterOp::NotNull => format!("{column} IS NOT NULL"),
        FilterOp::In => {
            let values = filter.value.as_array().map(Vec::as_slice).unwrap_or_default();
            if values.is_empty() {
                return "0".to_string();
            }
            params.extend(values.iter().map(json_to_sql));
            let marks = vec!["?"; values.len()].join(", ");
            format!("{column} IN ({marks})")
        }
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        // Rejected by descriptor validation.
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}
