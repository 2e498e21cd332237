//! Query descriptors and their fingerprints.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Deterministic digest identifying a query descriptor.
///
/// Two subscribers requesting the identical descriptor always get the same
/// fingerprint and therefore share one observer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an already computed hex digest (e.g. read back from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Returns the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short prefix suitable for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors produced while validating a query descriptor.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    /// A table or column name is not a plain SQL identifier.
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A filter value has the wrong shape for its operator.
    #[error("invalid value for filter on {column}: {reason}")]
    InvalidFilterValue {
        /// The filtered column.
        column: String,
        /// Why the value was rejected.
        reason: &'static str,
    },

    /// Poll-mode observers cannot also declare explicit dependencies.
    #[error("poll_interval_ms and dependencies are mutually exclusive")]
    PollWithDependencies,

    /// A poll interval of zero would spin.
    #[error("poll_interval_ms must be greater than zero")]
    ZeroPollInterval,

    /// The descriptor could not be encoded canonically.
    #[error("descriptor encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Comparison operator of a filter clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    In,
    IsNull,
    NotNull,
}

/// One `column op value` clause. Clauses are joined with `AND`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Value,
}

impl Filter {
    /// Shorthand for an equality clause.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }
}

/// Inner join of another relation onto the target relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    /// The joined relation.
    pub relation: String,
    /// Column on the already joined side (qualified or belonging to the target relation).
    pub left_column: String,
    /// Column on the joined relation.
    pub right_column: String,
}

/// Ordering clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

fn default_primary_key() -> String {
    "id".to_string()
}

/// A reproducible, serialisable query specification.
///
/// The descriptor is plain data: it is stored with the observer so any
/// worker can rebuild the executor, and hashed to produce the fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// Target relation.
    pub relation: String,
    /// Column that identifies an item across evaluations.
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Projection. Empty selects every column of `relation`.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub joins: Vec<Join>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    /// Extra tables whose mutation must invalidate this query.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Re-evaluate on a fixed interval in addition to change events.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Principal the query runs for. Identical queries for different
    /// principals never share an observer.
    #[serde(default)]
    pub scope: Option<String>,
}

impl QueryDescriptor {
    /// Creates a descriptor selecting every row of `relation`.
    pub fn new(relation: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            primary_key: default_primary_key(),
            columns: Vec::new(),
            joins: Vec::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            dependencies: Vec::new(),
            poll_interval_ms: None,
            scope: None,
        }
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_join(
        mut self,
        relation: impl Into<String>,
        left_column: impl Into<String>,
        right_column: impl Into<String>,
    ) -> Self {
        self.joins.push(Join {
            relation: relation.into(),
            left_column: left_column.into(),
            right_column: right_column.into(),
        });
        self
    }

    pub fn with_order(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_dependency(mut self, table: impl Into<String>) -> Self {
        self.dependencies.push(table.into());
        self
    }

    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = Some(interval);
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Checks identifiers and filter values.
    ///
    /// # Errors
    ///
    /// Returns the first [`DescriptorError`] found.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        check_identifier(&self.relation, false)?;
        check_identifier(&self.primary_key, true)?;
        for column in &self.columns {
            check_identifier(column, true)?;
        }
        for join in &self.joins {
            check_identifier(&join.relation, false)?;
            check_identifier(&join.left_column, true)?;
            check_identifier(&join.right_column, true)?;
        }
        for filter in &self.filters {
            check_identifier(&filter.column, true)?;
            check_filter_value(filter)?;
        }
        for order in &self.order_by {
            check_identifier(&order.column, true)?;
        }
        for table in &self.dependencies {
            check_identifier(table, false)?;
        }
        match self.poll_interval_ms {
            Some(0) => return Err(DescriptorError::ZeroPollInterval),
            Some(_) if !self.dependencies.is_empty() => {
                return Err(DescriptorError::PollWithDependencies)
            }
            _ => {}
        }
        Ok(())
    }

    /// Validates the descriptor and computes its fingerprint.
    ///
    /// The digest covers the canonical JSON encoding: struct fields are
    /// emitted in declaration order and filter values may only hold scalars
    /// or arrays of scalars, so equal descriptors always encode identically.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError`] if validation or encoding fails.
    pub fn fingerprint(&self) -> Result<Fingerprint, DescriptorError> {
        self.validate()?;
        let mut hasher = Sha256::new();
        serde_json::to_writer(&mut hasher, self)?;
        Ok(Fingerprint(hex::encode(hasher.finalize())))
    }

    /// Every relation the descriptor names statically.
    pub fn referenced_tables(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.relation.as_str())
            .chain(self.joins.iter().map(|j| j.relation.as_str()))
            .chain(self.dependencies.iter().map(String::as_str))
    }
}

fn check_identifier(name: &str, allow_qualified: bool) -> Result<(), DescriptorError> {
    let mut parts = name.split('.');
    let valid = match (parts.next(), parts.next(), parts.next()) {
        (Some(single), None, None) => is_plain_identifier(single),
        (Some(table), Some(column), None) if allow_qualified => {
            is_plain_identifier(table) && is_plain_identifier(column)
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DescriptorError::InvalidIdentifier(name.to_string()))
    }
}

fn is_plain_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_filter_value(filter: &Filter) -> Result<(), DescriptorError> {
    let reject = |reason| DescriptorError::InvalidFilterValue {
        column: filter.column.clone(),
        reason,
    };
    match filter.op {
        FilterOp::IsNull | FilterOp::NotNull => Ok(()),
        FilterOp::In => match &filter.value {
            Value::Array(values) if values.iter().all(is_scalar) => Ok(()),
            Value::Array(_) => Err(reject("`in` list may only contain scalars")),
            _ => Err(reject("`in` requires an array")),
        },
        FilterOp::Like => match &filter.value {
            Value::String(_) => Ok(()),
            _ => Err(reject("`like` requires a string pattern")),
        },
        _ if is_scalar(&filter.value) => Ok(()),
        _ => Err(reject("comparison requires a scalar")),
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}
