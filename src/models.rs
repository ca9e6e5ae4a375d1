use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::urn::UserUrn;

/// Deterministic fingerprint of a SQL statement.
///
/// Computed over the normalized text (comments stripped, whitespace
/// collapsed, trailing semicolon removed, case-folded) so the same logical
/// statement observed at different times hashes to the same id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryId(String);

impl QueryId {
    pub fn from_sql(sql: &str) -> Self {
        let normalized = normalize_sql(sql);
        let digest = Sha256::digest(normalized.as_bytes());
        Self(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strips `--` and `/* */` comments, collapses whitespace runs, drops a
/// trailing semicolon and lowercases the remainder.
pub fn normalize_sql(sql: &str) -> String {
    let stripped = strip_comments(sql);
    let mut out = String::with_capacity(stripped.len());
    let mut last_was_space = true;
    for ch in stripped.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    let trimmed = out.trim().trim_end_matches(';').trim();
    trimmed.to_lowercase()
}

fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_single_quote = false;
    while let Some(ch) = chars.next() {
        if in_single_quote {
            out.push(ch);
            if ch == '\'' {
                in_single_quote = false;
            }
            continue;
        }
        match ch {
            '\'' => {
                in_single_quote = true;
                out.push(ch);
            }
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                out.push(' ');
            }
            _ => out.push(ch),
        }
    }
    out
}

/// One observed statement plus the session context it ran in. Immutable once
/// appended to the query log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedQuery {
    pub query: String,
    pub default_db: Option<String>,
    pub default_schema: Option<String>,
    pub session_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub user: Option<UserUrn>,
}

/// Statement kind, as far as lineage cares about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    Select,
    Insert,
    CreateTableAsSelect,
    CreateView,
    CreateOther,
    Merge,
    Update,
    Delete,
    Drop,
    Unknown,
}

impl QueryType {
    pub fn is_write(&self) -> bool {
        !matches!(self, QueryType::Select | QueryType::Unknown)
    }

    /// Operation name used in emitted operation records.
    pub fn operation_name(&self) -> &'static str {
        match self {
            QueryType::Insert => "INSERT",
            QueryType::CreateTableAsSelect | QueryType::CreateView | QueryType::CreateOther => {
                "CREATE"
            }
            QueryType::Merge => "MERGE",
            QueryType::Update => "UPDATE",
            QueryType::Delete => "DELETE",
            QueryType::Drop => "DROP",
            QueryType::Select | QueryType::Unknown => "UNKNOWN",
        }
    }
}

/// A single column reference: table urn + column name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// Column-level lineage claim for one downstream column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnLineageInfo {
    pub downstream: ColumnRef,
    pub upstreams: Vec<ColumnRef>,
    /// Projection expression when the column is not a plain copy.
    pub transform: Option<String>,
    pub confidence: f32,
}

/// Fully-specified per-query lineage injected without SQL parsing, used when
/// lineage is known out-of-band (platform lineage APIs, dbt manifests, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownQueryLineageInfo {
    pub query_text: String,
    pub downstream: String,
    pub upstreams: Vec<String>,
    pub column_lineage: Vec<ColumnLineageInfo>,
    pub timestamp: Option<DateTime<Utc>>,
    pub query_type: QueryType,
}

/// One emitted change record: `{entity urn, aspect name, aspect payload}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataChange {
    pub entity_urn: String,
    pub aspect_name: String,
    pub aspect: serde_json::Value,
}

impl MetadataChange {
    pub fn new<T: Serialize>(entity_urn: &str, aspect_name: &str, aspect: &T) -> Self {
        Self {
            entity_urn: entity_urn.to_string(),
            aspect_name: aspect_name.to_string(),
            // Aspect structs only hold plain maps/lists/scalars.
            aspect: serde_json::to_value(aspect).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Table-level upstream edge inside an `upstreamLineage` aspect.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Upstream {
    pub dataset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<QueryId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

/// Column-level edge inside an `upstreamLineage` aspect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FineGrainedLineage {
    pub downstream_column: String,
    pub upstream_columns: Vec<ColumnRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    pub query_id: QueryId,
    pub confidence: f32,
}

/// Merged lineage aspect for one downstream table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamLineage {
    pub upstreams: Vec<Upstream>,
    pub fine_grained: Vec<FineGrainedLineage>,
}
