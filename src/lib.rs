//! SQL lineage aggregation.
//!
//! Feed observed queries (plus any out-of-band lineage facts) into a
//! [`SqlParsingAggregator`], then call
//! [`gen_metadata`](SqlParsingAggregator::gen_metadata) to get merged
//! table- and column-level lineage, usage statistics and operation records
//! as metadata change proposals.
//!
//! ```no_run
//! use sql_lineage::{AggregatorConfig, ObservedQuery, SqlParsingAggregator};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut agg = SqlParsingAggregator::new(AggregatorConfig::new("redshift"))?;
//! agg.add_observed_query(ObservedQuery {
//!     query: "create table foo as select a, b from bar".to_string(),
//!     default_db: Some("dev".to_string()),
//!     default_schema: Some("public".to_string()),
//!     session_id: None,
//!     timestamp: None,
//!     user: None,
//! })?;
//! for change in agg.gen_metadata()? {
//!     println!("{}", serde_json::to_string(&change)?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod config;
pub mod models;
pub mod parser;
pub mod query_log;
pub mod schema;
pub mod temp;
pub mod urn;
pub mod usage;

pub use aggregator::{SqlAggregatorReport, SqlParsingAggregator};
pub use config::{AggregatorConfig, ConfigError};
pub use models::{
    ColumnLineageInfo, ColumnRef, KnownQueryLineageInfo, MetadataChange, ObservedQuery, QueryId,
    QueryType,
};
pub use parser::{parse_statements, ParserContext, SqlParsingResult};
pub use schema::SchemaResolver;
pub use urn::{UrnBuilder, UserUrn};
