//! Durable audit log of observed queries, backed by rocksdb.
//!
//! Entries are keyed by a monotonic sequence number so export preserves
//! ingestion order, with a secondary index from query id to sequence so a
//! re-observed statement overwrites its original slot instead of appending
//! a duplicate.

use anyhow::{anyhow, Context, Result};
use rocksdb::{Direction, IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

use crate::models::{ObservedQuery, QueryId};

const SEQ_PREFIX: &[u8] = b"q:";
const INDEX_PREFIX: &[u8] = b"i:";

#[derive(Debug, Serialize, Deserialize)]
struct LoggedQuery {
    query_id: QueryId,
    #[serde(flatten)]
    observed: ObservedQuery,
}

pub struct QueryLogStore {
    db: Option<DB>,
    next_seq: u64,
}

impl QueryLogStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)
            .with_context(|| format!("opening query log at {}", path.display()))?;

        // Recover the sequence counter from the highest existing key.
        let mut next_seq = 0u64;
        for item in db.iterator(IteratorMode::From(SEQ_PREFIX, Direction::Forward)) {
            let (key, _) = item.context("scanning query log")?;
            if !key.starts_with(SEQ_PREFIX) {
                break;
            }
            let seq_hex = std::str::from_utf8(&key[SEQ_PREFIX.len()..])?;
            let seq = u64::from_str_radix(seq_hex, 16)?;
            next_seq = next_seq.max(seq + 1);
        }
        Ok(Self {
            db: Some(db),
            next_seq,
        })
    }

    fn db(&self) -> Result<&DB> {
        self.db.as_ref().ok_or_else(|| anyhow!("query log store is closed"))
    }

    fn seq_key(seq: u64) -> Vec<u8> {
        let mut key = SEQ_PREFIX.to_vec();
        key.extend_from_slice(format!("{:016x}", seq).as_bytes());
        key
    }

    fn index_key(id: &QueryId) -> Vec<u8> {
        let mut key = INDEX_PREFIX.to_vec();
        key.extend_from_slice(id.as_str().as_bytes());
        key
    }

    /// Appends an observation, or overwrites the earlier observation of the
    /// same statement in place.
    pub fn append(&mut self, query_id: &QueryId, observed: &ObservedQuery) -> Result<()> {
        let index_key = Self::index_key(query_id);
        let existing = self.db()?.get(&index_key).context("reading query log index")?;
        let seq = match existing {
            Some(bytes) => u64::from_str_radix(std::str::from_utf8(&bytes)?, 16)?,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                seq
            }
        };
        let record = LoggedQuery {
            query_id: query_id.clone(),
            observed: observed.clone(),
        };
        let payload = serde_json::to_vec(&record)?;
        let db = self.db()?;
        db.put(Self::seq_key(seq), payload).context("writing query log entry")?;
        db.put(index_key, format!("{:016x}", seq).into_bytes())
            .context("writing query log index")?;
        Ok(())
    }

    pub fn get(&self, query_id: &QueryId) -> Result<Option<ObservedQuery>> {
        let db = self.db()?;
        let Some(bytes) = db.get(Self::index_key(query_id))? else {
            return Ok(None);
        };
        let seq = u64::from_str_radix(std::str::from_utf8(&bytes)?, 16)?;
        let Some(payload) = db.get(Self::seq_key(seq))? else {
            return Ok(None);
        };
        let record: LoggedQuery = serde_json::from_slice(&payload)?;
        Ok(Some(record.observed))
    }

    pub fn len(&self) -> usize {
        self.next_seq as usize
    }

    pub fn is_empty(&self) -> bool {
        self.next_seq == 0
    }

    /// Writes the log as JSON lines in ingestion order.
    pub fn export_jsonl<W: Write>(&self, mut w: W) -> Result<()> {
        let db = self.db()?;
        for item in db.iterator(IteratorMode::From(SEQ_PREFIX, Direction::Forward)) {
            let (key, value) = item.context("scanning query log")?;
            if !key.starts_with(SEQ_PREFIX) {
                break;
            }
            w.write_all(&value)?;
            w.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Releases the rocksdb handle. Idempotent; any later call on the store
    /// fails cleanly.
    pub fn close(&mut self) {
        self.db = None;
    }
}
