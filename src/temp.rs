//! Session-scoped temp table registry.
//!
//! Temp tables only exist inside the session that created them, so lineage
//! through them is keyed by `(session_id, urn)`. When a query reads a temp
//! table its lineage is rewritten to the temp's own base upstreams, chained
//! across multiple hops with a depth bound and a cycle guard. Intermediate
//! temps never appear in emitted lineage.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::models::{ColumnLineageInfo, ColumnRef, QueryId};

/// Hop limit when chasing temp-on-temp chains.
pub const MAX_TEMP_DEPTH: usize = 10;

/// Lineage recorded when a temp table was created or written.
#[derive(Debug, Clone)]
pub struct TempTableEntry {
    pub query_id: QueryId,
    pub upstreams: BTreeSet<String>,
    /// temp column -> upstream column refs, as parsed at registration time.
    pub column_map: HashMap<String, Vec<ColumnRef>>,
}

/// Result of rewriting one query's lineage through the registry.
#[derive(Debug, Default)]
pub struct ResolvedLineage {
    pub upstreams: BTreeSet<String>,
    pub column_lineage: Vec<ColumnLineageInfo>,
    /// At least one temp reference was rewritten.
    pub used_temp: bool,
    /// Some part of a temp chain could not be followed (depth, cycle, or an
    /// unknown column); the caller should discount confidence.
    pub truncated: bool,
}

#[derive(Debug, Default)]
pub struct TempTableRegistry {
    entries: HashMap<(String, String), TempTableEntry>,
}

impl TempTableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a temp table written in a session. A later registration for
    /// the same `(session, urn)` replaces the earlier one, which is what
    /// DROP-and-recreate inside a session means.
    pub fn register(&mut self, session_id: &str, urn: &str, entry: TempTableEntry) {
        self.entries
            .insert((session_id.to_string(), urn.to_string()), entry);
    }

    /// Rewrites table- and column-level upstreams through any temp tables
    /// visible in `session_id`. Non-temp upstreams pass through untouched.
    pub fn resolve(
        &self,
        session_id: &str,
        upstreams: &BTreeSet<String>,
        column_lineage: &[ColumnLineageInfo],
    ) -> ResolvedLineage {
        let mut out = ResolvedLineage::default();
        for urn in upstreams {
            let mut visited = HashSet::new();
            self.resolve_table(session_id, urn, 0, &mut visited, &mut out);
        }
        for cll in column_lineage {
            let mut resolved_ups = BTreeSet::new();
            for up in &cll.upstreams {
                let mut visited = HashSet::new();
                self.resolve_column(session_id, up, 0, &mut visited, &mut resolved_ups, &mut out);
            }
            if resolved_ups.is_empty() {
                continue;
            }
            out.column_lineage.push(ColumnLineageInfo {
                downstream: cll.downstream.clone(),
                upstreams: resolved_ups.into_iter().collect(),
                transform: cll.transform.clone(),
                confidence: cll.confidence,
            });
        }
        out
    }

    fn resolve_table(
        &self,
        session_id: &str,
        urn: &str,
        depth: usize,
        visited: &mut HashSet<String>,
        out: &mut ResolvedLineage,
    ) {
        let key = (session_id.to_string(), urn.to_string());
        let Some(entry) = self.entries.get(&key) else {
            out.upstreams.insert(urn.to_string());
            return;
        };
        out.used_temp = true;
        // `visited` tracks the current path only, so a DAG-shaped chain
        // (the same temp reachable through two branches) is not a cycle.
        if depth >= MAX_TEMP_DEPTH || !visited.insert(urn.to_string()) {
            out.truncated = true;
            return;
        }
        for up in &entry.upstreams {
            self.resolve_table(session_id, up, depth + 1, visited, out);
        }
        visited.remove(urn);
    }

    fn resolve_column(
        &self,
        session_id: &str,
        col: &ColumnRef,
        depth: usize,
        visited: &mut HashSet<ColumnRef>,
        acc: &mut BTreeSet<ColumnRef>,
        out: &mut ResolvedLineage,
    ) {
        let key = (session_id.to_string(), col.table.clone());
        let Some(entry) = self.entries.get(&key) else {
            acc.insert(col.clone());
            return;
        };
        out.used_temp = true;
        if depth >= MAX_TEMP_DEPTH || !visited.insert(col.clone()) {
            out.truncated = true;
            return;
        }
        match entry.column_map.get(&col.column) {
            Some(sources) => {
                for src in sources {
                    self.resolve_column(session_id, src, depth + 1, visited, acc, out);
                }
            }
            None => {
                // Temp exists but the column mapping is unknown; lineage for
                // this column stops here.
                out.truncated = true;
            }
        }
        visited.remove(col);
    }
}
