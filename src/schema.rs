use std::collections::HashMap;

/// Registry mapping dataset urns to their ordered column lists.
///
/// Resolution is deliberately lazy: connectors often learn a table's schema
/// after queries referencing it were already observed, so callers that need
/// late schemas (view definitions in particular) defer parsing until
/// generation time.
#[derive(Debug, Default)]
pub struct SchemaResolver {
    schemas: HashMap<String, Vec<String>>,
    lowercase: bool,
}

impl SchemaResolver {
    pub fn new(lowercase: bool) -> Self {
        Self {
            schemas: HashMap::new(),
            lowercase,
        }
    }

    /// Registers (or replaces) the column list for a table.
    pub fn add_schema(&mut self, urn: &str, columns: Vec<String>) {
        let columns = if self.lowercase {
            columns.into_iter().map(|c| c.to_lowercase()).collect()
        } else {
            columns
        };
        self.schemas.insert(urn.to_string(), columns);
    }

    pub fn resolve(&self, urn: &str) -> Option<&[String]> {
        self.schemas.get(urn).map(|c| c.as_slice())
    }

    pub fn has(&self, urn: &str) -> bool {
        self.schemas.contains_key(urn)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
