use serde::{Deserialize, Serialize};
use std::fmt;

/// Builds canonical urn strings for one platform/environment pair.
///
/// Case folding is a per-platform policy: warehouses like Snowflake or Hive
/// treat identifiers case-insensitively, so two different-case spellings of
/// the same table must collapse into one urn.
#[derive(Debug, Clone)]
pub struct UrnBuilder {
    platform: String,
    env: String,
    lowercase: bool,
}

impl UrnBuilder {
    pub fn new(platform: &str, env: &str, lowercase: bool) -> Self {
        Self {
            platform: platform.to_string(),
            env: env.to_string(),
            lowercase,
        }
    }

    pub fn lowercase(&self) -> bool {
        self.lowercase
    }

    /// Canonical dataset urn from a fully-qualified dotted name.
    pub fn dataset_urn(&self, qualified_name: &str) -> String {
        let name = if self.lowercase {
            qualified_name.to_lowercase()
        } else {
            qualified_name.to_string()
        };
        format!(
            "urn:li:dataset:(urn:li:dataPlatform:{},{},{})",
            self.platform, name, self.env
        )
    }

    /// Joins name parts the way the warehouse would qualify them, skipping
    /// absent defaults. `["dev", "public", "foo"]` becomes `dev.public.foo`.
    pub fn qualified_name(&self, parts: &[&str]) -> String {
        parts
            .iter()
            .filter(|p| !p.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Urn for the user a query ran as.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserUrn(String);

impl UserUrn {
    pub fn new(username: &str) -> Self {
        Self(format!("urn:li:corpuser:{}", username))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
