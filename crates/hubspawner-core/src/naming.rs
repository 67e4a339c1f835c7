//! Deterministic (user, server) -> object name and label mapping.
//!
//! Components are escaped so that only `[a-z0-9]` survive verbatim; every other
//! byte becomes `-xx`. An escaped component can therefore never contain `--`,
//! which keeps the `{prefix}-{user}--{server}` layout injective.

use hubspawner_common::{ObjectKind, Result, SpawnerError};
use std::collections::BTreeMap;
use std::fmt::Write;

pub const LABEL_OWNER: &str = "hubspawner.owner";
pub const LABEL_SERVER: &str = "hubspawner.server";
pub const LABEL_MANAGED_BY: &str = "hubspawner.managed-by";
pub const LABEL_PREFIX: &str = "hubspawner.prefix";
pub const MANAGED_BY: &str = "hubspawner";

const ESCAPE: char = '-';
/// Swarm service names are DNS labels.
const MAX_SERVICE_NAME: usize = 63;
const MAX_CONTAINER_NAME: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalName {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub user_id: String,
    pub server_name: String,
}

impl CanonicalName {
    /// Labels identifying the owner, used for recovery when no id was persisted.
    pub fn selector(&self) -> BTreeMap<String, String> {
        self.labels
            .iter()
            .filter(|(k, _)| k.as_str() != LABEL_PREFIX)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct NameResolver {
    prefix: String,
}

impl NameResolver {
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn resolve(&self, user_id: &str, server_name: &str) -> Result<CanonicalName> {
        if user_id.is_empty() {
            return Err(SpawnerError::InvalidName("user id must not be empty".to_string()));
        }

        let mut name = format!("{}-{}", self.prefix, escape(user_id));
        if !server_name.is_empty() {
            name.push_str("--");
            name.push_str(&escape(server_name));
        }

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_OWNER.to_string(), user_id.to_string());
        labels.insert(LABEL_SERVER.to_string(), server_name.to_string());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
        labels.insert(LABEL_PREFIX.to_string(), self.prefix.clone());

        Ok(CanonicalName {
            name,
            labels,
            user_id: user_id.to_string(),
            server_name: server_name.to_string(),
        })
    }

    /// Resolve and enforce the engine's name length limit for `kind`.
    pub fn resolve_for(
        &self,
        kind: ObjectKind,
        user_id: &str,
        server_name: &str,
    ) -> Result<CanonicalName> {
        let canonical = self.resolve(user_id, server_name)?;
        let limit = match kind {
            ObjectKind::Container => MAX_CONTAINER_NAME,
            ObjectKind::Service => MAX_SERVICE_NAME,
        };
        if canonical.name.len() > limit {
            return Err(SpawnerError::InvalidName(format!(
                "{} name '{}' exceeds {} characters",
                kind, canonical.name, limit
            )));
        }
        Ok(canonical)
    }

    /// Expand `{prefix}`, `{username}` and `{servername}` in volume names and paths.
    pub fn format_template(&self, template: &str, user_id: &str, server_name: &str) -> String {
        template
            .replace("{prefix}", &self.prefix)
            .replace("{username}", &escape(user_id))
            .replace("{servername}", &escape(server_name))
    }
}

fn validate_prefix(prefix: &str) -> Result<()> {
    let mut chars = prefix.chars();
    let valid_first = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid_first || !valid_rest {
        return Err(SpawnerError::InvalidName(format!(
            "prefix '{prefix}' must match [A-Za-z0-9][A-Za-z0-9_.-]*"
        )));
    }
    Ok(())
}

/// Escape everything outside `[a-z0-9]` as `-xx` per UTF-8 byte.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() {
            out.push(byte as char);
        } else {
            out.push(ESCAPE);
            // writing to a String cannot fail
            let _ = write!(out, "{byte:02x}");
        }
    }
    out
}
