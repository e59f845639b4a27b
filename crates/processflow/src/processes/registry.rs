use std::collections::HashMap;

use crate::processes::dispatch::Operation;

/// Timeout/retry policy for one resource type (and optionally one operation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourcePolicy {
    pub timeout: Option<i32>,
    pub tries: Option<i32>,
}

/// Maps resource types to the policy a dispatch descriptor is built from.
///
/// Lookup order: `(type, operation)`, then `(type, any)`, then the default.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    default: ResourcePolicy,
    overrides: HashMap<(String, Option<Operation>), ResourcePolicy>,
}

impl ResourceRegistry {
    pub fn new(default: ResourcePolicy) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_policy(
        mut self,
        resource_type: &str,
        operation: Option<Operation>,
        policy: ResourcePolicy,
    ) -> Self {
        self.insert(resource_type, operation, policy);
        self
    }

    pub fn insert(
        &mut self,
        resource_type: &str,
        operation: Option<Operation>,
        policy: ResourcePolicy,
    ) {
        self.overrides
            .insert((resource_type.to_string(), operation), policy);
    }

    pub fn default_policy(&self) -> ResourcePolicy {
        self.default
    }

    pub fn policy_for(&self, resource_type: &str, operation: Operation) -> ResourcePolicy {
        self.overrides
            .get(&(resource_type.to_string(), Some(operation)))
            .or_else(|| self.overrides.get(&(resource_type.to_string(), None)))
            .copied()
            .unwrap_or(self.default)
    }

    /// Parse `articles:create=30/3;comments=60/-`.
    ///
    /// Each value is `timeout/tries`; `-` (or nothing) leaves that side unset.
    pub fn parse(policies: &str, default: ResourcePolicy) -> anyhow::Result<Self> {
        let mut registry = Self::new(default);

        for entry in policies.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("resource policy `{entry}` is missing `=`"))?;

            let (resource_type, operation) = match key.trim().split_once(':') {
                Some((rt, op)) => (rt.trim(), Some(op.parse::<Operation>()?)),
                None => (key.trim(), None),
            };
            if resource_type.is_empty() {
                anyhow::bail!("resource policy `{entry}` has an empty resource type");
            }

            let (timeout, tries) = value.split_once('/').unwrap_or((value, ""));
            let policy = ResourcePolicy {
                timeout: parse_positive(timeout, "timeout", entry)?,
                tries: parse_positive(tries, "tries", entry)?,
            };

            registry.insert(resource_type, operation, policy);
        }

        Ok(registry)
    }
}

fn parse_positive(raw: &str, field: &str, entry: &str) -> anyhow::Result<Option<i32>> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "-" {
        return Ok(None);
    }
    let n: i32 = raw.parse().map_err(|_| {
        anyhow::anyhow!("resource policy `{entry}`: {field} `{raw}` is not a number")
    })?;
    if n <= 0 {
        anyhow::bail!("resource policy `{entry}`: {field} must be > 0");
    }
    Ok(Some(n))
}
