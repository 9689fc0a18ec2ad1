use std::collections::HashMap;

// ---------------------------------------------------------------------------
// SecretsProvider
// ---------------------------------------------------------------------------

/// Supplies credentials for capability grants.
///
/// Credentials are never logged and never reach the LLM prompt; they flow
/// only into tool-server child environments.
pub trait SecretsProvider: Send + Sync {
    /// Credential for a grant name (e.g. `github:read`), if configured.
    fn get(&self, grant: &str) -> Option<String>;
}

// ---------------------------------------------------------------------------
// EnvSecrets
// ---------------------------------------------------------------------------

/// Maps grant names to environment variables:
/// `github:read` -> `WARREN_SECRET_GITHUB_READ`.
#[derive(Debug, Default)]
pub struct EnvSecrets;

impl EnvSecrets {
    pub fn new() -> Self {
        Self
    }

    /// Environment variable name for a grant.
    pub fn var_name(grant: &str) -> String {
        let mut name = String::with_capacity(grant.len());
        for ch in grant.chars() {
            if ch.is_ascii_alphanumeric() {
                name.push(ch.to_ascii_uppercase());
            } else {
                name.push('_');
            }
        }
        format!("WARREN_SECRET_{name}")
    }
}

impl SecretsProvider for EnvSecrets {
    fn get(&self, grant: &str) -> Option<String> {
        std::env::var(Self::var_name(grant)).ok().filter(|v| !v.is_empty())
    }
}

// ---------------------------------------------------------------------------
// StaticSecrets — fixed map, for tests and embedding
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, grant: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(grant.into(), value.into());
        self
    }
}

impl SecretsProvider for StaticSecrets {
    fn get(&self, grant: &str) -> Option<String> {
        self.values.get(grant).cloned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
