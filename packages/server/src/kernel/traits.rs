//! Dependency-injection traits for collaborator services.
//!
//! The job core consumes secrets read-only through `SecretStore`; the real
//! implementation lives with the platform's secret management, outside this
//! crate.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

/// Read-only source of secrets merged into a job's environment.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Secrets scoped to a namespace, injected into every job of that
    /// namespace.
    async fn namespace_secrets(&self, namespace: &str) -> Result<HashMap<String, String>>;

    /// Secrets scoped to the submitting user, injected only when the job
    /// carries a submitter identity.
    async fn user_secrets(&self, user_id: &str) -> Result<HashMap<String, String>>;
}

/// Secret store that returns nothing. Used when no secret backend is wired.
pub struct NullSecretStore;

#[async_trait]
impl SecretStore for NullSecretStore {
    async fn namespace_secrets(&self, _namespace: &str) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    async fn user_secrets(&self, _user_id: &str) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}
