// ServerKernel - core infrastructure with all dependencies

use sqlx::PgPool;
use std::sync::Arc;

use super::traits::{NullSecretStore, SecretStore};
use crate::config::Config;

/// ServerKernel holds all server dependencies
pub struct ServerKernel {
    pub db_pool: PgPool,
    pub config: Config,
    /// Source of per-namespace and per-user secrets injected into user code.
    pub secrets: Arc<dyn SecretStore>,
}

impl ServerKernel {
    /// Creates a new ServerKernel with the given dependencies
    pub fn new(db_pool: PgPool, config: Config, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            db_pool,
            config,
            secrets,
        }
    }

    /// Kernel with no secret source, for deployments without a secret store.
    pub fn without_secrets(db_pool: PgPool, config: Config) -> Self {
        Self::new(db_pool, config, Arc::new(NullSecretStore))
    }
}
