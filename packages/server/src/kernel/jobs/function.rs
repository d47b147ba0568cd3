//! Job function catalog: the reusable code templates jobs are created from.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::sql::Record;

/// Where a function definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "function_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FunctionSource {
    Filesystem,
    #[default]
    Api,
}

/// Capability bits handed to the sandboxed runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub allow_net: bool,
    pub allow_env: bool,
    pub allow_read: bool,
    pub allow_write: bool,
    pub memory_limit_mb: i32,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            allow_net: true,
            allow_env: true,
            allow_read: false,
            allow_write: false,
            memory_limit_mb: 256,
        }
    }
}

/// A reusable code template bound to a `(namespace, name)`.
///
/// Upserting on `(name, namespace)` increments `version`; deleting a function
/// leaves its job instances behind with frozen `job_name`/`namespace` copies.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobFunction {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    pub name: String,
    #[builder(default = "default".to_string())]
    pub namespace: String,

    /// Executable text the runtime consumes (post-bundling).
    pub code: String,
    /// The text as submitted, kept for display and re-sync diffing.
    #[builder(default)]
    pub original_code: String,

    #[builder(default = true)]
    pub enabled: bool,
    /// Cron schedule, optionally suffixed `|<json-params>`.
    #[builder(default, setter(strip_option))]
    pub schedule: Option<String>,

    // Resource limits
    #[builder(default = 300)]
    pub timeout_seconds: i32,
    #[builder(default = 256)]
    pub memory_limit_mb: i32,
    #[builder(default = 0)]
    pub max_retries: i32,
    #[builder(default = 60)]
    pub progress_timeout_seconds: i32,

    // Capability bits
    #[builder(default = true)]
    pub allow_net: bool,
    #[builder(default = true)]
    pub allow_env: bool,
    #[builder(default = false)]
    pub allow_read: bool,
    #[builder(default = false)]
    pub allow_write: bool,

    #[builder(default, setter(strip_option))]
    pub require_role: Option<String>,

    #[builder(default = 1)]
    pub version: i32,
    #[builder(default)]
    pub source: FunctionSource,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl JobFunction {
    /// Capability bits plus the heap cap, as the runtime wants them.
    pub fn permissions(&self) -> Permissions {
        Permissions {
            allow_net: self.allow_net,
            allow_env: self.allow_env,
            allow_read: self.allow_read,
            allow_write: self.allow_write,
            memory_limit_mb: self.memory_limit_mb,
        }
    }

    /// Find a function by its `(namespace, name)` key.
    pub async fn find_by_name(
        namespace: &str,
        name: &str,
        db: &sqlx::PgPool,
    ) -> Result<Option<Self>> {
        let function = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, name, namespace, code, original_code, enabled, schedule,
                   timeout_seconds, memory_limit_mb, max_retries, progress_timeout_seconds,
                   allow_net, allow_env, allow_read, allow_write, require_role,
                   version, source, created_at, updated_at
            FROM functions
            WHERE namespace = $1 AND name = $2
            "#,
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(db)
        .await?;

        Ok(function)
    }

    /// List functions, optionally scoped to a namespace.
    pub async fn list(namespace: Option<&str>, db: &sqlx::PgPool) -> Result<Vec<Self>> {
        let functions = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, name, namespace, code, original_code, enabled, schedule,
                   timeout_seconds, memory_limit_mb, max_retries, progress_timeout_seconds,
                   allow_net, allow_env, allow_read, allow_write, require_role,
                   version, source, created_at, updated_at
            FROM functions
            WHERE $1::text IS NULL OR namespace = $1
            ORDER BY namespace, name
            "#,
        )
        .bind(namespace)
        .fetch_all(db)
        .await?;

        Ok(functions)
    }

    /// Insert-or-update on `(name, namespace)`, bumping `version` on update.
    pub async fn upsert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let function = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO functions (
                id, name, namespace, code, original_code, enabled, schedule,
                timeout_seconds, memory_limit_mb, max_retries, progress_timeout_seconds,
                allow_net, allow_env, allow_read, allow_write, require_role,
                version, source, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8, $9, $10, $11,
                $12, $13, $14, $15, $16,
                $17, $18, $19, $20
            )
            ON CONFLICT (name, namespace) DO UPDATE SET
                code = EXCLUDED.code,
                original_code = EXCLUDED.original_code,
                enabled = EXCLUDED.enabled,
                schedule = EXCLUDED.schedule,
                timeout_seconds = EXCLUDED.timeout_seconds,
                memory_limit_mb = EXCLUDED.memory_limit_mb,
                max_retries = EXCLUDED.max_retries,
                progress_timeout_seconds = EXCLUDED.progress_timeout_seconds,
                allow_net = EXCLUDED.allow_net,
                allow_env = EXCLUDED.allow_env,
                allow_read = EXCLUDED.allow_read,
                allow_write = EXCLUDED.allow_write,
                require_role = EXCLUDED.require_role,
                source = EXCLUDED.source,
                version = functions.version + 1,
                updated_at = NOW()
            RETURNING id, name, namespace, code, original_code, enabled, schedule,
                      timeout_seconds, memory_limit_mb, max_retries, progress_timeout_seconds,
                      allow_net, allow_env, allow_read, allow_write, require_role,
                      version, source, created_at, updated_at
            "#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.namespace)
        .bind(&self.code)
        .bind(&self.original_code)
        .bind(self.enabled)
        .bind(&self.schedule)
        .bind(self.timeout_seconds)
        .bind(self.memory_limit_mb)
        .bind(self.max_retries)
        .bind(self.progress_timeout_seconds)
        .bind(self.allow_net)
        .bind(self.allow_env)
        .bind(self.allow_read)
        .bind(self.allow_write)
        .bind(&self.require_role)
        .bind(self.version)
        .bind(self.source)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(function)
    }

    /// Delete by id; cascades to `function_files`, nulls out instances.
    pub async fn delete_by_id(id: Uuid, db: &sqlx::PgPool) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM functions WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?
            .rows_affected();

        Ok(deleted > 0)
    }
}

#[async_trait::async_trait]
impl Record for JobFunction {
    const TABLE: &'static str = "functions";
    type Id = Uuid;

    async fn find_by_id(id: Uuid, db: &sqlx::PgPool) -> Result<Self> {
        let function = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, name, namespace, code, original_code, enabled, schedule,
                   timeout_seconds, memory_limit_mb, max_retries, progress_timeout_seconds,
                   allow_net, allow_env, allow_read, allow_write, require_role,
                   version, source, created_at, updated_at
            FROM functions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(db)
        .await?;

        Ok(function)
    }

    async fn insert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let function = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO functions (
                id, name, namespace, code, original_code, enabled, schedule,
                timeout_seconds, memory_limit_mb, max_retries, progress_timeout_seconds,
                allow_net, allow_env, allow_read, allow_write, require_role,
                version, source, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8, $9, $10, $11,
                $12, $13, $14, $15, $16,
                $17, $18, $19, $20
            )
            RETURNING id, name, namespace, code, original_code, enabled, schedule,
                      timeout_seconds, memory_limit_mb, max_retries, progress_timeout_seconds,
                      allow_net, allow_env, allow_read, allow_write, require_role,
                      version, source, created_at, updated_at
            "#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.namespace)
        .bind(&self.code)
        .bind(&self.original_code)
        .bind(self.enabled)
        .bind(&self.schedule)
        .bind(self.timeout_seconds)
        .bind(self.memory_limit_mb)
        .bind(self.max_retries)
        .bind(self.progress_timeout_seconds)
        .bind(self.allow_net)
        .bind(self.allow_env)
        .bind(self.allow_read)
        .bind(self.allow_write)
        .bind(&self.require_role)
        .bind(self.version)
        .bind(self.source)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(function)
    }

    async fn update(&self, db: &sqlx::PgPool) -> Result<Self> {
        let function = sqlx::query_as::<_, Self>(
            r#"
            UPDATE functions SET
                name = $1, namespace = $2, code = $3, original_code = $4, enabled = $5,
                schedule = $6, timeout_seconds = $7, memory_limit_mb = $8, max_retries = $9,
                progress_timeout_seconds = $10, allow_net = $11, allow_env = $12,
                allow_read = $13, allow_write = $14, require_role = $15, source = $16,
                version = functions.version + 1,
                updated_at = NOW()
            WHERE id = $17
            RETURNING id, name, namespace, code, original_code, enabled, schedule,
                      timeout_seconds, memory_limit_mb, max_retries, progress_timeout_seconds,
                      allow_net, allow_env, allow_read, allow_write, require_role,
                      version, source, created_at, updated_at
            "#,
        )
        .bind(&self.name)
        .bind(&self.namespace)
        .bind(&self.code)
        .bind(&self.original_code)
        .bind(self.enabled)
        .bind(&self.schedule)
        .bind(self.timeout_seconds)
        .bind(self.memory_limit_mb)
        .bind(self.max_retries)
        .bind(self.progress_timeout_seconds)
        .bind(self.allow_net)
        .bind(self.allow_env)
        .bind(self.allow_read)
        .bind(self.allow_write)
        .bind(&self.require_role)
        .bind(self.source)
        .bind(self.id)
        .fetch_one(db)
        .await?;

        Ok(function)
    }

    async fn delete(&self, db: &sqlx::PgPool) -> Result<()> {
        sqlx::query("DELETE FROM functions WHERE id = $1")
            .bind(self.id)
            .execute(db)
            .await?;

        Ok(())
    }
}

/// Supporting file for a multi-file function, addressed by
/// `(function_id, file_path)`.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct FunctionFile {
    pub id: Uuid,
    pub function_id: Uuid,
    pub file_path: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FunctionFile {
    pub fn new(function_id: Uuid, file_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            function_id,
            file_path: file_path.into(),
            content: content.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Insert-or-replace the file at `(function_id, file_path)`.
    pub async fn upsert(&self, db: &sqlx::PgPool) -> Result<Self> {
        let file = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO function_files (id, function_id, file_path, content, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (function_id, file_path) DO UPDATE SET
                content = EXCLUDED.content,
                updated_at = NOW()
            RETURNING id, function_id, file_path, content, created_at, updated_at
            "#,
        )
        .bind(self.id)
        .bind(self.function_id)
        .bind(&self.file_path)
        .bind(&self.content)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(file)
    }

    pub async fn list_for_function(function_id: Uuid, db: &sqlx::PgPool) -> Result<Vec<Self>> {
        let files = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, function_id, file_path, content, created_at, updated_at
            FROM function_files
            WHERE function_id = $1
            ORDER BY file_path
            "#,
        )
        .bind(function_id)
        .fetch_all(db)
        .await?;

        Ok(files)
    }
}
