//! Sandboxed subprocess runtime for user code.
//!
//! Each execution wraps the user code (see [`super::bridge`]), writes it to a
//! scratch file and runs it under a Deno-compatible runtime with flags derived
//! from the function's capability bits and memory limit. Stdout and stderr are
//! consumed line by line: progress markers and log lines are forwarded to the
//! [`ExecutionObserver`] installed at construction, the last result marker
//! becomes the job result.
//!
//! The wall-clock deadline (`timeout_override` or the request's max duration)
//! and the cancellation token both kill the subprocess; either exit is
//! reported as such, never as a generic execution failure.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use super::bridge::{classify_line, parse_result, wrap_code, OutputLine};
use super::function::Permissions;
use super::job::Progress;
use super::logs::LogLevel;
use crate::config::Config;

/// Host environment variables never forwarded to user code.
pub const DENIED_ENV_VARS: &[&str] = &[
    "FLUXBASE_JWT_SECRET",
    "DATABASE_URL",
    "POSTGRES_PASSWORD",
    "DB_PASSWORD",
    "S3_ACCESS_KEY_ID",
    "S3_SECRET_ACCESS_KEY",
    "SMTP_PASSWORD",
    "FLUXBASE_SETUP_TOKEN",
];

/// Variables the embedded client SDK needs even when env access is
/// restricted.
pub const SDK_ENV_ALLOWLIST: &[&str] = &[
    "FLUXBASE_URL",
    "FLUXBASE_SERVICE_TOKEN",
    "JOB_ID",
    "JOB_NAME",
    "NAMESPACE",
    "CANCELLED",
];

/// Everything the runtime needs to know about one job execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRequest {
    pub job_id: Uuid,
    pub job_name: String,
    pub namespace: String,
    pub payload: Option<serde_json::Value>,
    pub retry_count: i32,
    #[serde(skip)]
    pub max_duration: Duration,
    pub created_by: Option<String>,
    pub user_role: Option<String>,
    pub user_email: Option<String>,
}

/// Outcome of one subprocess execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub cancelled: bool,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Sink for progress updates and log lines streamed out of the subprocess.
///
/// Installed at construction so the first progress line can never race a
/// late-installed callback.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    async fn on_progress(&self, job_id: Uuid, progress: Progress);
    async fn on_log(&self, job_id: Uuid, level: LogLevel, message: String);
}

/// A runtime that can execute job code.
#[async_trait]
pub trait JobRuntime: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        request: ExecutionRequest,
        permissions: &Permissions,
        cancel: CancellationToken,
        timeout_override: Option<Duration>,
        secrets: HashMap<String, String>,
    ) -> Result<ExecutionResult>;
}

/// Options for [`SandboxRuntime`], lifted from [`Config`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub binary: String,
    pub api_base_url: Option<String>,
    pub service_token: Option<String>,
    pub strict_results: bool,
}

impl From<&Config> for RuntimeOptions {
    fn from(config: &Config) -> Self {
        Self {
            binary: config.runtime_binary.clone(),
            api_base_url: config.api_base_url.clone(),
            service_token: config.service_token.clone(),
            strict_results: config.strict_results,
        }
    }
}

/// Subprocess-backed implementation of [`JobRuntime`].
pub struct SandboxRuntime {
    options: RuntimeOptions,
    observer: Arc<dyn ExecutionObserver>,
}

impl SandboxRuntime {
    pub fn new(options: RuntimeOptions, observer: Arc<dyn ExecutionObserver>) -> Self {
        Self { options, observer }
    }
}

#[async_trait]
impl JobRuntime for SandboxRuntime {
    async fn execute(
        &self,
        code: &str,
        request: ExecutionRequest,
        permissions: &Permissions,
        cancel: CancellationToken,
        timeout_override: Option<Duration>,
        secrets: HashMap<String, String>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let job_id = request.job_id;
        let timeout = timeout_override.unwrap_or(request.max_duration);

        let request_json =
            serde_json::to_value(&request).context("failed to serialise execution request")?;
        let wrapped = wrap_code(code, &request_json);

        // Removed on drop, which also covers every early-return path.
        let mut script = tempfile::Builder::new()
            .prefix("fluxbase-job-")
            .suffix(".ts")
            .tempfile()
            .context("failed to create scratch file for job code")?;
        script
            .write_all(wrapped.as_bytes())
            .context("failed to write job code")?;
        script.flush().context("failed to flush job code")?;

        let env = build_env(
            &request,
            &secrets,
            cancel.is_cancelled(),
            &self.options,
            std::env::vars(),
        );
        let args = build_args(permissions, script.path());

        let mut child = Command::new(&self.options.binary)
            .args(&args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn runtime {}", self.options.binary))?;

        let stdout = child.stdout.take().context("child stdout not captured")?;
        let stderr = child.stderr.take().context("child stderr not captured")?;

        let observer = Arc::clone(&self.observer);
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut last_result: Option<String> = None;
            let mut collected = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                match classify_line(&line) {
                    OutputLine::Progress(progress) => {
                        observer.on_progress(job_id, progress).await;
                    }
                    OutputLine::Result(raw) => {
                        last_result = Some(raw);
                    }
                    OutputLine::Log(message) => {
                        collected.push_str(&message);
                        collected.push('\n');
                        observer.on_log(job_id, LogLevel::Info, message).await;
                    }
                }
            }
            (last_result, collected)
        });

        let observer = Arc::clone(&self.observer);
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
                observer.on_log(job_id, LogLevel::Error, line).await;
            }
            collected
        });

        let deadline = tokio::time::Instant::now() + timeout;
        let mut timed_out = false;
        let mut was_cancelled = false;
        let status = loop {
            let interrupted = tokio::select! {
                status = child.wait() => {
                    break status.context("failed to wait on job subprocess")?;
                }
                _ = cancel.cancelled(), if !was_cancelled && !timed_out => {
                    was_cancelled = true;
                    true
                }
                _ = tokio::time::sleep_until(deadline), if !was_cancelled && !timed_out => {
                    timed_out = true;
                    true
                }
            };
            if interrupted {
                let _ = child.start_kill();
            }
        };

        // A panicking reader must not take the worker down with it.
        let (last_result, stdout_text) = match stdout_task.await {
            Ok(out) => out,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "stdout reader task failed");
                (None, String::new())
            }
        };
        let stderr_text = match stderr_task.await {
            Ok(out) => out,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "stderr reader task failed");
                String::new()
            }
        };

        let duration = started.elapsed();

        if was_cancelled {
            return Ok(ExecutionResult {
                success: false,
                result: None,
                error: Some("cancelled".to_string()),
                cancelled: true,
                timed_out: false,
                duration,
            });
        }

        if timed_out {
            warn!(job_id = %job_id, timeout_secs = timeout.as_secs(), "job hit wall-clock timeout");
            return Ok(ExecutionResult {
                success: false,
                result: None,
                error: Some(format!(
                    "timeout: job exceeded maximum duration of {}s",
                    timeout.as_secs()
                )),
                cancelled: false,
                timed_out: true,
                duration,
            });
        }

        if !status.success() {
            if let Some(error) = kill_error(&status, permissions.memory_limit_mb) {
                return Ok(ExecutionResult {
                    success: false,
                    result: None,
                    error: Some(error),
                    cancelled: false,
                    timed_out: false,
                    duration,
                });
            }

            // Non-zero exit: a failure marker, when present, carries the best
            // error message; otherwise fall back to stderr.
            let parsed = parse_result(
                last_result.as_deref(),
                &stdout_text,
                &stderr_text,
                self.options.strict_results,
            );
            let error = if parsed.success {
                if stderr_text.trim().is_empty() {
                    format!(
                        "process exited with status {}",
                        status.code().unwrap_or(-1)
                    )
                } else {
                    stderr_text.trim().to_string()
                }
            } else {
                parsed
                    .error
                    .unwrap_or_else(|| format!("process exited with status {}", status.code().unwrap_or(-1)))
            };

            return Ok(ExecutionResult {
                success: false,
                result: None,
                error: Some(error),
                cancelled: false,
                timed_out: false,
                duration,
            });
        }

        let parsed = parse_result(
            last_result.as_deref(),
            &stdout_text,
            &stderr_text,
            self.options.strict_results,
        );

        Ok(ExecutionResult {
            success: parsed.success,
            result: parsed.result,
            error: parsed.error,
            cancelled: false,
            timed_out: false,
            duration,
        })
    }
}

/// Command-line flags for the runtime binary, derived from capability bits.
/// When env access is denied, the SDK allow-list is still granted so the
/// embedded client keeps working.
fn build_args(permissions: &Permissions, script: &Path) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--quiet".to_string()];

    if permissions.allow_net {
        args.push("--allow-net".to_string());
    }
    if permissions.allow_read {
        args.push("--allow-read".to_string());
    }
    if permissions.allow_write {
        args.push("--allow-write".to_string());
    }
    if permissions.allow_env {
        args.push("--allow-env".to_string());
    } else {
        args.push(format!("--allow-env={}", SDK_ENV_ALLOWLIST.join(",")));
    }

    args.push(format!(
        "--v8-flags=--max-old-space-size={}",
        permissions.memory_limit_mb
    ));
    args.push(script.to_string_lossy().into_owned());

    args
}

/// Subprocess environment: the filtered host environment plus job variables
/// and caller-supplied secrets.
fn build_env(
    request: &ExecutionRequest,
    secrets: &HashMap<String, String>,
    cancelled: bool,
    options: &RuntimeOptions,
    host_env: impl Iterator<Item = (String, String)>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = host_env
        .filter(|(key, _)| !DENIED_ENV_VARS.contains(&key.as_str()))
        .collect();

    env.insert("JOB_ID".to_string(), request.job_id.to_string());
    env.insert("JOB_NAME".to_string(), request.job_name.clone());
    env.insert("NAMESPACE".to_string(), request.namespace.clone());
    env.insert("CANCELLED".to_string(), cancelled.to_string());

    if let Some(url) = &options.api_base_url {
        env.insert("FLUXBASE_URL".to_string(), url.clone());
    }
    if let Some(token) = &options.service_token {
        env.insert("FLUXBASE_SERVICE_TOKEN".to_string(), token.clone());
    }

    for (key, value) in secrets {
        env.insert(key.clone(), value.clone());
    }

    env
}

/// Error message for a signal-killed subprocess. Names OOM explicitly when
/// the configured limit exceeds what the host actually had available.
#[cfg(unix)]
fn kill_error(status: &std::process::ExitStatus, memory_limit_mb: i32) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    let signal = status.signal()?;
    if signal == libc::SIGKILL {
        if let Some(available_mb) = available_memory_mb() {
            if memory_limit_mb as u64 > available_mb {
                return Some(format!(
                    "process killed: likely out of memory (requested {} MB, {} MB available)",
                    memory_limit_mb, available_mb
                ));
            }
        }
    }
    Some(format!("process killed by signal {signal}"))
}

#[cfg(not(unix))]
fn kill_error(_status: &std::process::ExitStatus, _memory_limit_mb: i32) -> Option<String> {
    None
}

#[cfg(unix)]
fn available_memory_mb() -> Option<u64> {
    let pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages > 0 && page_size > 0 {
        Some(pages as u64 * page_size as u64 / (1024 * 1024))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_request() -> ExecutionRequest {
        ExecutionRequest {
            job_id: Uuid::new_v4(),
            job_name: "sum".to_string(),
            namespace: "default".to_string(),
            payload: Some(serde_json::json!({"n": 3})),
            retry_count: 0,
            max_duration: Duration::from_secs(300),
            created_by: None,
            user_role: None,
            user_email: None,
        }
    }

    fn sample_options() -> RuntimeOptions {
        RuntimeOptions {
            binary: "deno".to_string(),
            api_base_url: Some("http://localhost:8080".to_string()),
            service_token: None,
            strict_results: false,
        }
    }

    #[test]
    fn args_reflect_capability_bits() {
        let permissions = Permissions {
            allow_net: true,
            allow_env: true,
            allow_read: false,
            allow_write: false,
            memory_limit_mb: 256,
        };
        let args = build_args(&permissions, &PathBuf::from("/tmp/job.ts"));

        assert!(args.contains(&"--allow-net".to_string()));
        assert!(args.contains(&"--allow-env".to_string()));
        assert!(!args.contains(&"--allow-read".to_string()));
        assert!(!args.contains(&"--allow-write".to_string()));
        assert!(args.contains(&"--v8-flags=--max-old-space-size=256".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/job.ts");
    }

    #[test]
    fn denied_env_still_allows_sdk_variables() {
        let permissions = Permissions {
            allow_env: false,
            ..Permissions::default()
        };
        let args = build_args(&permissions, &PathBuf::from("/tmp/job.ts"));

        let env_flag = args
            .iter()
            .find(|a| a.starts_with("--allow-env="))
            .expect("restricted env flag present");
        assert!(env_flag.contains("FLUXBASE_URL"));
        assert!(env_flag.contains("JOB_ID"));
        assert!(!args.contains(&"--allow-env".to_string()));
    }

    #[test]
    fn secret_host_variables_are_not_forwarded() {
        let host = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("DATABASE_URL".to_string(), "postgres://secret".to_string()),
            ("SMTP_PASSWORD".to_string(), "hunter2".to_string()),
        ];
        let env = build_env(
            &sample_request(),
            &HashMap::new(),
            false,
            &sample_options(),
            host.into_iter(),
        );

        assert!(env.contains_key("PATH"));
        assert!(!env.contains_key("DATABASE_URL"));
        assert!(!env.contains_key("SMTP_PASSWORD"));
    }

    #[test]
    fn job_variables_and_secrets_are_injected() {
        let request = sample_request();
        let mut secrets = HashMap::new();
        secrets.insert("API_KEY".to_string(), "k".to_string());

        let env = build_env(
            &request,
            &secrets,
            false,
            &sample_options(),
            std::iter::empty(),
        );

        assert_eq!(env.get("JOB_ID").unwrap(), &request.job_id.to_string());
        assert_eq!(env.get("JOB_NAME").unwrap(), "sum");
        assert_eq!(env.get("NAMESPACE").unwrap(), "default");
        assert_eq!(env.get("CANCELLED").unwrap(), "false");
        assert_eq!(env.get("FLUXBASE_URL").unwrap(), "http://localhost:8080");
        assert_eq!(env.get("API_KEY").unwrap(), "k");
    }

    #[test]
    fn cancelled_flag_is_reflected() {
        let env = build_env(
            &sample_request(),
            &HashMap::new(),
            true,
            &sample_options(),
            std::iter::empty(),
        );
        assert_eq!(env.get("CANCELLED").unwrap(), "true");
    }
}
