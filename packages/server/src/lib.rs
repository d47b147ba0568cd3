// Fluxbase job execution core
//
// This crate is the durable job queue of the platform: a Postgres-backed
// queue of job instances claimed by a pool of workers, each job running
// user-supplied code in a sandboxed subprocess, with cron scheduling,
// progress reporting, cancellation and retries.
//
// The HTTP surface, authentication and code bundling live elsewhere; this
// crate is consumed as a library through `kernel::jobs::JobService`.

pub mod common;
pub mod config;
pub mod kernel;

pub use config::*;
