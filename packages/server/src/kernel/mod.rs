// Kernel - core infrastructure with dependency injection
//
// The ServerKernel holds the server dependencies (database pool, config,
// secret source) and provides dependency injection through traits for
// testability.

pub mod jobs;
pub mod server_kernel;
pub mod traits;

pub use server_kernel::ServerKernel;
pub use traits::{NullSecretStore, SecretStore};
