//! Container sandbox for executing untrusted task scripts.
//!
//! Every run gets a fresh container with no network, a read-only root
//! filesystem (only `/tmp` is writable), memory / CPU / process caps, a
//! non-root user and a hard kill on timeout. The container runtime is driven
//! through its command line with an explicit argument list.
//!
//! When the runtime is unavailable the sandbox can fall back to a dry run,
//! which is reported as [`SandboxMode::DryRun`] rather than as a contained
//! success.

/// Sandbox runtime and configuration.
pub mod runtime;

pub use runtime::{
    build_run_args, validate_script, SandboxConfig, SandboxMode, SandboxRequest, SandboxResult,
    SandboxRuntime,
};
