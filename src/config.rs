//! Controller configuration
//!
//! Every setting can be given as a flag or through a `BUILDKIT_OPERATOR_*`
//! environment variable, so the same binary runs unchanged from a Deployment
//! manifest or a developer shell.

use std::time::Duration;

use clap::Args;

/// Settings for the controller loops
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "BUILDKIT_OPERATOR_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Field manager used for server-side apply and status patches
    #[arg(
        long,
        env = "BUILDKIT_OPERATOR_FIELD_MANAGER",
        default_value = crate::FIELD_MANAGER
    )]
    pub field_manager: String,

    /// Seconds to wait before re-checking a pod that is not ready yet
    #[arg(long, env = "BUILDKIT_OPERATOR_NOT_READY_BACKOFF", default_value = "5")]
    pub not_ready_backoff_secs: u64,

    /// Seconds to wait before retrying a failed reconcile
    #[arg(long, env = "BUILDKIT_OPERATOR_ERROR_BACKOFF", default_value = "5")]
    pub error_backoff_secs: u64,

    /// Server-side timeout for watch requests
    #[arg(long, env = "BUILDKIT_OPERATOR_WATCH_TIMEOUT", default_value = "25")]
    pub watch_timeout_secs: u32,

    /// Emit logs as JSON
    #[arg(long, env = "BUILDKIT_OPERATOR_JSON_LOGS", default_value = "false")]
    pub json_logs: bool,
}

impl ControllerConfig {
    /// Delay before re-checking a pod that is not ready yet
    pub fn not_ready_backoff(&self) -> Duration {
        Duration::from_secs(self.not_ready_backoff_secs)
    }

    /// Delay before retrying a failed reconcile
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            field_manager: crate::FIELD_MANAGER.to_string(),
            not_ready_backoff_secs: 5,
            error_backoff_secs: 5,
            watch_timeout_secs: 25,
            json_logs: false,
        }
    }
}
