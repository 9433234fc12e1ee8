//! Error types for the Zonelet operator
//!
//! Startup failures map one-to-one onto orchestration stages: configuration,
//! schema composition, manager construction, CRD installation, and controller
//! registration. Cleanup-task failures carry the state-machine stage they
//! occurred in and never abort the process.

use thiserror::Error;

use crate::cleanup::CleanupStage;

/// Main error type for Zonelet operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or incomplete configuration; fatal before any cluster
    /// interaction
    #[error("configuration error: {0}")]
    Config(String),

    /// One or more schema contributors failed; the registry is discarded
    #[error("schema registry composition failed: {}", failures.join("; "))]
    Schema {
        /// Failure messages from every contributor that failed, in
        /// contributor order
        failures: Vec<String>,
    },

    /// Manager construction failed (client build, cache wiring)
    #[error("manager: {context}: {source}")]
    Manager {
        /// What the manager was doing when the error occurred
        context: String,
        /// The underlying API error
        #[source]
        source: kube::Error,
    },

    /// Installing an owned CRD failed
    #[error("failed to install CRD {name}: {source}")]
    CrdInstall {
        /// Name of the CRD that failed to install
        name: &'static str,
        /// The underlying API error
        #[source]
        source: kube::Error,
    },

    /// A controller failed to attach to the manager; the whole startup
    /// aborts rather than running a degraded controller set
    #[error("controller registration failed for {controller}: {message}")]
    Registration {
        /// Name of the controller whose factory failed
        controller: &'static str,
        /// Factory error message
        message: String,
    },

    /// The legacy-CRD cleanup task failed at a specific stage; retried on
    /// the next leadership acquisition, never fatal to the process
    #[error("legacy resource cleanup failed at {stage}: {source}")]
    Cleanup {
        /// State-machine stage the failure occurred in
        stage: CleanupStage,
        /// The underlying API error
        #[source]
        source: kube::Error,
    },

    /// Leadership was lost after it had been acquired; terminal for the
    /// process so a restart can re-elect cleanly
    #[error("leadership lost")]
    LeadershipLost,

    /// A manager-owned runnable terminated with an error
    #[error("runnable {name} failed: {source}")]
    Runnable {
        /// Name of the failed runnable
        name: String,
        /// The runnable's terminal error
        #[source]
        source: Box<Error>,
    },

    /// Probe server error (bind or serve)
    #[error("probe server error: {0}")]
    Probes(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a schema composition error from aggregated contributor failures
    pub fn schema(failures: Vec<String>) -> Self {
        Self::Schema { failures }
    }

    /// Create a manager error with context
    pub fn manager(context: impl Into<String>, source: kube::Error) -> Self {
        Self::Manager {
            context: context.into(),
            source,
        }
    }

    /// Create a controller registration error
    pub fn registration(controller: &'static str, message: impl Into<String>) -> Self {
        Self::Registration {
            controller,
            message: message.into(),
        }
    }

    /// Create a cleanup error for the given state-machine stage
    pub fn cleanup(stage: CleanupStage, source: kube::Error) -> Self {
        Self::Cleanup { stage, source }
    }

    /// Create a runnable failure wrapping the runnable's own error
    pub fn runnable(name: impl Into<String>, source: Error) -> Self {
        Self::Runnable {
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the operation that produced this error is worth retrying
    ///
    /// Client-side API errors (4xx) are permanent: retrying a forbidden or
    /// invalid request produces the same answer. Everything else (timeouts,
    /// 5xx, connection resets) is assumed transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => !(400..500).contains(&ae.code),
            Error::Cleanup {
                source: kube::Error::Api(ae),
                ..
            } => !(400..500).contains(&ae.code),
            Error::Config(_) | Error::Schema { .. } | Error::Registration { .. } => false,
            _ => true,
        }
    }
}
