//! Zonelet - DNS service extension operator for Arbor clusters
//!
//! Zonelet runs next to a workload cluster's control plane and provisions the
//! `zone-manager` component that serves DNS records for that cluster. The
//! operator itself stays out of record management: it deploys and supervises
//! the component, mirrors its availability into extension status, maintains a
//! liveness heartbeat, and cleans up resource definitions left behind by
//! older releases.
//!
//! # Architecture
//!
//! Startup is a strict, fail-fast sequence: tune the cluster connection,
//! compose the schema registry, construct the manager (which consumes the
//! registry and the client cache policy at construction), install owned CRDs,
//! bind per-controller configuration, register the enabled controllers
//! all-or-nothing, register the legacy-CRD cleanup task, then start the
//! manager. The manager owns every runnable for its lifetime and tears them
//! down through a single cancellation token.
//!
//! # Modules
//!
//! - [`crd`] - Custom resource types (DnsEntry, ZoneState, platform Extension, etc.)
//! - [`schema`] - Schema registry composition and owned-CRD installation
//! - [`cache`] - Client cache policy and the shared cluster reader
//! - [`manager`] - Manager runtime: client, runnables, leadership gating
//! - [`leadership`] - Lease-based leader election
//! - [`controller`] - Controller registration switches and the controllers
//! - [`cleanup`] - Legacy resource-definition cleanup task
//! - [`startup`] - The startup orchestrator
//! - [`probes`] - Health and readiness probe endpoints
//! - [`config`] - CLI options and the completed configuration bundle
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod cache;
pub mod cleanup;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod leadership;
pub mod manager;
pub mod probes;
pub mod schema;
pub mod startup;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralizing these here keeps CRD defaults, deployed manifests, and test
// fixtures in agreement.

/// Namespace the operator itself runs in, and the default home for the
/// heartbeat lease and the leader-election lease
pub const ZONELET_SYSTEM_NAMESPACE: &str = "zonelet-system";

/// Field manager used for all server-side apply patches issued by this process
pub const FIELD_MANAGER: &str = "zonelet-operator";

/// The extension type this operator reconciles; `Extension` objects with any
/// other `spec.type` are ignored
pub const EXTENSION_TYPE: &str = "zonelet-service";

/// Name of the deployed DNS-management component (Deployment name and
/// app label value)
pub const COMPONENT_NAME: &str = "zonelet-dns-manager";

/// Name of the heartbeat lease renewed while the operator is healthy
pub const HEARTBEAT_LEASE_NAME: &str = "zonelet-extension-heartbeat";

/// Name of the leader-election lease
pub const LEADER_LEASE_NAME: &str = "zonelet-operator-leader";

/// Annotation the platform sets on an extension to request reconciliation.
/// Unless the operator runs with `--ignore-operation-annotation`, extensions
/// without this annotation are left untouched.
pub const OPERATION_ANNOTATION: &str = "arbor.dev/operation";

/// Operation annotation value that requests a reconcile
pub const OPERATION_RECONCILE: &str = "reconcile";

/// Name of the per-cluster secret holding DNS provider credentials, mounted
/// into the deployed component when present
pub const PROVIDER_SECRET_NAME: &str = "zonelet-provider-credentials";

/// Watch timeout (seconds); must stay below the client's 30s read timeout so
/// the API server closes idle watches before the client gives up on them
pub const WATCH_TIMEOUT_SECS: u32 = 25;
