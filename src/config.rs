//! CLI options and the completed configuration bundle
//!
//! `Options` is the raw clap surface; `Options::complete()` validates it and
//! produces the immutable [`CompletedOptions`] bundle the orchestrator
//! consumes. Each controller gets its own explicit config struct out of the
//! bundle; controllers never read shared mutable defaults.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use clap::Args;

use crate::controller::KNOWN_CONTROLLERS;
use crate::{Error, Result, LEADER_LEASE_NAME, ZONELET_SYSTEM_NAMESPACE};

/// Raw command-line options
#[derive(Args, Clone, Debug)]
pub struct Options {
    /// Sustained cluster API request rate (requests per second)
    #[arg(long, default_value_t = 100.0)]
    pub qps: f32,

    /// Burst capacity on top of the sustained rate
    #[arg(long, default_value_t = 130)]
    pub burst: u32,

    /// Connect timeout for cluster API calls, in seconds
    #[arg(long = "connect-timeout", default_value_t = 5)]
    pub connect_timeout_secs: u64,

    /// Read timeout for cluster API calls, in seconds
    #[arg(long = "read-timeout", default_value_t = 30)]
    pub read_timeout_secs: u64,

    /// Namespace the operator runs in (defaults to $POD_NAMESPACE, then
    /// zonelet-system); home of the heartbeat and leader-election leases
    #[arg(long)]
    pub namespace: Option<String>,

    /// Bind address for the health and readiness probe server
    #[arg(long, default_value = "0.0.0.0:8081")]
    pub probe_addr: String,

    /// Enable lease-based leader election (required for multi-replica
    /// deployments)
    #[arg(long)]
    pub leader_election: bool,

    /// Process identity used as lease holder (defaults to $POD_NAME, then a
    /// generated id)
    #[arg(long)]
    pub identity: Option<String>,

    /// Controllers to skip, comma separated: lifecycle,healthcheck,heartbeat
    #[arg(long, value_delimiter = ',')]
    pub disable_controllers: Vec<String>,

    /// Reconcile extensions even without the operation annotation
    #[arg(long)]
    pub ignore_operation_annotation: bool,

    /// Maximum concurrent lifecycle reconciles
    #[arg(long, default_value_t = 5)]
    pub lifecycle_max_concurrent: u16,

    /// Lifecycle re-sync period in seconds
    #[arg(long, default_value_t = 300)]
    pub lifecycle_sync: u64,

    /// Maximum concurrent healthcheck reconciles
    #[arg(long, default_value_t = 3)]
    pub healthcheck_max_concurrent: u16,

    /// Healthcheck period in seconds
    #[arg(long, default_value_t = 30)]
    pub healthcheck_sync: u64,

    /// Heartbeat lease renew interval in seconds
    #[arg(long, default_value_t = 30)]
    pub heartbeat_renew: u64,

    /// DNS class served by the deployed component
    #[arg(long, default_value = "zonelet")]
    pub dns_class: String,

    /// Container image for the deployed zone-manager component
    #[arg(long, default_value = "ghcr.io/arbor-dev/zone-manager:v0.11.3")]
    pub component_image: String,

    /// Replica count for the deployed component
    #[arg(long, default_value_t = 1)]
    pub component_replicas: i32,
}

impl Options {
    /// Validate the raw options and produce the immutable bundle
    ///
    /// All validation failures are configuration errors reported before any
    /// cluster interaction.
    pub fn complete(self) -> Result<CompletedOptions> {
        if !self.qps.is_finite() || self.qps <= 0.0 {
            return Err(Error::config("qps must be a positive number"));
        }
        if self.burst == 0 {
            return Err(Error::config("burst must be at least 1"));
        }
        if (self.burst as f32) < self.qps {
            return Err(Error::config(format!(
                "burst ({}) must not be lower than qps ({})",
                self.burst, self.qps
            )));
        }
        if self.heartbeat_renew == 0 || self.heartbeat_renew > 300 {
            return Err(Error::config(
                "heartbeat renew interval must be between 1 and 300 seconds",
            ));
        }
        if self.healthcheck_sync < 5 {
            return Err(Error::config(
                "healthcheck sync period must be at least 5 seconds",
            ));
        }
        if self.component_replicas < 1 {
            return Err(Error::config("component replicas must be at least 1"));
        }
        for name in &self.disable_controllers {
            if !KNOWN_CONTROLLERS.contains(&name.as_str()) {
                return Err(Error::config(format!(
                    "unknown controller {name:?} in --disable-controllers (known: {})",
                    KNOWN_CONTROLLERS.join(", ")
                )));
            }
        }
        let probe_addr: SocketAddr = self
            .probe_addr
            .parse()
            .map_err(|e| Error::config(format!("invalid probe address {:?}: {e}", self.probe_addr)))?;

        let namespace = self
            .namespace
            .clone()
            .or_else(|| std::env::var("POD_NAMESPACE").ok())
            .unwrap_or_else(|| ZONELET_SYSTEM_NAMESPACE.to_string());
        let identity = self
            .identity
            .clone()
            .or_else(|| std::env::var("POD_NAME").ok())
            .unwrap_or_else(|| format!("zonelet-{}", uuid::Uuid::new_v4()));

        let leadership = self.leader_election.then(|| LeadershipSettings {
            lease_name: LEADER_LEASE_NAME.to_string(),
            namespace: namespace.clone(),
            identity: identity.clone(),
        });

        Ok(CompletedOptions {
            connection: ConnectionTuning {
                qps: self.qps,
                burst: self.burst,
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                read_timeout: Duration::from_secs(self.read_timeout_secs),
            },
            namespace,
            probe_addr,
            identity,
            leadership,
            lifecycle: LifecycleConfig {
                max_concurrent: self.lifecycle_max_concurrent,
                sync_period: Duration::from_secs(self.lifecycle_sync),
                ignore_operation_annotation: self.ignore_operation_annotation,
            },
            healthcheck: HealthCheckConfig {
                max_concurrent: self.healthcheck_max_concurrent,
                sync_period: Duration::from_secs(self.healthcheck_sync),
            },
            heartbeat: HeartbeatConfig {
                renew_interval: Duration::from_secs(self.heartbeat_renew),
            },
            service: ServiceConfig {
                dns_class: self.dns_class,
                image: self.component_image,
                replicas: self.component_replicas,
            },
            disabled: self.disable_controllers.into_iter().collect(),
        })
    }
}

/// Connection tuning applied to the cluster connection before the manager is
/// constructed
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionTuning {
    /// Sustained request rate
    pub qps: f32,
    /// Burst capacity
    pub burst: u32,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Per-request read timeout
    pub read_timeout: Duration,
}

/// Leader-election settings (present only when election is enabled)
#[derive(Clone, Debug, PartialEq)]
pub struct LeadershipSettings {
    /// Lease object name
    pub lease_name: String,
    /// Lease namespace
    pub namespace: String,
    /// Holder identity written into the lease
    pub identity: String,
}

/// Lifecycle controller configuration
#[derive(Clone, Debug, PartialEq)]
pub struct LifecycleConfig {
    /// Maximum concurrent reconciles
    pub max_concurrent: u16,
    /// Re-sync period for settled extensions
    pub sync_period: Duration,
    /// Act on every watch event instead of waiting for the operation
    /// annotation
    pub ignore_operation_annotation: bool,
}

/// Healthcheck controller configuration
#[derive(Clone, Debug, PartialEq)]
pub struct HealthCheckConfig {
    /// Maximum concurrent reconciles
    pub max_concurrent: u16,
    /// How often each extension's component health is re-checked
    pub sync_period: Duration,
}

/// Heartbeat controller configuration
#[derive(Clone, Debug, PartialEq)]
pub struct HeartbeatConfig {
    /// How often the heartbeat lease is renewed
    pub renew_interval: Duration,
}

/// Deployed-component configuration
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceConfig {
    /// DNS class the component serves
    pub dns_class: String,
    /// Component container image
    pub image: String,
    /// Component replica count
    pub replicas: i32,
}

/// The immutable configuration bundle: constructed once at process start,
/// consumed once during orchestration, never mutated afterwards
#[derive(Clone, Debug)]
pub struct CompletedOptions {
    /// Cluster connection tuning
    pub connection: ConnectionTuning,
    /// Operator namespace
    pub namespace: String,
    /// Probe server bind address
    pub probe_addr: SocketAddr,
    /// Process identity (lease holder, heartbeat holder)
    pub identity: String,
    /// Leader-election settings; `None` runs every runnable immediately
    pub leadership: Option<LeadershipSettings>,
    /// Lifecycle controller configuration
    pub lifecycle: LifecycleConfig,
    /// Healthcheck controller configuration
    pub healthcheck: HealthCheckConfig,
    /// Heartbeat controller configuration
    pub heartbeat: HeartbeatConfig,
    /// Deployed-component configuration
    pub service: ServiceConfig,
    /// Controllers excluded from registration
    pub disabled: BTreeSet<String>,
}

impl CompletedOptions {
    /// Whether the named controller should be registered
    pub fn controller_enabled(&self, name: &str) -> bool {
        !self.disabled.contains(name)
    }
}
