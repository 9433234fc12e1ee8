//! Custom resource types for the Zonelet operator
//!
//! Three API groups meet here:
//!
//! - `dns.arbor.dev`: the DNS-management types served by the deployed
//!   `zone-manager` component. Zonelet installs these CRDs because it
//!   installs the component that serves them.
//! - `zonelet.dev`: types owned by this extension (`ZoneState`).
//! - `extensions.arbor.dev`: the Arbor platform's shared extension types
//!   (`Extension`, `Cluster`), declared locally for typed watching. Their
//!   CRDs belong to the platform and are never installed by this process.

mod dns;
mod platform;
mod state;

pub use dns::{
    DnsEntry, DnsEntrySpec, DnsEntryStatus, DnsProvider, DnsProviderSpec, DnsProviderStatus,
    DomainSelection, SecretReference, DNS_GROUP,
};
pub use platform::{
    Cluster, ClusterSpec, Extension, ExtensionCondition, ExtensionPhase, ExtensionSpec,
    ExtensionStatus, PLATFORM_GROUP,
};
pub use state::{StoredEntry, ZoneState, ZoneStateSpec, SERVICE_GROUP};
