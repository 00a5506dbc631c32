#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod access;
pub mod bypass;
pub mod destination;
pub mod namespaces;
pub mod store;

pub use self::{
    access::{has_admin_access, AccessCheck, AccessError, AuthorizationChecker, ConnectCluster},
    bypass::{bypass_allowed, is_enabled, optimization_bypassed},
    destination::{ClusterConfig, Destination, ResolveError, ResolvedDestination},
    namespaces::NamespaceSet,
    store::{read_modify_write, RetryError, StoreError, Update, Versioned},
};

/// Boxed error used at the seams to external systems.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
