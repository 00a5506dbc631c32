pub use application_rbac_validator_core as core;
pub use application_rbac_validator_k8s_api as k8s;

pub mod admission;
mod args;
pub mod metrics;
pub mod remote;
pub mod store;
pub mod tracker;


pub use self::{
    admission::{Admission, Approval, Rejection},
    args::Args,
    metrics::OptimizationMetrics,
    remote::KubeConnector,
    store::{KubeStore, Store},
    tracker::Tracker,
};

/// Reads an Application's destination.
pub fn destination(app: &k8s::Application) -> core::Destination {
    let dst = &app.spec.destination;
    core::Destination {
        server: dst.server.clone(),
        name: dst.name.clone(),
        namespace: dst.namespace.clone(),
    }
}
