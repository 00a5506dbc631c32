use crate::k8s::{Application, ResourceExt};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{family::Family, gauge::Gauge},
    registry::Registry,
};

/// Records whether each tracked Application's destination credential is
/// scoped to the namespaces it uses.
#[derive(Clone, Debug, Default)]
pub struct OptimizationMetrics {
    status: Family<Labels, Gauge>,
}

/// Why an Application is, or is not, optimized.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Reason {
    Optimized,
    BypassLabel,
    ClusterResources,
    InCluster,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct Labels {
    name: String,
    application_namespace: String,
    destination_namespace: String,
    destination: String,
    reason: &'static str,
}

// === impl OptimizationMetrics ===

impl OptimizationMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let status = Family::<Labels, Gauge>::default();
        reg.register(
            "application_optimization_status",
            "Indicates whether the application is optimized (1) or not (0)",
            status.clone(),
        );
        Self { status }
    }

    /// Sets the Application's status, replacing any status previously
    /// recorded for another reason.
    pub fn observe(&self, app: &Application, reason: Reason, optimized: bool) {
        for other in Reason::ALL {
            if other != reason {
                self.status.remove(&Labels::new(app, other));
            }
        }
        self.status
            .get_or_create(&Labels::new(app, reason))
            .set(optimized as i64);
    }

    /// Removes every series recorded for the Application.
    pub fn clear(&self, app: &Application) {
        for reason in Reason::ALL {
            self.status.remove(&Labels::new(app, reason));
        }
    }
}

// === impl Reason ===

impl Reason {
    const ALL: [Self; 4] = [
        Self::Optimized,
        Self::BypassLabel,
        Self::ClusterResources,
        Self::InCluster,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Optimized => "optimized",
            Self::BypassLabel => "bypass-label",
            Self::ClusterResources => "cluster-resources",
            Self::InCluster => "in-cluster",
        }
    }
}

// === impl Labels ===

impl Labels {
    fn new(app: &Application, reason: Reason) -> Self {
        let destination = &app.spec.destination;
        let server = if destination.server.is_empty() {
            &destination.name
        } else {
            &destination.server
        };
        Self {
            name: app.name_any(),
            application_namespace: app.namespace().unwrap_or_default(),
            destination_namespace: destination.namespace.clone(),
            destination: server.clone(),
            reason: reason.as_str(),
        }
    }
}
