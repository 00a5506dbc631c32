//! Maintains the namespaces each destination credential object is declared to
//! need.
//!
//! A credential object's `namespaces` list is the union of the destination
//! namespaces of the Applications that deploy through it. Applications that
//! have been recorded carry the [`FINALIZER`] so their namespace can be
//! released before they disappear.

use crate::{
    core::{
        bypass::{is_enabled, optimization_bypassed},
        destination::is_in_cluster,
        namespaces::{CLUSTER_RESOURCES_KEY, NAMESPACES_KEY},
        read_modify_write, ClusterConfig, Destination, NamespaceSet, ResolveError, RetryError,
        StoreError, Update,
    },
    destination,
    k8s::{Api, Application, ByteString, Client, Resource, ResourceExt, Secret},
    metrics::{OptimizationMetrics, Reason},
    store::Store,
};
use futures::prelude::*;
use kube::runtime::{controller::Action, watcher, Controller};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Marks Applications whose destination namespace has been recorded.
pub const FINALIZER: &str = "argocd.dana.io/namespace-tracking";

const ERROR_REQUEUE: Duration = Duration::from_secs(5);

pub struct Tracker<S> {
    store: Arc<S>,
    cluster: Arc<ClusterConfig>,
    metrics: OptimizationMetrics,
    namespace_prefix: Option<String>,
    update_attempts: usize,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("credential object {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("credential object {namespace}/{name} still conflicted after {attempts} attempts")]
    ConflictRetryExhausted {
        namespace: String,
        name: String,
        attempts: usize,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// === impl Tracker ===

impl<S: Store + 'static> Tracker<S> {
    pub fn new(
        store: Arc<S>,
        cluster: Arc<ClusterConfig>,
        metrics: OptimizationMetrics,
        namespace_prefix: Option<String>,
        update_attempts: usize,
    ) -> Self {
        Self {
            store,
            cluster,
            metrics,
            namespace_prefix: namespace_prefix.filter(|p| !p.is_empty()),
            update_attempts,
        }
    }

    /// Drives the tracker from a watch on every Application in the cluster
    /// until shutdown is signaled.
    pub async fn run(self: Arc<Self>, client: Client, shutdown: drain::Watch) {
        let apps = Api::<Application>::all(client);
        let controller = Controller::new(apps, watcher::Config::default())
            .run(reconcile, error_policy, self)
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => trace!(namespace = ?obj.namespace, name = %obj.name, "Reconciled"),
                    Err(error) => debug!(%error, "Reconcile failed"),
                }
            });
        tokio::pin!(controller);

        tokio::select! {
            _ = &mut controller => {}
            handle = shutdown.signaled() => {
                debug!("Stopping the namespace tracker");
                drop(handle);
            }
        }
    }

    /// Brings the credential object and the Application's finalizer in line
    /// with the Application.
    pub async fn reconcile(&self, app: &Application) -> Result<(), Error> {
        let namespace = app.namespace().unwrap_or_default();
        if !self.in_scope(&namespace) {
            trace!(%namespace, name = %app.name_any(), "Ignoring Application");
            return Ok(());
        }

        if app.meta().deletion_timestamp.is_some() {
            return self.release(app).await;
        }
        self.track(app).await
    }

    fn in_scope(&self, namespace: &str) -> bool {
        match self.namespace_prefix.as_deref() {
            Some(prefix) => namespace.len() > prefix.len() && namespace.starts_with(prefix),
            None => true,
        }
    }

    async fn track(&self, app: &Application) -> Result<(), Error> {
        let dst = destination(app);
        if is_in_cluster(dst.target()) {
            debug!(name = %app.name_any(), "Application targets the local cluster");
            self.metrics.observe(app, Reason::InCluster, false);
            return Ok(());
        }

        let namespace = app.namespace().unwrap_or_default();
        let credential_id = dst.resolve(&self.cluster)?.credential_id;
        let secret = self
            .store
            .read(&namespace, &credential_id)
            .await?
            .ok_or_else(|| Error::SecretNotFound {
                namespace: namespace.clone(),
                name: credential_id.clone(),
            })?;

        if let Some(reason) = excluded(&secret) {
            info!(secret = %credential_id, ?reason, "Credential object is not optimized");
            self.metrics.observe(app, reason, false);
            return Ok(());
        }

        if !dst.namespace.is_empty() {
            let update = read_modify_write(
                &*self.store,
                &namespace,
                &credential_id,
                self.update_attempts,
                |secret: &mut Secret| {
                    if excluded(secret).is_some() {
                        return false;
                    }
                    let mut namespaces = namespaces(secret);
                    if !namespaces.insert(&dst.namespace) {
                        return false;
                    }
                    set_namespaces(secret, &namespaces);
                    true
                },
            )
            .await
            .map_err(|error| self.retry_error(error, &namespace, &credential_id))?;

            match update {
                Update::Written(_) => {
                    info!(secret = %credential_id, namespace = %dst.namespace, "Added namespace")
                }
                Update::Unchanged(_) => {
                    debug!(secret = %credential_id, namespace = %dst.namespace, "Namespace already recorded")
                }
                Update::Missing => {
                    return Err(Error::SecretNotFound {
                        namespace,
                        name: credential_id,
                    })
                }
            }
        }

        if !has_finalizer(app) {
            let mut finalizers = app.finalizers().to_vec();
            finalizers.push(FINALIZER.to_string());
            self.store.set_finalizers(app, finalizers).await?;
            debug!(name = %app.name_any(), "Added finalizer");
        }

        self.metrics.observe(app, Reason::Optimized, true);
        Ok(())
    }

    async fn release(&self, app: &Application) -> Result<(), Error> {
        if !has_finalizer(app) {
            // Untracked Applications may still have been observed.
            self.metrics.clear(app);
            return Ok(());
        }

        let dst = destination(app);
        if !is_in_cluster(dst.target()) && !dst.namespace.is_empty() {
            self.release_namespace(app, &dst).await?;
        }

        let finalizers = app
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        self.store.set_finalizers(app, finalizers).await?;
        debug!(name = %app.name_any(), "Removed finalizer");

        self.metrics.clear(app);
        Ok(())
    }

    /// Removes the Application's destination namespace from its credential
    /// object unless another live Application still deploys there.
    async fn release_namespace(&self, app: &Application, dst: &Destination) -> Result<(), Error> {
        let namespace = app.namespace().unwrap_or_default();
        let name = app.name_any();
        let credential_id = dst.resolve(&self.cluster)?.credential_id;

        let secret = match self.store.read(&namespace, &credential_id).await? {
            Some(secret) => secret,
            None => {
                debug!(secret = %credential_id, "Credential object is gone");
                return Ok(());
            }
        };
        if optimization_bypassed(secret.labels()) {
            debug!(secret = %credential_id, "Credential object is not optimized");
            return Ok(());
        }

        let apps = self.store.applications(&namespace).await?;
        let in_use = apps.iter().any(|other| {
            other.name_any() != name
                && other.meta().deletion_timestamp.is_none()
                && self.same_destination(dst, &destination(other))
        });
        if in_use {
            debug!(secret = %credential_id, namespace = %dst.namespace, "Namespace is still in use");
            return Ok(());
        }

        let update = read_modify_write(
            &*self.store,
            &namespace,
            &credential_id,
            self.update_attempts,
            |secret: &mut Secret| {
                if optimization_bypassed(secret.labels()) {
                    return false;
                }
                let mut namespaces = namespaces(secret);
                if !namespaces.remove(&dst.namespace) {
                    return false;
                }
                set_namespaces(secret, &namespaces);
                true
            },
        )
        .await
        .map_err(|error| self.retry_error(error, &namespace, &credential_id))?;

        if let Update::Written(_) = update {
            info!(secret = %credential_id, namespace = %dst.namespace, "Removed namespace");
        }
        Ok(())
    }

    /// Destinations match when they name the same namespace on the same
    /// cluster, however the cluster is spelled.
    fn same_destination(&self, a: &Destination, b: &Destination) -> bool {
        if a.namespace != b.namespace {
            return false;
        }
        if a.target() == b.target() {
            return true;
        }
        match (a.resolve(&self.cluster), b.resolve(&self.cluster)) {
            (Ok(a), Ok(b)) => a.server_url == b.server_url,
            _ => false,
        }
    }

    fn retry_error(&self, error: RetryError, namespace: &str, name: &str) -> Error {
        match error {
            RetryError::Exhausted { attempts } => Error::ConflictRetryExhausted {
                namespace: namespace.to_string(),
                name: name.to_string(),
                attempts,
            },
            RetryError::Store(error) => Error::Store(error),
        }
    }
}

async fn reconcile<S: Store + 'static>(
    app: Arc<Application>,
    tracker: Arc<Tracker<S>>,
) -> Result<Action, Error> {
    tracker.reconcile(&app).await?;
    Ok(Action::await_change())
}

fn error_policy<S>(app: Arc<Application>, error: &Error, _: Arc<Tracker<S>>) -> Action {
    warn!(
        namespace = ?app.namespace(),
        name = %app.name_any(),
        %error,
        "Failed to reconcile Application",
    );
    Action::requeue(ERROR_REQUEUE)
}

fn has_finalizer(app: &Application) -> bool {
    app.finalizers().iter().any(|f| f == FINALIZER)
}

/// Returns the reason a credential object is excluded from tracking.
fn excluded(secret: &Secret) -> Option<Reason> {
    if optimization_bypassed(secret.labels()) {
        return Some(Reason::BypassLabel);
    }
    let cluster_wide = data(secret, CLUSTER_RESOURCES_KEY)
        .map(|v| is_enabled(&v))
        .unwrap_or(false);
    if cluster_wide {
        return Some(Reason::ClusterResources);
    }
    None
}

fn data(secret: &Secret, key: &str) -> Option<String> {
    let ByteString(bytes) = secret.data.as_ref()?.get(key)?;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

fn namespaces(secret: &Secret) -> NamespaceSet {
    NamespaceSet::parse(&data(secret, NAMESPACES_KEY).unwrap_or_default())
}

fn set_namespaces(secret: &mut Secret, namespaces: &NamespaceSet) {
    secret.data.get_or_insert_with(Default::default).insert(
        NAMESPACES_KEY.to_string(),
        ByteString(namespaces.to_string().into_bytes()),
    );
}
