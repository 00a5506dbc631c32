use crate::{
    core::{StoreError, Versioned},
    k8s::{
        Api, Application, Client, ConfigMap, Namespace, Patch, PatchParams, PostParams,
        ResourceExt, Secret,
    },
};
use std::collections::BTreeMap;

/// The cluster objects read and written by the admission webhook and the
/// namespace tracker.
///
/// Destination credential objects are read and replaced through
/// [`Versioned`] so that concurrent updates are detected.
#[async_trait::async_trait]
pub trait Store: Versioned<Secret> + Send + Sync {
    /// Returns the labels of a namespace, or `None` if it does not exist.
    async fn namespace_labels(
        &self,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError>;

    /// Returns the data of a ConfigMap, or `None` if it does not exist.
    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError>;

    async fn applications(&self, namespace: &str) -> Result<Vec<Application>, StoreError>;

    /// Replaces the Application's finalizers, failing with a conflict if the
    /// Application changed since it was observed.
    async fn set_finalizers(
        &self,
        app: &Application,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError>;
}

/// A [`Store`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Versioned<Secret> for KubeStore {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(store_error)
    }

    async fn write(
        &self,
        namespace: &str,
        name: &str,
        secret: &Secret,
    ) -> Result<Secret, StoreError> {
        // The replacement carries the resourceVersion that was read, so the
        // API server rejects it if the secret changed in between.
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .replace(name, &PostParams::default(), secret)
            .await
            .map_err(store_error)
    }
}

#[async_trait::async_trait]
impl Store for KubeStore {
    async fn namespace_labels(
        &self,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        let ns = Api::<Namespace>::all(self.client.clone())
            .get_opt(name)
            .await
            .map_err(store_error)?;
        Ok(ns.map(|ns| ns.labels().clone()))
    }

    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        let cm = Api::<ConfigMap>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(store_error)?;
        Ok(cm.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn applications(&self, namespace: &str) -> Result<Vec<Application>, StoreError> {
        let apps = Api::<Application>::namespaced(self.client.clone(), namespace)
            .list(&Default::default())
            .await
            .map_err(store_error)?;
        Ok(apps.items)
    }

    async fn set_finalizers(
        &self,
        app: &Application,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError> {
        let namespace = app.namespace().unwrap_or_default();
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": app.resource_version(),
            },
        });
        Api::<Application>::namespaced(self.client.clone(), &namespace)
            .patch(&app.name_any(), &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

fn store_error(error: kube::Error) -> StoreError {
    match error {
        kube::Error::Api(rsp) if rsp.code == 409 => StoreError::Conflict,
        error => StoreError::Api(error.into()),
    }
}
