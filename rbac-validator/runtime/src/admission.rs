use crate::{
    core::{
        bypass::BYPASS_LABEL_PREFIX,
        bypass_allowed,
        destination::{cluster_name, is_in_cluster, token_key},
        has_admin_access, AccessError, BoxError, ClusterConfig, ConnectCluster, ResolveError,
    },
    destination,
    k8s::{Application, ObjectMeta, Resource, ResourceExt},
    store::Store,
};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{admission::Operation, DynamicObject};
use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, trace, warn};

/// ConfigMap in each tenant namespace describing its Argo CD instance.
pub const ARGO_CONFIG: &str = "argo-config";
pub const INSTANCE_NAME_KEY: &str = "instance_name";
pub const INSTANCE_USERS_KEY: &str = "instance_users";

/// ConfigMap in the webhook's namespace holding a token per destination
/// cluster.
pub const CLUSTER_TOKENS: &str = "application-rbac-validator-cluster-tokens";

pub const VALIDATE_PATH: &str = "/validate-argoproj-io-v1alpha1-application";

const MANAGEMENT_SUFFIX: &str = "-mgmt";

/// Decides whether Applications may deploy to their destinations.
pub struct Admission<S, C> {
    store: Arc<S>,
    connector: Arc<C>,
    cluster: Arc<ClusterConfig>,
    namespace_path: Arc<PathBuf>,
    remote_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),
}

/// Why an Application was admitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Approval {
    /// The Application deploys to the cluster it lives on.
    LocalDelivery,

    /// The Application's namespace carries a bypass label.
    Bypass,

    /// The Application manages its own Argo CD instance.
    Management,

    /// `admin` holds full access to the destination namespace.
    Authorized { admin: String },
}

/// Why an Application was denied.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("destination namespace and server must be specified")]
    InvalidDestination,

    #[error("failed to look up {resource}: {source}")]
    ConfigLookup {
        resource: String,
        #[source]
        source: BoxError,
    },

    #[error("destination server {0} must not be the Application's current cluster")]
    SelfDeployment(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("failed to read the webhook namespace from {path}: {source}")]
    WebhookNamespace {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no token for {server} in ConfigMap {namespace}/application-rbac-validator-cluster-tokens")]
    TokenNotFound { server: String, namespace: String },

    #[error("failed to build a client for {server}: {source}")]
    Connect {
        server: String,
        #[source]
        source: BoxError,
    },

    #[error("timed out checking permissions on {server}")]
    Timeout { server: String },

    #[error(transparent)]
    Access(#[from] AccessError),
}

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl<S, C> Clone for Admission<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            connector: self.connector.clone(),
            cluster: self.cluster.clone(),
            namespace_path: self.namespace_path.clone(),
            remote_timeout: self.remote_timeout,
        }
    }
}

impl<S, C> tower::Service<Request<hyper::body::Incoming>> for Admission<S, C>
where
    S: Store + 'static,
    C: ConnectCluster + Send + Sync + 'static,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        let path = req.uri().path();
        if req.method() != http::Method::POST || (path != "/" && path != VALIDATE_PATH) {
            return Box::pin(future::ok(not_found()));
        }

        let admission = self.clone();
        Box::pin(async move {
            let bytes = req.into_body().collect().await?.to_bytes();
            Ok(admission.review(&bytes).await)
        })
    }
}

impl<S, C> Admission<S, C>
where
    S: Store + 'static,
    C: ConnectCluster + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<S>,
        connector: Arc<C>,
        cluster: Arc<ClusterConfig>,
        namespace_path: PathBuf,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            store,
            connector,
            cluster,
            namespace_path: Arc::new(namespace_path),
            remote_timeout,
        }
    }

    /// Answers a serialized `AdmissionReview`.
    pub async fn review(&self, body: &[u8]) -> Response<Body> {
        let review: AdmissionReview = match serde_json::from_slice(body) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "Failed to parse request body");
                return json_response(AdmissionResponse::invalid(error).into_review());
            }
        };
        trace!(?review);

        let rsp = match review.try_into() {
            Ok(req) => {
                debug!(?req);
                self.admit(req).await
            }
            Err(error) => {
                warn!(%error, "Invalid admission request");
                AdmissionResponse::invalid(error)
            }
        };
        debug!(?rsp);
        json_response(rsp.into_review())
    }

    async fn admit(&self, req: AdmissionRequest) -> AdmissionResponse {
        if !is_kind::<Application>(&req) {
            return AdmissionResponse::invalid(format_args!(
                "unsupported resource type: {}.{}.{}",
                req.kind.group, req.kind.version, req.kind.kind
            ));
        }

        let mut rsp = AdmissionResponse::from(&req);
        match req.operation {
            Operation::Create | Operation::Update => {}
            Operation::Delete | Operation::Connect => return rsp,
        }

        let obj = match req.object {
            Some(obj) => obj,
            None => return rsp.deny("admission request missing 'object'"),
        };
        if let Some(old) = req.old_object.as_ref() {
            if !is_intent_change(old, &obj) {
                debug!(name = %obj.name_any(), "Spec unchanged, approving");
                return rsp;
            }
        }

        let app = match obj.try_parse::<Application>() {
            Ok(app) => app,
            Err(error) => {
                info!(%error, "Failed to parse Application");
                return rsp.deny(error);
            }
        };
        let ns = app.namespace().unwrap_or_default();
        let name = app.name_any();

        match self.validate(&app).await {
            Ok(approval) => {
                info!(%ns, %name, ?approval, "Approved");
                if approval == Approval::Bypass {
                    rsp.warnings = Some(vec![format!(
                        "RBAC validation bypassed by a {BYPASS_LABEL_PREFIX} label on namespace {ns}"
                    )]);
                }
                rsp
            }
            Err(error) => {
                info!(%error, %ns, %name, "Denied");
                rsp.deny(error)
            }
        }
    }

    /// Runs the admission pipeline for an Application.
    pub async fn validate(&self, app: &Application) -> Result<Approval, Rejection> {
        let namespace = app.namespace().unwrap_or_default();
        let dst = destination(app);

        if dst.server.is_empty() || dst.namespace.is_empty() {
            return Err(Rejection::InvalidDestination);
        }
        if dst.is_local_delivery() {
            return Ok(Approval::LocalDelivery);
        }

        let labels = self
            .store
            .namespace_labels(&namespace)
            .await
            .map_err(|error| Rejection::ConfigLookup {
                resource: format!("namespace {namespace}"),
                source: error.into(),
            })?
            .unwrap_or_default();
        if bypass_allowed(&labels, &cluster_name(&dst.server)) {
            return Ok(Approval::Bypass);
        }

        let argo_config = self.config_map(&namespace, ARGO_CONFIG).await?;
        let instance = config_value(&argo_config, &namespace, INSTANCE_NAME_KEY)?;
        if is_management(instance, &app.name_any()) {
            return Ok(Approval::Management);
        }

        if is_in_cluster(&dst.server) {
            return Err(Rejection::SelfDeployment(dst.server));
        }

        let server_url = dst.resolve(&self.cluster)?.server_url;
        let webhook_namespace = self.webhook_namespace().await?;
        let tokens = self
            .store
            .config_map(&webhook_namespace, CLUSTER_TOKENS)
            .await
            .map_err(|error| Rejection::ConfigLookup {
                resource: format!("ConfigMap {webhook_namespace}/{CLUSTER_TOKENS}"),
                source: error.into(),
            })?
            .unwrap_or_default();
        let token = tokens
            .get(&token_key(&server_url))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Rejection::TokenNotFound {
                server: server_url.clone(),
                namespace: webhook_namespace.clone(),
            })?;

        let checker = self
            .connector
            .connect(&server_url, &token)
            .map_err(|source| Rejection::Connect {
                server: server_url.clone(),
                source,
            })?;

        let admins = parse_admins(config_value(&argo_config, &namespace, INSTANCE_USERS_KEY)?);
        debug!(?admins, namespace = %dst.namespace, server = %server_url, "Checking namespace access");
        let admin = time::timeout(
            self.remote_timeout,
            has_admin_access(&checker, &admins, &dst.namespace),
        )
        .await
        .map_err(|_| Rejection::Timeout {
            server: server_url.clone(),
        })??;

        Ok(Approval::Authorized { admin })
    }

    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, Rejection> {
        let resource = || format!("ConfigMap {namespace}/{name}");
        match self.store.config_map(namespace, name).await {
            Ok(Some(data)) => Ok(data),
            Ok(None) => Err(Rejection::ConfigLookup {
                resource: resource(),
                source: "not found".into(),
            }),
            Err(error) => Err(Rejection::ConfigLookup {
                resource: resource(),
                source: error.into(),
            }),
        }
    }

    async fn webhook_namespace(&self) -> Result<String, Rejection> {
        let path = &*self.namespace_path;
        let ns = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| Rejection::WebhookNamespace {
                path: path.display().to_string(),
                source,
            })?;
        Ok(ns.trim().to_string())
    }
}

fn config_value<'m>(
    data: &'m BTreeMap<String, String>,
    namespace: &str,
    key: &str,
) -> Result<&'m str, Rejection> {
    data.get(key)
        .map(|v| v.trim())
        .ok_or_else(|| Rejection::ConfigLookup {
            resource: format!("key {key} in ConfigMap {namespace}/{ARGO_CONFIG}"),
            source: "not found".into(),
        })
}

fn is_management(instance: &str, app_name: &str) -> bool {
    !instance.is_empty()
        && app_name
            .strip_suffix(MANAGEMENT_SUFFIX)
            .map(|prefix| prefix == instance)
            .unwrap_or(false)
}

/// Splits an administrator list on commas and newlines.
fn parse_admins(users: &str) -> Vec<String> {
    users
        .split([',', '\n'])
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}

/// Checks whether an update changes what the Application asks for, ignoring
/// bookkeeping fields maintained by the API server and controllers.
pub(crate) fn is_intent_change(old: &DynamicObject, new: &DynamicObject) -> bool {
    fn stripped(meta: &ObjectMeta) -> ObjectMeta {
        ObjectMeta {
            finalizers: None,
            generation: None,
            resource_version: None,
            managed_fields: None,
            ..meta.clone()
        }
    }

    old.data.get("spec") != new.data.get("spec") || stripped(&old.metadata) != stripped(&new.metadata)
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn not_found() -> Response<Body> {
    let mut rsp = Response::new(Body::default());
    *rsp.status_mut() = http::StatusCode::NOT_FOUND;
    rsp
}

fn json_response(rsp: AdmissionReview) -> Response<Body> {
    match serde_json::to_vec(&rsp) {
        Ok(bytes) => {
            let mut rsp = Response::new(Body::from(bytes));
            rsp.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            );
            rsp
        }
        Err(error) => {
            warn!(%error, "Failed to encode admission response");
            let mut rsp = Response::new(Body::default());
            *rsp.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
            rsp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn object(spec: serde_json::Value, meta: serde_json::Value) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "argoproj.io/v1alpha1",
            "kind": "Application",
            "metadata": meta,
            "spec": spec,
        }))
        .expect("object must parse")
    }

    #[test]
    fn bookkeeping_updates_are_not_intent_changes() {
        let spec = serde_json::json!({"destination": {"server": "c1", "namespace": "ns"}});
        let old = object(
            spec.clone(),
            serde_json::json!({"name": "app", "namespace": "team-a", "resourceVersion": "1", "generation": 1}),
        );
        let new = object(
            spec,
            serde_json::json!({
                "name": "app",
                "namespace": "team-a",
                "resourceVersion": "2",
                "generation": 2,
                "finalizers": ["argocd.dana.io/namespace-tracking"],
            }),
        );
        assert!(!is_intent_change(&old, &new));
    }

    #[test]
    fn spec_and_label_updates_are_intent_changes() {
        let meta = serde_json::json!({"name": "app", "namespace": "team-a"});
        let old = object(
            serde_json::json!({"destination": {"server": "c1", "namespace": "ns"}}),
            meta.clone(),
        );
        let new = object(
            serde_json::json!({"destination": {"server": "c2", "namespace": "ns"}}),
            meta,
        );
        assert!(is_intent_change(&old, &new));

        let relabeled = object(
            serde_json::json!({"destination": {"server": "c1", "namespace": "ns"}}),
            serde_json::json!({"name": "app", "namespace": "team-a", "labels": {"a": "b"}}),
        );
        assert!(is_intent_change(&old, &relabeled));
    }

    #[rstest]
    #[case("team-a", "team-a-mgmt", true)]
    #[case("team-a", "team-a", false)]
    #[case("team-a", "team-b-mgmt", false)]
    #[case("team-a", "x-team-a-mgmt", false)]
    #[case("", "-mgmt", false)]
    fn management_applications(#[case] instance: &str, #[case] app: &str, #[case] expected: bool) {
        assert_eq!(is_management(instance, app), expected);
    }

    #[rstest]
    #[case("admin1,admin2", &["admin1", "admin2"])]
    #[case(" admin1 ,\n admin2\n", &["admin1", "admin2"])]
    #[case("admin1\nadmin2,,", &["admin1", "admin2"])]
    #[case("", &[])]
    fn admin_lists(#[case] users: &str, #[case] expected: &[&str]) {
        assert_eq!(parse_admins(users), expected);
    }
}
