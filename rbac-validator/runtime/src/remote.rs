use crate::{
    core::{AccessCheck, AuthorizationChecker, BoxError, ConnectCluster},
    k8s::{
        Api, Client, PostParams, ResourceAttributes, SubjectAccessReview,
        SubjectAccessReviewSpec,
    },
};

/// Connects to destination clusters with the bearer tokens stored for them.
#[derive(Clone, Debug, Default)]
pub struct KubeConnector;

/// Asks a destination cluster's API server via `SubjectAccessReview`s.
#[derive(Clone)]
pub struct SubjectAccessChecker {
    client: Client,
}

// === impl KubeConnector ===

impl ConnectCluster for KubeConnector {
    type Checker = SubjectAccessChecker;

    fn connect(&self, server_url: &str, token: &str) -> Result<SubjectAccessChecker, BoxError> {
        let mut config = kube::Config::new(server_url.parse::<http::Uri>()?);
        // Destination clusters are addressed by URL only and no CA bundle is
        // distributed with their tokens, so the API server's certificate is
        // not verified. The client lives for a single admission decision.
        config.accept_invalid_certs = true;
        config.auth_info.token = Some(token.to_string().into());
        let client = Client::try_from(config)?;
        Ok(SubjectAccessChecker { client })
    }
}

// === impl SubjectAccessChecker ===

#[async_trait::async_trait]
impl AuthorizationChecker for SubjectAccessChecker {
    async fn allowed(&self, check: AccessCheck<'_>) -> Result<bool, BoxError> {
        let review = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: Some(check.user.to_string()),
                resource_attributes: Some(ResourceAttributes {
                    namespace: Some(check.namespace.to_string()),
                    verb: Some(check.verb.to_string()),
                    resource: Some(check.resource.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let review = Api::<SubjectAccessReview>::all(self.client.clone())
            .create(&PostParams::default(), &review)
            .await?;
        let allowed = review.status.map(|s| s.allowed).unwrap_or(false);
        tracing::trace!(
            user = %check.user,
            namespace = %check.namespace,
            verb = %check.verb,
            allowed,
            "SubjectAccessReview"
        );
        Ok(allowed)
    }
}
