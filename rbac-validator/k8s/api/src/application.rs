use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// A GitOps deployment request, owned by the Argo CD application controller.
///
/// Only the fields needed to authorize and track the destination are
/// modeled; everything else in the resource is ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "Application",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project: String,

    #[serde(default)]
    pub destination: ApplicationDestination,
}

/// The cluster and namespace an Application deploys to.
///
/// A destination names its cluster either by `server` URL or by `name`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ApplicationDestination {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ignores_unmodeled_fields() {
        let app: Application = serde_json::from_value(serde_json::json!({
            "apiVersion": "argoproj.io/v1alpha1",
            "kind": "Application",
            "metadata": {
                "name": "guestbook",
                "namespace": "team-a",
                "finalizers": ["resources-finalizer.argocd.argoproj.io"],
            },
            "spec": {
                "project": "default",
                "source": {
                    "repoURL": "https://example.com/guestbook.git",
                    "path": "guestbook",
                },
                "destination": {
                    "server": "https://api.c1.example.com:6443",
                    "namespace": "guestbook",
                },
            },
            "status": { "sync": { "status": "Synced" } },
        }))
        .expect("application must parse");

        assert_eq!(
            app.spec.destination,
            ApplicationDestination {
                server: "https://api.c1.example.com:6443".to_string(),
                name: String::new(),
                namespace: "guestbook".to_string(),
            }
        );
    }

    #[test]
    fn missing_destination_is_empty() {
        let app: Application = serde_json::from_value(serde_json::json!({
            "apiVersion": "argoproj.io/v1alpha1",
            "kind": "Application",
            "metadata": { "name": "empty", "namespace": "team-a" },
            "spec": {},
        }))
        .expect("application must parse");
        assert_eq!(app.spec.destination, ApplicationDestination::default());
    }
}
