use crate::BoxError;
use thiserror::Error;

/// Every verb an administrator must hold on [`ACCESS_RESOURCE`].
pub const REQUIRED_VERBS: [&str; 7] = [
    "get", "list", "watch", "create", "update", "patch", "delete",
];

/// The resource whose permissions stand in for full namespace administration.
pub const ACCESS_RESOURCE: &str = "pods";

/// A single authorization question asked of a destination cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccessCheck<'a> {
    pub user: &'a str,
    pub namespace: &'a str,
    pub verb: &'a str,
    pub resource: &'a str,
}

/// Answers authorization questions against a destination cluster.
#[async_trait::async_trait]
pub trait AuthorizationChecker {
    async fn allowed(&self, check: AccessCheck<'_>) -> Result<bool, BoxError>;
}

/// Builds an [`AuthorizationChecker`] for a destination cluster.
pub trait ConnectCluster {
    type Checker: AuthorizationChecker + Send + Sync;

    fn connect(&self, server_url: &str, token: &str) -> Result<Self::Checker, BoxError>;
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("none of the instance users have admin access to namespace {namespace}")]
    Denied { namespace: String },

    #[error("failed to check {verb} access for user {user}: {source}")]
    Check {
        user: String,
        verb: String,
        #[source]
        source: BoxError,
    },
}

/// Finds the first of `admins` allowed every [`REQUIRED_VERBS`] verb on
/// [`ACCESS_RESOURCE`] in `namespace`.
///
/// Checking an admin stops at its first denied verb. Transport failures abort
/// the search and are never treated as a denial.
pub async fn has_admin_access<C>(
    checker: &C,
    admins: &[String],
    namespace: &str,
) -> Result<String, AccessError>
where
    C: AuthorizationChecker + ?Sized,
{
    'admins: for user in admins {
        for verb in REQUIRED_VERBS {
            let check = AccessCheck {
                user,
                namespace,
                verb,
                resource: ACCESS_RESOURCE,
            };
            match checker.allowed(check).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(%user, %namespace, %verb, "Access denied");
                    continue 'admins;
                }
                Err(source) => {
                    return Err(AccessError::Check {
                        user: user.clone(),
                        verb: verb.to_string(),
                        source,
                    })
                }
            }
        }
        tracing::debug!(%user, %namespace, "User has admin access");
        return Ok(user.clone());
    }

    Err(AccessError::Denied {
        namespace: namespace.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Grants {
        full: HashSet<&'static str>,
        partial: Option<(&'static str, &'static str)>,
        failing: Option<&'static str>,
        asked: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl AuthorizationChecker for Grants {
        async fn allowed(&self, check: AccessCheck<'_>) -> Result<bool, BoxError> {
            assert_eq!(check.resource, "pods");
            self.asked
                .lock()
                .await
                .push((check.user.to_string(), check.verb.to_string()));
            if self.failing == Some(check.user) {
                return Err("connection refused".into());
            }
            if let Some((user, verb)) = self.partial {
                if user == check.user {
                    return Ok(verb != check.verb);
                }
            }
            Ok(self.full.contains(check.user))
        }
    }

    fn admins(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn second_admin_is_granted() {
        let grants = Grants {
            full: ["admin2"].into_iter().collect(),
            ..Default::default()
        };
        let user = has_admin_access(&grants, &admins(&["admin1", "admin2"]), "ns")
            .await
            .expect("admin2 must be granted");
        assert_eq!(user, "admin2");

        let asked = grants.asked.lock().await;
        // admin1 is abandoned at its first denied verb.
        assert_eq!(asked[0], ("admin1".to_string(), "get".to_string()));
        assert_eq!(asked[1], ("admin2".to_string(), "get".to_string()));
        assert_eq!(asked.len(), 1 + REQUIRED_VERBS.len());
    }

    #[tokio::test]
    async fn first_granted_admin_short_circuits() {
        let grants = Grants {
            full: ["admin1", "admin2"].into_iter().collect(),
            ..Default::default()
        };
        let user = has_admin_access(&grants, &admins(&["admin1", "admin2"]), "ns")
            .await
            .unwrap();
        assert_eq!(user, "admin1");
        assert_eq!(grants.asked.lock().await.len(), REQUIRED_VERBS.len());
    }

    #[tokio::test]
    async fn missing_one_verb_is_denied() {
        let grants = Grants {
            partial: Some(("admin1", "delete")),
            ..Default::default()
        };
        let err = has_admin_access(&grants, &admins(&["admin1"]), "ns")
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::Denied { namespace } if namespace == "ns"));
    }

    #[tokio::test]
    async fn no_admins_is_denied() {
        let grants = Grants::default();
        let err = has_admin_access(&grants, &[], "ns").await.unwrap_err();
        assert!(matches!(err, AccessError::Denied { .. }));
        assert!(grants.asked.lock().await.is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_not_a_denial() {
        let grants = Grants {
            full: ["admin2"].into_iter().collect(),
            failing: Some("admin1"),
            ..Default::default()
        };
        let err = has_admin_access(&grants, &admins(&["admin1", "admin2"]), "ns")
            .await
            .unwrap_err();
        match err {
            AccessError::Check { user, verb, .. } => {
                assert_eq!(user, "admin1");
                assert_eq!(verb, "get");
            }
            err => panic!("unexpected error: {err}"),
        }
    }
}
