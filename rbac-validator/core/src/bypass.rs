use crate::destination::{is_in_cluster, LOCAL_CLUSTER};
use std::collections::BTreeMap;

/// Namespace label prefix that pre-approves Application destinations.
///
/// The bare key bypasses validation for every destination,
/// `<prefix>-<cluster>` for a single destination cluster and
/// `<prefix>-in-cluster` for the local cluster under any of its aliases.
pub const BYPASS_LABEL_PREFIX: &str = "argocd.dana.io/bypass-rbac-validation";

/// Credential object label that opts a destination out of namespace tracking.
pub const BYPASS_OPTIMIZATION_LABEL: &str = "argocd.dana.io/bypass-optimization";

/// Boolean-as-string values are enabled when they read `true` in any case.
pub fn is_enabled(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

/// Decides whether a namespace's labels pre-approve deployments to
/// `destination_cluster`.
pub fn bypass_allowed(labels: &BTreeMap<String, String>, destination_cluster: &str) -> bool {
    labels.iter().any(|(key, value)| {
        let suffix = match key.strip_prefix(BYPASS_LABEL_PREFIX) {
            Some(suffix) if is_enabled(value) => suffix,
            _ => return false,
        };
        match suffix.strip_prefix('-') {
            None => suffix.is_empty(),
            Some(LOCAL_CLUSTER) => is_in_cluster(destination_cluster),
            Some(cluster) => !cluster.is_empty() && cluster == destination_cluster,
        }
    })
}

/// Checks a credential object's labels for the optimization opt-out.
pub fn optimization_bypassed(labels: &BTreeMap<String, String>) -> bool {
    labels
        .get(BYPASS_OPTIMIZATION_LABEL)
        .map(|v| is_enabled(v))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use rstest::rstest;

    fn labels(key: &str, value: &str) -> BTreeMap<String, String> {
        btreemap! {
            "team".to_string() => "a".to_string(),
            key.to_string() => value.to_string(),
        }
    }

    #[rstest]
    #[case("argocd.dana.io/bypass-rbac-validation", "true", "c1", true)]
    #[case("argocd.dana.io/bypass-rbac-validation", "True", "c1", true)]
    #[case("argocd.dana.io/bypass-rbac-validation", "TRUE", "c1", true)]
    #[case("argocd.dana.io/bypass-rbac-validation", "false", "c1", false)]
    #[case("argocd.dana.io/bypass-rbac-validation", "yes", "c1", false)]
    #[case("argocd.dana.io/bypass-rbac-validation-c1", "true", "c1", true)]
    #[case("argocd.dana.io/bypass-rbac-validation-c1", "true", "c2", false)]
    #[case("argocd.dana.io/bypass-rbac-validation-c1", "false", "c1", false)]
    #[case("argocd.dana.io/bypass-rbac-validation-in-cluster", "true", "in-cluster", true)]
    #[case(
        "argocd.dana.io/bypass-rbac-validation-in-cluster",
        "true",
        "kubernetes.default.svc",
        true
    )]
    #[case(
        "argocd.dana.io/bypass-rbac-validation-in-cluster",
        "true",
        "https://kubernetes.default.svc",
        true
    )]
    #[case("argocd.dana.io/bypass-rbac-validation-in-cluster", "true", "c1", false)]
    #[case("argocd.dana.io/bypass-rbac-validation-", "true", "", false)]
    #[case("argocd.dana.io/bypass-rbac-validationc1", "true", "c1", false)]
    #[case("example.com/bypass-rbac-validation", "true", "c1", false)]
    fn bypass_labels(
        #[case] key: &str,
        #[case] value: &str,
        #[case] cluster: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(
            bypass_allowed(&labels(key, value), cluster),
            expected,
            "{key}={value} for {cluster}"
        );
    }

    #[test]
    fn any_enabled_label_matches() {
        let labels = btreemap! {
            format!("{BYPASS_LABEL_PREFIX}-c1") => "false".to_string(),
            format!("{BYPASS_LABEL_PREFIX}-c2") => "true".to_string(),
        };
        assert!(!bypass_allowed(&labels, "c1"));
        assert!(bypass_allowed(&labels, "c2"));
    }

    #[test]
    fn no_labels() {
        assert!(!bypass_allowed(&BTreeMap::new(), "c1"));
        assert!(!optimization_bypassed(&BTreeMap::new()));
    }

    #[rstest]
    #[case("true", true)]
    #[case("True", true)]
    #[case("false", false)]
    #[case("", false)]
    fn optimization_opt_out(#[case] value: &str, #[case] expected: bool) {
        assert_eq!(
            optimization_bypassed(&labels(BYPASS_OPTIMIZATION_LABEL, value)),
            expected
        );
    }
}
