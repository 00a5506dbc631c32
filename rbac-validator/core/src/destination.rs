//! Resolves Application destinations to destination cluster servers and the
//! credential objects that describe them.

use thiserror::Error;

/// Port used when a server URL is built from a bare cluster name.
pub const DEFAULT_SERVER_PORT: u16 = 6443;

/// Suffix of the per-cluster credential object name.
pub const CREDENTIAL_OBJECT_SUFFIX: &str = "cluster-secret";

/// The canonical alias for "the cluster this Application lives on".
pub const LOCAL_CLUSTER: &str = "in-cluster";

/// Every server value that denotes the local cluster. The first entry is the
/// canonical alias.
pub const IN_CLUSTER_ALIASES: [&str; 3] = [
    LOCAL_CLUSTER,
    "kubernetes.default.svc",
    "kubernetes.svc.cluster.local",
];

const SERVER_HOST_PREFIX: &str = "api.";

/// Process-wide destination settings, fixed at startup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterConfig {
    domain: Option<String>,
}

/// An Application's `spec.destination`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Destination {
    pub server: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDestination {
    /// E.g. `https://api.my-cluster.example.com:6443`.
    pub server_url: String,

    /// Name of the destination credential object, e.g.
    /// `my-cluster.example.com-cluster-secret`.
    pub credential_id: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("cannot expand cluster name {0:?}: no cluster domain is configured")]
    Configuration(String),

    #[error("{0:?} denotes the local cluster and has no credential object")]
    InCluster(String),

    #[error("invalid destination server {0:?}")]
    InvalidServer(String),
}

// === impl ClusterConfig ===

impl ClusterConfig {
    pub fn new(domain: Option<String>) -> Self {
        let domain = domain
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        Self { domain }
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }
}

// === impl Destination ===

impl Destination {
    pub fn new(server: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            name: String::new(),
            namespace: namespace.into(),
        }
    }

    /// The server value used for resolution: `server`, or the destination
    /// `name` when no server is set.
    pub fn target(&self) -> &str {
        if self.server.is_empty() {
            &self.name
        } else {
            &self.server
        }
    }

    /// True when the destination is the literal local delivery alias.
    pub fn is_local_delivery(&self) -> bool {
        self.server == LOCAL_CLUSTER
    }

    /// The short cluster name that bypass labels are keyed by.
    pub fn cluster_name(&self) -> String {
        cluster_name(self.target())
    }

    pub fn resolve(&self, config: &ClusterConfig) -> Result<ResolvedDestination, ResolveError> {
        let target = self.target();
        if target.is_empty() {
            return Err(ResolveError::InvalidServer(target.to_string()));
        }
        if is_in_cluster(target) {
            return Err(ResolveError::InCluster(target.to_string()));
        }

        let server_url = if is_server_url(target) {
            target.to_string()
        } else {
            let domain = config
                .domain()
                .ok_or_else(|| ResolveError::Configuration(target.to_string()))?;
            build_server_url(target, domain)
        };

        let credential_id = credential_object_id(&server_url)
            .ok_or_else(|| ResolveError::InvalidServer(server_url.clone()))?;

        Ok(ResolvedDestination {
            server_url,
            credential_id,
        })
    }
}

/// Checks whether `server` is a full server URL of the form
/// `https://api.<cluster>.<domain>:<port>`.
pub fn is_server_url(server: &str) -> bool {
    let uri = match server.parse::<http::Uri>() {
        Ok(uri) => uri,
        Err(_) => return false,
    };
    if uri.scheme_str() != Some("https") {
        return false;
    }
    match uri.authority() {
        Some(authority) => {
            authority.host().starts_with(SERVER_HOST_PREFIX) && authority.port_u16().is_some()
        }
        None => false,
    }
}

/// Extracts the cluster name (`my-cluster` in
/// `https://api.my-cluster.example.com:6443`). Values that are not server URLs
/// are returned unchanged.
pub fn cluster_name(server: &str) -> String {
    if !is_server_url(server) {
        return server.to_string();
    }
    server
        .parse::<http::Uri>()
        .ok()
        .and_then(|uri| {
            uri.host()
                .and_then(|host| host.split('.').nth(1))
                .map(str::to_string)
        })
        .unwrap_or_default()
}

pub fn build_server_url(cluster: &str, domain: &str) -> String {
    format!("https://{SERVER_HOST_PREFIX}{cluster}.{domain}:{DEFAULT_SERVER_PORT}")
}

/// Returns `<hostname>-cluster-secret`, where the hostname is the server's
/// host without its `api.` prefix.
pub fn credential_object_id(server_url: &str) -> Option<String> {
    let uri = server_url.parse::<http::Uri>().ok()?;
    let host = uri.host().filter(|h| !h.is_empty())?;
    let host = host.strip_prefix(SERVER_HOST_PREFIX).unwrap_or(host);
    Some(format!("{host}-{CREDENTIAL_OBJECT_SUFFIX}"))
}

/// Converts a server URL into a name usable as a ConfigMap key: the protocol
/// and `api.` prefix are removed and `.`, `:` and `/` become `-`.
pub fn file_safe_server_name(server_url: &str) -> String {
    let name = ["https://", "http://"]
        .iter()
        .fold(server_url, |s, prefix| s.strip_prefix(prefix).unwrap_or(s));
    let name = name.strip_prefix(SERVER_HOST_PREFIX).unwrap_or(name);
    name.chars()
        .map(|c| match c {
            '.' | ':' | '/' => '-',
            c => c,
        })
        .collect()
}

/// The cluster token ConfigMap key for a server URL.
pub fn token_key(server_url: &str) -> String {
    format!("{}-token", file_safe_server_name(server_url))
}

/// Checks whether `server` is one of the in-cluster aliases, either bare or
/// as an `https://` URL.
pub fn is_in_cluster(server: &str) -> bool {
    let host = match server.strip_prefix("https://") {
        Some(rest) => rest.split([':', '/']).next().unwrap_or_default(),
        None => server,
    };
    IN_CLUSTER_ALIASES.contains(&host)
}
