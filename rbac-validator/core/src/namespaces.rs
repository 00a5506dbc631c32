use std::fmt;

/// Credential object data key holding the comma-delimited namespace list.
pub const NAMESPACES_KEY: &str = "namespaces";

/// Credential object data key marking a cluster-scoped credential.
pub const CLUSTER_RESOURCES_KEY: &str = "clusterResources";

/// The set of namespaces a destination credential is declared to need.
///
/// Insertion order is preserved so that rewriting the list only appends or
/// removes entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceSet(Vec<String>);

impl NamespaceSet {
    /// Parses a comma-delimited list, trimming entries and dropping empty and
    /// duplicate ones.
    pub fn parse(list: &str) -> Self {
        let mut set = Self::default();
        for ns in list.split(',') {
            set.insert(ns);
        }
        set
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.0.iter().any(|ns| ns == namespace.trim())
    }

    /// Returns true if the namespace was added.
    pub fn insert(&mut self, namespace: &str) -> bool {
        let namespace = namespace.trim();
        if namespace.is_empty() || self.contains(namespace) {
            return false;
        }
        self.0.push(namespace.to_string());
        true
    }

    /// Returns true if the namespace was present.
    pub fn remove(&mut self, namespace: &str) -> bool {
        let namespace = namespace.trim();
        let len = self.0.len();
        self.0.retain(|ns| ns != namespace);
        self.0.len() != len
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for NamespaceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}
