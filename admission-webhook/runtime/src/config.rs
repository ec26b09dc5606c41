use crate::core::Labels;
use anyhow::{bail, Result};
use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
};

const NAMESPACE_SEPARATOR: char = ';';
const NAMESPACE_LABEL_SEPARATOR: char = ':';

/// Immutable admission policy, built once at startup.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub base_path: String,

    /// Sub-path of the node selector handler, if enabled.
    pub node_selector_path: Option<String>,
    pub node_selector: NodeSelectorConfig,

    pub namespace_annotations: Option<AnnotationsConfig>,
    pub pod_annotations: Option<AnnotationsConfig>,
}

#[derive(Clone, Debug, Default)]
pub struct NodeSelectorConfig {
    /// Pods carrying any of these labels are left untouched.
    pub ignored_pod_labels: Labels,

    /// Namespace annotations holding selector expressions, in merge order.
    pub namespace_annotation_keys: Vec<String>,

    pub blacklisted_namespaces: BTreeSet<String>,
    pub default_labels: Labels,
    pub namespace_selectors: NamespaceSelectors,

    /// Pods controlled by an owner of one of these kinds are left untouched.
    pub exempt_owner_kinds: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnnotationsConfig {
    pub path: String,
    pub desired: Labels,
}

/// Per-namespace node selectors, e.g. `ns1:k=v,k=v;ns2:k=v`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceSelectors(BTreeMap<String, Labels>);

// === impl Config ===

impl Config {
    /// Returns the full path of each enabled handler.
    ///
    /// Fails if two handlers would be served from the same path.
    pub fn routes(&self) -> Result<Vec<(String, Route)>> {
        let mut routes = Vec::new();
        if let Some(path) = &self.node_selector_path {
            routes.push((join_path(&self.base_path, path), Route::NodeSelector));
        }
        if let Some(annotations) = &self.namespace_annotations {
            routes.push((
                join_path(&self.base_path, &annotations.path),
                Route::NamespaceAnnotations,
            ));
        }
        if let Some(annotations) = &self.pod_annotations {
            routes.push((
                join_path(&self.base_path, &annotations.path),
                Route::PodAnnotations,
            ));
        }

        let mut seen = BTreeSet::new();
        for (path, _) in &routes {
            if !seen.insert(path.as_str()) {
                bail!("more than one handler is configured for path {path}");
            }
        }
        Ok(routes)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Route {
    NodeSelector,
    NamespaceAnnotations,
    PodAnnotations,
}

/// Joins path segments, collapsing duplicate slashes.
pub(crate) fn join_path(base: &str, sub: &str) -> String {
    let mut path = String::new();
    for segment in base.split('/').chain(sub.split('/')) {
        if !segment.is_empty() {
            path.push('/');
            path.push_str(segment);
        }
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

// === impl NamespaceSelectors ===

impl NamespaceSelectors {
    pub fn get(&self, namespace: &str) -> Option<&Labels> {
        self.0.get(namespace)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Labels)> for NamespaceSelectors {
    fn from_iter<T: IntoIterator<Item = (String, Labels)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromStr for NamespaceSelectors {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut selectors = BTreeMap::new();
        for entry in s.split(NAMESPACE_SEPARATOR) {
            // Entries without a namespace or a selector are skipped.
            let parts = entry.split(NAMESPACE_LABEL_SEPARATOR).collect::<Vec<_>>();
            let (ns, selector) = match parts[..] {
                [ns, selector] if !ns.is_empty() && !selector.is_empty() => (ns, selector),
                _ => continue,
            };
            let labels = selector
                .parse::<Labels>()
                .map_err(|error| anyhow::anyhow!("invalid selector for namespace {ns}: {error}"))?;
            selectors.insert(ns.to_string(), labels);
        }
        Ok(Self(selectors))
    }
}
