//! Injects a node selector into pods based on the policy of their namespace.

use crate::{
    admission::{is_resource, parse_object, AdmissionRequest},
    config::NodeSelectorConfig,
    core::{
        patch::{self, PatchOperation},
        Labels,
    },
    namespace::NamespaceAnnotations,
};
use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct NodeSelector {
    config: Arc<NodeSelectorConfig>,
    namespaces: Arc<dyn NamespaceAnnotations>,
}

// === impl NodeSelector ===

impl NodeSelector {
    pub fn new(config: NodeSelectorConfig, namespaces: Arc<dyn NamespaceAnnotations>) -> Self {
        Self {
            config: Arc::new(config),
            namespaces,
        }
    }

    pub async fn admit(&self, req: &AdmissionRequest) -> Result<Vec<PatchOperation>> {
        if !is_resource(req, "pods") {
            debug!(uid = %req.uid, "Ignoring admission request as it's not a pod resource");
            return Ok(vec![]);
        }

        let pod = parse_object::<Pod>(req).context("could not deserialize pod object")?;
        let ns = req
            .namespace
            .as_deref()
            .or(pod.metadata.namespace.as_deref())
            .unwrap_or_default();
        let name = pod_name(&pod);

        if let Some(kind) = self.exempt_owner(&pod) {
            info!(%ns, %name, %kind, "Pod is owned by an exempt controller, skipping");
            return Ok(vec![]);
        }

        if self.config.blacklisted_namespaces.contains(ns) {
            info!(%ns, %name, "Namespace is configured to be ignored, skipping");
            return Ok(vec![]);
        }

        let pod_labels = Labels::from(pod.metadata.labels.clone().unwrap_or_default());
        if pod_labels.intersects(&self.config.ignored_pod_labels) {
            info!(%ns, %name, "Pod carries an ignored label, skipping");
            return Ok(vec![]);
        }

        let desired = self.desired_labels(ns).await?;

        let existing = pod.spec.and_then(|spec| spec.node_selector);
        let existed = existing.is_some();
        let existing = Labels::from(existing.unwrap_or_default());
        let merged = desired.merge(&existing).map_err(|conflict| {
            anyhow!(
                "pod node label selector conflicts with its namespace node label selector \
                 for pod {name}: {conflict}"
            )
        })?;

        info!(%ns, %name, selector = %merged, "Processed pod");
        Ok(patch::build(patch::node_selector_path(), merged, existed)
            .into_iter()
            .collect())
    }

    /// Resolves the node selector required by a namespace.
    ///
    /// A configured namespace selector takes precedence over namespace
    /// annotations, which take precedence over the default labels.
    async fn desired_labels(&self, ns: &str) -> Result<Labels> {
        if let Some(labels) = self.config.namespace_selectors.get(ns) {
            debug!(%ns, %labels, "Using configured namespace selector");
            return Ok(labels.clone());
        }

        if let Some(labels) = self.annotated_labels(ns).await? {
            debug!(%ns, %labels, "Using namespace annotations");
            return Ok(labels);
        }

        debug!(%ns, labels = %self.config.default_labels, "Using default labels");
        Ok(self.config.default_labels.clone())
    }

    /// Merges the selectors found in the configured namespace annotations, in
    /// configuration order. Returns `None` if none of them is set.
    async fn annotated_labels(&self, ns: &str) -> Result<Option<Labels>> {
        if self.config.namespace_annotation_keys.is_empty() {
            return Ok(None);
        }

        let annotations = self
            .namespaces
            .annotations(ns)
            .await
            .with_context(|| format!("failed to resolve node selector for namespace {ns}"))?;

        let mut resolved: Option<Labels> = None;
        for key in &self.config.namespace_annotation_keys {
            let Some(value) = annotations.get(key) else {
                continue;
            };
            let labels = value.parse::<Labels>().with_context(|| {
                format!("invalid node selector in annotation {key} of namespace {ns}")
            })?;
            let merged = resolved.unwrap_or_default().merge(&labels).map_err(|conflict| {
                anyhow!("node selector annotations of namespace {ns} conflict: {conflict}")
            })?;
            resolved = Some(merged);
        }
        Ok(resolved)
    }

    fn exempt_owner<'p>(&self, pod: &'p Pod) -> Option<&'p str> {
        pod.metadata
            .owner_references
            .iter()
            .flatten()
            .find(|owner| {
                owner.controller == Some(true)
                    && self.config.exempt_owner_kinds.contains(&owner.kind)
            })
            .map(|owner| owner.kind.as_str())
    }
}

fn pod_name(pod: &Pod) -> String {
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let generate_name = pod.metadata.generate_name.as_deref().unwrap_or_default();
    format!("{name} {generate_name}").trim().to_string()
}
