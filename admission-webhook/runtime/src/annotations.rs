//! Merges a fixed set of desired annotations into namespaces or pods.

use crate::{
    admission::{is_resource, parse_object, AdmissionRequest},
    core::{
        patch::{self, PatchOperation},
        Labels,
    },
};
use anyhow::{anyhow, Context, Result};
use k8s_openapi::{
    api::core::v1::{Namespace, Pod},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use std::sync::Arc;
use tracing::{debug, info};

/// The resource kinds whose annotations may be managed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Namespace,
    Pod,
}

#[derive(Clone, Debug)]
pub struct Annotations {
    kind: ResourceKind,
    desired: Arc<Labels>,
}

// === impl ResourceKind ===

impl ResourceKind {
    fn resource(self) -> &'static str {
        match self {
            Self::Namespace => "namespaces",
            Self::Pod => "pods",
        }
    }

    fn handler_name(self) -> &'static str {
        match self {
            Self::Namespace => "NamespaceAnnotations",
            Self::Pod => "PodAnnotations",
        }
    }

    fn metadata(self, req: &AdmissionRequest) -> Result<ObjectMeta> {
        let metadata = match self {
            Self::Namespace => parse_object::<Namespace>(req)
                .context("could not deserialize namespace object")?
                .metadata,
            Self::Pod => parse_object::<Pod>(req)
                .context("could not deserialize pod object")?
                .metadata,
        };
        Ok(metadata)
    }
}

// === impl Annotations ===

impl Annotations {
    pub fn new(kind: ResourceKind, desired: Labels) -> Self {
        Self {
            kind,
            desired: Arc::new(desired),
        }
    }

    pub fn admit(&self, req: &AdmissionRequest) -> Result<Vec<PatchOperation>> {
        let handler = self.kind.handler_name();
        if !is_resource(req, self.kind.resource()) {
            debug!(
                %handler,
                uid = %req.uid,
                "Ignoring admission request as it's not an expected resource"
            );
            return Ok(vec![]);
        }

        let metadata = self
            .kind
            .metadata(req)
            .with_context(|| format!("{handler}: could not deserialize resource"))?;
        let name = metadata.name.unwrap_or_default();

        let existed = metadata.annotations.is_some();
        let existing = Labels::from(metadata.annotations.unwrap_or_default());
        let merged = existing.merge(&self.desired).map_err(|conflict| {
            anyhow!(
                "{handler}: existing annotations conflict with desired annotations - \
                 existing: {existing}, desired: {}: {conflict}",
                self.desired,
            )
        })?;

        info!(%handler, %name, annotations = %merged, "Processed resource");
        Ok(patch::build(patch::annotations_path(), merged, existed)
            .into_iter()
            .collect())
    }
}
