use crate::{
    admission::{AdmissionRequest, Review},
    core::Map,
    namespace::{LookupError, NamespaceAnnotations},
};
use serde_json::json;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
};

pub const PODS: &str = "pods";
pub const NAMESPACES: &str = "namespaces";

pub fn mk_review(resource: &str, ns: &str, object: serde_json::Value) -> serde_json::Value {
    let kind = match resource {
        NAMESPACES => "Namespace",
        PODS => "Pod",
        _ => "Deployment",
    };
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": { "group": "", "version": "v1", "kind": kind },
            "resource": { "group": "", "version": "v1", "resource": resource },
            "name": "",
            "namespace": ns,
            "operation": "CREATE",
            "userInfo": {},
            "object": object,
            "dryRun": false,
        },
    })
}

pub fn mk_request(resource: &str, ns: &str, object: serde_json::Value) -> AdmissionRequest {
    let review: Review =
        serde_json::from_value(mk_review(resource, ns, object)).expect("review must decode");
    review.try_into().expect("review must carry a request")
}

/// A pod with the given labels and, optionally, an existing node selector.
pub fn pod(
    labels: serde_json::Value,
    node_selector: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut spec = json!({ "containers": [{ "name": "app", "image": "nginx" }] });
    if let Some(selector) = node_selector {
        spec["nodeSelector"] = selector;
    }
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": "web", "labels": labels },
        "spec": spec,
    })
}

/// An in-memory namespace lookup that counts how often it is consulted.
#[derive(Default)]
pub struct Namespaces {
    annotations: BTreeMap<String, Map>,
    unavailable: bool,
    lookups: AtomicUsize,
}

impl Namespaces {
    pub fn with(ns: &str, annotations: &[(&str, &str)]) -> Self {
        let mut namespaces = Self::default();
        namespaces.annotations.insert(
            ns.to_string(),
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        namespaces
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Default::default()
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl NamespaceAnnotations for Namespaces {
    async fn annotations(&self, name: &str) -> Result<Map, LookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(LookupError::Transport {
                name: name.to_string(),
                source: "connection refused".into(),
            });
        }
        self.annotations
            .get(name)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(name.to_string()))
    }
}
