use crate::core::Map;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, ResourceExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("namespace {0} does not exist")]
    NotFound(String),

    #[error("failed to fetch namespace {name}: {source}")]
    Transport {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

/// Looks up the annotations of a namespace.
#[async_trait::async_trait]
pub trait NamespaceAnnotations: Send + Sync + 'static {
    async fn annotations(&self, name: &str) -> Result<Map, LookupError>;
}

#[async_trait::async_trait]
impl NamespaceAnnotations for kube::Client {
    async fn annotations(&self, name: &str) -> Result<Map, LookupError> {
        let api = Api::<Namespace>::all(self.clone());
        match api.get_opt(name).await {
            Ok(Some(ns)) => Ok(ns.annotations().clone()),
            Ok(None) => Err(LookupError::NotFound(name.to_string())),
            Err(error) => Err(LookupError::Transport {
                name: name.to_string(),
                source: error.into(),
            }),
        }
    }
}
