use crate::{
    admission::Admission,
    config::{AnnotationsConfig, Config, NamespaceSelectors, NodeSelectorConfig},
    core::{Labels, Map},
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[clap(name = "admission-webhook", about = "A mutating admission webhook")]
pub struct Args {
    #[clap(
        long,
        default_value = "admission_webhook=info,warn",
        env = "ADMISSION_WEBHOOK_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain", env = "ADMISSION_WEBHOOK_LOG_FORMAT")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Path under which all handlers are served.
    #[clap(long, default_value = "/mutate", env = "BASE_PATH")]
    base_path: String,

    /// Sub-path of the pod node selector handler. Empty disables the handler.
    #[clap(
        long,
        default_value = "pod-nodes-selector",
        env = "POD_NODES_SELECTOR_PATH"
    )]
    pod_nodes_selector_path: String,

    /// Node selectors per namespace, e.g. `ns1:k=v,k=v;ns2:k=v`.
    #[clap(long, env = "POD_NODES_SELECTOR_CONFIG")]
    pod_nodes_selector_config: Option<NamespaceSelectors>,

    /// Namespaces whose pods are never mutated.
    #[clap(long, env = "IGNORED_NAMESPACES", value_delimiter = ',')]
    ignored_namespaces: Vec<String>,

    /// Node selector applied when a namespace has no selector of its own.
    #[clap(long, env = "DEFAULT_LABELS")]
    default_labels: Option<Labels>,

    /// Pods carrying any of these labels are never mutated.
    #[clap(long, env = "IGNORED_POD_LABELS")]
    ignored_pod_labels: Option<Labels>,

    /// Namespace annotations holding node selectors, in merge order.
    #[clap(long, env = "NAMESPACE_ANNOTATION_KEYS", value_delimiter = ',')]
    namespace_annotation_keys: Vec<String>,

    /// Kinds of controllers whose pods are never mutated.
    #[clap(
        long,
        env = "EXEMPT_OWNER_KINDS",
        value_delimiter = ',',
        default_value = "DaemonSet"
    )]
    exempt_owner_kinds: Vec<String>,

    /// Sub-path of the namespace annotations handler. Unset disables the handler.
    #[clap(long, env = "NAMESPACE_ANNOTATIONS_PATH")]
    namespace_annotations_path: Option<String>,

    /// JSON object of annotations to add to namespaces.
    #[clap(long, env = "NAMESPACE_ANNOTATIONS_TO_ADD", default_value = "{}")]
    namespace_annotations_to_add: String,

    /// Sub-path of the pod annotations handler. Unset disables the handler.
    #[clap(long, env = "POD_ANNOTATIONS_PATH")]
    pod_annotations_path: Option<String>,

    /// JSON object of annotations to add to pods.
    #[clap(long, env = "POD_ANNOTATIONS_TO_ADD", default_value = "{}")]
    pod_annotations_to_add: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config()?;
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            ..
        } = self;

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder())
            .with_client(client)
            .with_server(server)
            .build()
            .await?;

        let admission = Admission::new(&config, Arc::new(runtime.client()))?;
        info!(base_path = %config.base_path, "Starting admission webhook server");
        let runtime = runtime.spawn_server(admission);

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }

    /// Validates the admission policy. Any error here is fatal.
    fn config(&self) -> Result<Config> {
        let config = Config {
            base_path: self.base_path.clone(),
            node_selector_path: enabled_path(Some(&self.pod_nodes_selector_path)),
            node_selector: NodeSelectorConfig {
                ignored_pod_labels: self.ignored_pod_labels.clone().unwrap_or_default(),
                namespace_annotation_keys: non_empty(&self.namespace_annotation_keys).collect(),
                blacklisted_namespaces: non_empty(&self.ignored_namespaces).collect(),
                default_labels: self.default_labels.clone().unwrap_or_default(),
                namespace_selectors: self.pod_nodes_selector_config.clone().unwrap_or_default(),
                exempt_owner_kinds: non_empty(&self.exempt_owner_kinds).collect(),
            },
            namespace_annotations: annotations_config(
                self.namespace_annotations_path.as_deref(),
                &self.namespace_annotations_to_add,
            )
            .context("invalid NAMESPACE_ANNOTATIONS_TO_ADD")?,
            pod_annotations: annotations_config(
                self.pod_annotations_path.as_deref(),
                &self.pod_annotations_to_add,
            )
            .context("invalid POD_ANNOTATIONS_TO_ADD")?,
        };

        // Surface conflicting routes before anything is started.
        config.routes()?;
        Ok(config)
    }
}

fn enabled_path(path: Option<&str>) -> Option<String> {
    path.map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

fn non_empty(values: &[String]) -> impl Iterator<Item = String> + '_ {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Desired annotations are only parsed for enabled handlers.
fn annotations_config(path: Option<&str>, annotations: &str) -> Result<Option<AnnotationsConfig>> {
    let Some(path) = enabled_path(path) else {
        return Ok(None);
    };
    let desired = serde_json::from_str::<Map>(annotations)?;
    Ok(Some(AnnotationsConfig {
        path,
        desired: desired.into(),
    }))
}
