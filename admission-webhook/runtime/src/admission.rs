use crate::{
    annotations::{Annotations, ResourceKind},
    config::{Config, Route},
    core::{patch, PatchOperation},
    namespace::NamespaceAnnotations,
    node_selector::NodeSelector,
};
use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{admission::SerializePatchError, DynamicObject};
use serde::{de::DeserializeOwned, Deserialize};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Serves admission reviews, dispatching each to the handler registered for
/// its path.
#[derive(Clone)]
pub struct Admission {
    routes: Arc<BTreeMap<String, Handler>>,
}

#[derive(Clone)]
enum Handler {
    NodeSelector(NodeSelector),
    Annotations(Annotations),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// A request that cannot be reviewed at all.
#[derive(Debug, Error)]
enum ProtocolError {
    #[error("invalid method {0}, only POST requests are allowed")]
    Method(http::Method),

    #[error("unsupported content type {0:?}, only application/json is supported")]
    ContentType(String),

    #[error("could not deserialize request: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("malformed admission review: {0}")]
    Review(#[from] kube::core::admission::ConvertAdmissionReviewError),
}

pub(crate) type Review = kube::core::admission::AdmissionReview<DynamicObject>;
pub(crate) type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;

type Body = http_body_util::Full<bytes::Bytes>;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Namespaces owned by Kubernetes itself are never mutated.
const SYSTEM_NAMESPACES: [&str; 3] = ["kube-system", "kube-public", "default"];

// === impl AdmissionService ===

impl<B> tower::Service<Request<B>> for Admission
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        trace!(method = %req.method(), path = %req.uri().path(), "Request");
        let Some(handler) = self.routes.get(req.uri().path()).cloned() else {
            if req.uri().path() == "/" {
                return Box::pin(future::ok(root_response()));
            }
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        };

        Box::pin(async move {
            if let Err(error) = check_headers(&req) {
                warn!(%error, "Rejecting request");
                return Ok(protocol_error(&error));
            }

            let bytes = req
                .into_body()
                .collect()
                .await
                .map_err(|error| Error::Request(error.into()))?
                .to_bytes();

            let req = match parse_review(&bytes) {
                Ok(req) => req,
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    return Ok(protocol_error(&error));
                }
            };
            debug!(?req);

            let rsp = match handler.review(req).await {
                Ok(rsp) => rsp,
                Err(error) => {
                    warn!(%error, "Failed to encode patch");
                    return Ok(internal_error());
                }
            };
            debug!(?rsp);
            Ok(json_response(rsp.into_review()))
        })
    }
}

impl Admission {
    /// Builds the handlers for every enabled route.
    pub fn new(config: &Config, namespaces: Arc<dyn NamespaceAnnotations>) -> Result<Self> {
        let mut routes = BTreeMap::new();
        for (path, route) in config.routes()? {
            let handler = match route {
                Route::NodeSelector => Handler::NodeSelector(NodeSelector::new(
                    config.node_selector.clone(),
                    namespaces.clone(),
                )),
                Route::NamespaceAnnotations => {
                    let desired = config
                        .namespace_annotations
                        .as_ref()
                        .map(|c| c.desired.clone())
                        .unwrap_or_default();
                    Handler::Annotations(Annotations::new(ResourceKind::Namespace, desired))
                }
                Route::PodAnnotations => {
                    let desired = config
                        .pod_annotations
                        .as_ref()
                        .map(|c| c.desired.clone())
                        .unwrap_or_default();
                    Handler::Annotations(Annotations::new(ResourceKind::Pod, desired))
                }
            };
            info!(%path, ?route, "Registered handler");
            routes.insert(path, handler);
        }

        Ok(Self {
            routes: Arc::new(routes),
        })
    }
}

// === impl Handler ===

impl Handler {
    async fn decide(&self, req: &AdmissionRequest) -> Result<Vec<PatchOperation>> {
        match self {
            Self::NodeSelector(handler) => handler.admit(req).await,
            Self::Annotations(handler) => handler.admit(req),
        }
    }

    async fn review(
        &self,
        req: AdmissionRequest,
    ) -> Result<AdmissionResponse, SerializePatchError> {
        let rsp = AdmissionResponse::from(&req);

        let ns = req.namespace.as_deref().unwrap_or_default();
        if SYSTEM_NAMESPACES.contains(&ns) {
            debug!(%ns, uid = %req.uid, "Skipping system namespace");
            return rsp.with_patch(json_patch::Patch(vec![]));
        }

        match self.decide(&req).await {
            Ok(ops) => rsp.with_patch(patch::into_patch(ops)),
            Err(error) => {
                info!(error = %format_args!("{error:#}"), %ns, uid = %req.uid, "Denied");
                Ok(rsp.deny(format!("{error:#}")))
            }
        }
    }
}

fn check_headers<B>(req: &Request<B>) -> Result<(), ProtocolError> {
    if req.method() != http::Method::POST {
        return Err(ProtocolError::Method(req.method().clone()));
    }

    let content_type = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    if !media_type.eq_ignore_ascii_case(JSON_CONTENT_TYPE) {
        return Err(ProtocolError::ContentType(content_type));
    }

    Ok(())
}

fn parse_review(bytes: &[u8]) -> Result<AdmissionRequest, ProtocolError> {
    let mut review: serde_json::Value = serde_json::from_slice(bytes)?;

    // Objects that cannot be decoded are dropped so that the handler, rather
    // than the transport, rejects them.
    for field in ["/request/object", "/request/oldObject"] {
        let Some(obj) = review.pointer_mut(field) else {
            continue;
        };
        if obj.is_null() {
            continue;
        }
        if let Err(error) = DynamicObject::deserialize(&*obj) {
            warn!(%field, %error, "Dropping undecodable object");
            *obj = serde_json::Value::Null;
        }
    }

    let review: Review = serde_json::from_value(review)?;
    let req: AdmissionRequest = review.try_into()?;
    Ok(req)
}

impl ProtocolError {
    fn status(&self) -> http::StatusCode {
        match self {
            Self::Method(_) => http::StatusCode::METHOD_NOT_ALLOWED,
            Self::ContentType(_) | Self::Decode(_) | Self::Review(_) => {
                http::StatusCode::BAD_REQUEST
            }
        }
    }
}

fn protocol_error(error: &ProtocolError) -> Response<Body> {
    Response::builder()
        .status(error.status())
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Body::from(error.to_string()))
        .expect("error response must be valid")
}

/// Answers requests for `/` that no handler claims.
fn root_response() -> Response<Body> {
    Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Body::from("admission webhook server is running"))
        .expect("root response must be valid")
}

fn internal_error() -> Response<Body> {
    Response::builder()
        .status(http::StatusCode::INTERNAL_SERVER_ERROR)
        .body(Body::default())
        .expect("internal error response must be valid")
}

fn json_response(rsp: Review) -> Response<Body> {
    match serde_json::to_vec(&rsp) {
        Ok(bytes) => Response::builder()
            .status(http::StatusCode::OK)
            .header(http::header::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(Body::from(bytes))
            .expect("admission review response must be valid"),
        Err(error) => {
            warn!(%error, "Failed to encode admission review response");
            internal_error()
        }
    }
}

pub(crate) fn is_resource(req: &AdmissionRequest, resource: &str) -> bool {
    req.resource.group.is_empty()
        && req.resource.version == "v1"
        && req.resource.resource == resource
}

pub(crate) fn parse_object<T: DeserializeOwned>(req: &AdmissionRequest) -> Result<T> {
    let obj = req
        .object
        .as_ref()
        .ok_or_else(|| anyhow!("admission request has no decodable 'object'"))?;
    let value = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(value)?)
}
