#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use admission_webhook_core as core;

mod admission;
mod annotations;
mod args;
mod config;
mod namespace;
mod node_selector;

#[cfg(test)]
mod test_util;

pub use self::{
    admission::Admission,
    annotations::{Annotations, ResourceKind},
    args::Args,
    config::{AnnotationsConfig, Config, NamespaceSelectors, NodeSelectorConfig, Route},
    namespace::{LookupError, NamespaceAnnotations},
    node_selector::NodeSelector,
};
