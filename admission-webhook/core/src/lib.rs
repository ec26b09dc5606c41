#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod patch;

pub use self::{
    labels::{Conflict, Labels, Map},
    patch::{Op, PatchOperation},
};
