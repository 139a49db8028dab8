//! # umoci
//!
//! Modify OCI container images without a container runtime: unpack a
//! tagged image into a rootfs you can edit with ordinary tools, repack
//! the changes as a new layer, edit configuration metadata, and garbage
//! collect what nothing references.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

pub mod bundle;
pub mod cas;
pub mod casext;
pub mod cli;
pub mod digest;
mod error;
pub mod fstree;
pub mod image;
mod ioutil;
pub mod layer;
pub mod mutate;
pub mod repack;
pub mod runtime;
pub mod timeutil;
pub mod unpack;

pub use error::Error;
