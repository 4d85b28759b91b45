//! The hopper message-queue load generation tool.
//!
//! This library supports the hopper binary found elsewhere in this project.
//! The bits and pieces here are not intended to be used outside of supporting
//! hopper, although if they are helpful in other domains that's a nice
//! surprise.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod payload;
pub mod signals;
pub mod workload;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};

/// Construct a fixed-size request body from `chunk`.
pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
