//! pixcache - A tiered decoded-image cache.
//!
//! This crate keeps decoded images in a footprint-bounded memory LRU, backs
//! them with compressed encodings in a journaled disk store, and hands evicted
//! buffers back to the decoder for reuse.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing adapters for storage, codecs and configuration.
pub mod infrastructure;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "pixcache";
