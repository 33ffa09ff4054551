//! # keel-store
//!
//! Local durable state for the Keel network plane.
//!
//! This crate provides the two storage primitives the bridge driver builds
//! on: a file-backed key/value store with compare-and-swap semantics
//! ([`FileStore`]) and a concurrent multimap used for service-record
//! bookkeeping ([`SetMatrix`]).

#![warn(missing_docs)]

pub mod kv;
pub mod matrix;

pub use kv::{FileStore, KvPair};
pub use matrix::SetMatrix;
