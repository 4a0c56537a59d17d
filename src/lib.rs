//! # Typed, axis-indexed scientific data containers
//!
//! This crate stores scalars, per-axis vectors, and (axis, axis)-indexed matrices
//! under a single reentrant-lockable dataset, and composes datasets through two
//! uniform mechanisms rather than ad-hoc copying: a last-writer-wins overlay
//! ([`chain`]) and a renaming/reprojection wrapper ([`view`]). A small query
//! language ([`query`]) lets callers select, slice, and transform artifacts by
//! name without writing Rust against the backend contract directly.
//!
//! ## Storage and access
//!
//! The element kinds and value representations are defined in [`element`]. The
//! uniform backend contract that every concrete dataset honors — in-memory
//! storage ([`memory_backend`]), overlay chains ([`chain`]), renamed views
//! ([`view`]), and the static read-only wrapper ([`readonly`]) — lives in
//! [`format`]. [`lock`] provides the reentrant readers-writer lock underlying the
//! in-memory backend, and [`cache`] provides version-counter-driven memoization
//! for values derived from it (e.g. relayouts).
//!
//! ## Access patterns
//!
//! Callers are expected to go through [`facade`]'s `Readers`/`Writers` traits
//! rather than the raw [`format::Format`]/[`format::FormatMut`] methods directly:
//! the façade adds the argument validation and consistent error formatting the
//! raw contract leaves to its implementers. [`copy`] builds whole-dataset bulk
//! operations (copy, concatenation, naming adapters) out of the façade.
//!
//! [`query`] is the dynamic counterpart: a small expression grammar plus a
//! process-wide registry of named elementwise/reduction operations, for callers
//! that want to select and transform data by a string rather than Rust code.

pub mod cache;
pub mod chain;
pub mod copy;
pub mod element;
pub mod facade;
pub mod format;
pub mod lock;
pub mod memory_backend;
pub mod query;
pub mod readonly;
pub mod view;

mod error;

pub use self::{
    error::{Error, Result},
    facade::{Readers, VectorValueOrScalar, Writers},
    format::{Format, FormatMut},
};
