//! Value stream flow engine.
//!
//! Work items move through an ordered catalog of stages. Every movement is a
//! [`Transition`](flow_common::Transition) appended by the [`engine`], which
//! is the only writer: it serialises per item, applies the
//! [`policy`], dedups retries, clamps out-of-order timestamps, and updates the
//! stage projection in the same transaction. Committed transitions are pushed
//! to the [`aggregator`] for live flow metrics.
//!
//! The [`ingress`] adapters translate the API, board webhooks and periodic
//! board sync into engine requests. [`query`] serves reads.

pub mod aggregator;
pub mod api;
pub mod board;
pub mod db;
pub mod engine;
pub mod ingress;
pub mod locks;
pub mod log;
pub mod policy;
pub mod query;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
