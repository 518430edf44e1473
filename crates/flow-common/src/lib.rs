//! Shared domain types for the value stream flow engine.
//!
//! Everything here is plain data: stages, work items, transitions and the
//! closed vocabularies (categories, item types, sources, denial reasons) that
//! travel between the engine, its storage and its adapters.

pub mod models;

pub use models::*;
