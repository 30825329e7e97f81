//! Local implementations of every collaborator, for running without remote services.

pub mod graph;
pub mod store;
pub mod tracker;

pub use graph::{LocalGraph, LocalGraphEngine, LocalRule};
pub use store::{DirBuildData, DirFs, DirStore};
pub use tracker::LocalTracker;
