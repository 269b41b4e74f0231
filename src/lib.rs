//! Graph training datasets from distribution feeder models
//!
//! Feeder models (JSON grid-data-model files or OpenDSS master scripts) are
//! turned into graphs with one node per bus and one edge per line or
//! transformer, encoded as fixed-width feature vectors, and stored row by row
//! in a SQLite dataset.

pub mod db;
pub mod dss;
pub mod encoding;
pub mod error;
pub mod extract;
pub mod graph;
pub mod models;
pub mod sampling;
pub mod stats;

pub use db::{Dataset, DatasetRow};
pub use encoding::{EdgeObject, EdgeType, NodeObject, NodeType, PhaseType};
pub use graph::{GraphRecord, build_graph};
pub use models::GridModel;
