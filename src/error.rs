//! Error types for model reading, graph building, decoding and storage

use std::path::PathBuf;

use thiserror::Error;

/// A parsed model that cannot become a training example.
#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("model has no buses")]
    NoBuses,

    #[error("bus '{0}' is declared more than once")]
    DuplicateBus(String),

    #[error("{equipment} references unknown bus '{bus}'")]
    UnknownBus { equipment: String, bus: String },

    #[error("bus '{bus}' has unsupported phase set '{phases}'")]
    UnsupportedPhases { bus: String, phases: String },

    #[error("{entity}: invalid {field} value {value}")]
    InvalidValue {
        entity: String,
        field: &'static str,
        value: f64,
    },

    #[error("{equipment} has {phases} phases, expected 1 to 3")]
    InvalidPhaseCount { equipment: String, phases: usize },
}

/// A stored feature vector or row that does not match the encoding tables.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("{kind} vector has {actual} values, expected {expected}")]
    Length {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{field} code {value} is not a known label")]
    UnknownCode { field: &'static str, value: f64 },

    #[error("{field} must be a non-negative integer, got {value}")]
    NotACount { field: &'static str, value: f64 },

    #[error("{matrix} shape {rows}x{cols} does not fit in memory")]
    Shape {
        matrix: &'static str,
        rows: usize,
        cols: usize,
    },

    #[error("{matrix} blob holds {bytes} bytes, expected {expected}")]
    BlobSize {
        matrix: &'static str,
        bytes: usize,
        expected: usize,
    },

    #[error("edge {edge} references node {node}, graph has {node_count} nodes")]
    EdgeOutOfRange {
        edge: usize,
        node: i64,
        node_count: usize,
    },
}

/// Reasons a feeder cannot be split into transformer subgraphs.
#[derive(Debug, Error, PartialEq)]
pub enum SampleError {
    #[error("graph has no SOURCE node to orient from")]
    NoSource,

    #[error("graph contains a loop through edge {0}")]
    Loop(usize),
}

/// OpenDSS script problems found while reading a master file.
#[derive(Debug, Error)]
pub enum DssError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {message}")]
    Syntax {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("redirect cycle through {0}")]
    RedirectCycle(PathBuf),

    #[error("script defines no circuit")]
    NoCircuit,

    #[error(transparent)]
    Regex(#[from] regex::Error),
}

/// Dataset store failures. All of these are fatal for a generation run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid table name '{0}'")]
    InvalidTableName(String),

    #[error("dataset has no table named '{0}'")]
    MissingTable(String),

    #[error("dataset was written with encoding version {found}, this build uses {expected}")]
    VersionMismatch { expected: i64, found: i64 },

    #[error("row {index} not found, dataset has {len} rows")]
    RowNotFound { index: usize, len: usize },

    #[error("row {index} failed to decode: {source}")]
    Decode {
        index: usize,
        #[source]
        source: DecodeError,
    },
}
