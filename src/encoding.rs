//! Node and edge attribute encoding
//!
//! Every node and edge becomes a fixed-order `f64` vector. Categorical fields
//! are stored as ordinal codes taken from the constant tables below; the same
//! tables drive decoding, so a stored vector decodes back to the labels it was
//! written with. Bump [`ENCODING_VERSION`] whenever a table or the feature
//! order changes.

use crate::error::DecodeError;
use crate::models::Phase;

/// Version of the feature order and code tables, stored with every dataset.
pub const ENCODING_VERSION: i64 = 1;

pub const NODE_FEATURE_COUNT: usize = 8;
pub const EDGE_FEATURE_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeType {
    Source,
    Load,
    Generation,
    LoadAndGeneration,
    Junction,
}

impl NodeType {
    pub const ALL: [NodeType; 5] = [
        NodeType::Source,
        NodeType::Load,
        NodeType::Generation,
        NodeType::LoadAndGeneration,
        NodeType::Junction,
    ];

    pub fn code(self) -> u8 {
        match self {
            NodeType::Source => 1,
            NodeType::Load => 2,
            NodeType::Generation => 3,
            NodeType::LoadAndGeneration => 4,
            NodeType::Junction => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn label(self) -> &'static str {
        match self {
            NodeType::Source => "SOURCE",
            NodeType::Load => "LOAD",
            NodeType::Generation => "GENERATION",
            NodeType::LoadAndGeneration => "LOAD_AND_GENERATION",
            NodeType::Junction => "JUNCTION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeType {
    Transformer,
    Line,
}

impl EdgeType {
    pub const ALL: [EdgeType; 2] = [EdgeType::Transformer, EdgeType::Line];

    pub fn code(self) -> u8 {
        match self {
            EdgeType::Transformer => 1,
            EdgeType::Line => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn label(self) -> &'static str {
        match self {
            EdgeType::Transformer => "TRANSFORMER",
            EdgeType::Line => "LINE",
        }
    }
}

/// Phase sets that may appear at a bus, rendered in canonical phase order.
/// The code of an entry is its position plus one.
pub static PHASE_TYPES: [&str; 25] = [
    "A", "B", "C", "N", "AB", "AC", "BC", "AN", "BN", "CN", "ABC", "ABN", "ACN", "BCN", "ABCN",
    "S1", "S2", "S1S2", "NS1S2", "AS1S2", "ANS1S2", "BS1S2", "BNS1S2", "CS1S2", "CNS1S2",
];

/// Index into [`PHASE_TYPES`]; only constructible from a listed combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhaseType(u8);

impl PhaseType {
    /// Canonical label for a set of phases, whether or not the table lists it.
    pub fn render(phases: &[Phase]) -> String {
        let mut sorted = phases.to_vec();
        sorted.sort();
        sorted.dedup();
        sorted.into_iter().map(Phase::label).collect()
    }

    pub fn from_phases(phases: &[Phase]) -> Option<Self> {
        Self::from_label(&Self::render(phases))
    }

    pub fn from_label(label: &str) -> Option<Self> {
        PHASE_TYPES
            .iter()
            .position(|l| *l == label)
            .map(|i| PhaseType(i as u8 + 1))
    }

    pub fn code(self) -> u8 {
        self.0
    }

    pub fn from_code(code: u8) -> Option<Self> {
        (1..=PHASE_TYPES.len() as u8)
            .contains(&code)
            .then_some(PhaseType(code))
    }

    pub fn label(self) -> &'static str {
        PHASE_TYPES[usize::from(self.0) - 1]
    }
}

/// How a feature column is interpreted when summarizing a dataset.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// Ordinal code with a label lookup
    Categorical(fn(u8) -> Option<&'static str>),
    Numeric,
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureField {
    pub name: &'static str,
    pub kind: FieldKind,
}

fn node_type_label(code: u8) -> Option<&'static str> {
    NodeType::from_code(code).map(NodeType::label)
}

fn edge_type_label(code: u8) -> Option<&'static str> {
    EdgeType::from_code(code).map(EdgeType::label)
}

fn phase_type_label(code: u8) -> Option<&'static str> {
    PhaseType::from_code(code).map(PhaseType::label)
}

fn num_phase_label(code: u8) -> Option<&'static str> {
    match code {
        1 => Some("1"),
        2 => Some("2"),
        3 => Some("3"),
        _ => None,
    }
}

const fn numeric(name: &'static str) -> FeatureField {
    FeatureField {
        name,
        kind: FieldKind::Numeric,
    }
}

pub static NODE_FIELDS: [FeatureField; NODE_FEATURE_COUNT] = [
    FeatureField {
        name: "node_type",
        kind: FieldKind::Categorical(node_type_label),
    },
    numeric("active_demand_kw"),
    numeric("reactive_demand_kvar"),
    numeric("active_generation_kw"),
    numeric("reactive_generation_kvar"),
    numeric("num_nodes"),
    FeatureField {
        name: "phase_type",
        kind: FieldKind::Categorical(phase_type_label),
    },
    numeric("kv_level"),
];

pub static EDGE_FIELDS: [FeatureField; EDGE_FEATURE_COUNT] = [
    FeatureField {
        name: "num_phase",
        kind: FieldKind::Categorical(num_phase_label),
    },
    numeric("capacity_kva"),
    FeatureField {
        name: "edge_type",
        kind: FieldKind::Categorical(edge_type_label),
    },
    numeric("length_miles"),
    numeric("r0"),
    numeric("r1"),
    numeric("x0"),
    numeric("x1"),
];

/// Comma-separated column names, as recorded in the dataset metadata.
pub fn field_names(fields: &[FeatureField]) -> String {
    fields.iter().map(|f| f.name).collect::<Vec<_>>().join(",")
}

/// Read an ordinal code. Anything non-integral or outside `1..=255` is rejected.
pub fn decode_code(field: &'static str, value: f64) -> Result<u8, DecodeError> {
    if value.fract() != 0.0 || !(1.0..=255.0).contains(&value) {
        return Err(DecodeError::UnknownCode { field, value });
    }
    Ok(value as u8)
}

fn decode_count(field: &'static str, value: f64) -> Result<usize, DecodeError> {
    if value.fract() != 0.0 || value < 0.0 || !value.is_finite() {
        return Err(DecodeError::NotACount { field, value });
    }
    Ok(value as usize)
}

fn check_len(kind: &'static str, values: &[f64], expected: usize) -> Result<(), DecodeError> {
    if values.len() != expected {
        return Err(DecodeError::Length {
            kind,
            expected,
            actual: values.len(),
        });
    }
    Ok(())
}

/// Features of one bus.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeObject {
    pub node_type: NodeType,
    pub active_demand_kw: f64,
    pub reactive_demand_kvar: f64,
    pub active_generation_kw: f64,
    pub reactive_generation_kvar: f64,
    pub num_nodes: usize,
    pub phase_type: PhaseType,
    pub kv_level: f64,
}

impl NodeObject {
    pub fn to_array(&self) -> [f64; NODE_FEATURE_COUNT] {
        [
            f64::from(self.node_type.code()),
            self.active_demand_kw,
            self.reactive_demand_kvar,
            self.active_generation_kw,
            self.reactive_generation_kvar,
            self.num_nodes as f64,
            f64::from(self.phase_type.code()),
            self.kv_level,
        ]
    }

    pub fn from_array(values: &[f64]) -> Result<Self, DecodeError> {
        check_len("node", values, NODE_FEATURE_COUNT)?;

        let node_type = NodeType::from_code(decode_code("node_type", values[0])?).ok_or(
            DecodeError::UnknownCode {
                field: "node_type",
                value: values[0],
            },
        )?;
        let phase_type = PhaseType::from_code(decode_code("phase_type", values[6])?).ok_or(
            DecodeError::UnknownCode {
                field: "phase_type",
                value: values[6],
            },
        )?;

        Ok(NodeObject {
            node_type,
            active_demand_kw: values[1],
            reactive_demand_kvar: values[2],
            active_generation_kw: values[3],
            reactive_generation_kvar: values[4],
            num_nodes: decode_count("num_nodes", values[5])?,
            phase_type,
            kv_level: values[7],
        })
    }
}

/// Features of one line or transformer.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeObject {
    pub num_phase: u8,
    pub capacity_kva: f64,
    pub edge_type: EdgeType,
    pub length_miles: f64,
    pub r0: f64,
    pub r1: f64,
    pub x0: f64,
    pub x1: f64,
}

impl EdgeObject {
    pub fn to_array(&self) -> [f64; EDGE_FEATURE_COUNT] {
        [
            f64::from(self.num_phase),
            self.capacity_kva,
            f64::from(self.edge_type.code()),
            self.length_miles,
            self.r0,
            self.r1,
            self.x0,
            self.x1,
        ]
    }

    pub fn from_array(values: &[f64]) -> Result<Self, DecodeError> {
        check_len("edge", values, EDGE_FEATURE_COUNT)?;

        let num_phase = decode_code("num_phase", values[0])?;
        if num_phase_label(num_phase).is_none() {
            return Err(DecodeError::UnknownCode {
                field: "num_phase",
                value: values[0],
            });
        }
        let edge_type = EdgeType::from_code(decode_code("edge_type", values[2])?).ok_or(
            DecodeError::UnknownCode {
                field: "edge_type",
                value: values[2],
            },
        )?;

        Ok(EdgeObject {
            num_phase,
            capacity_kva: values[1],
            edge_type,
            length_miles: values[3],
            r0: values[4],
            r1: values[5],
            x0: values[6],
            x1: values[7],
        })
    }
}
