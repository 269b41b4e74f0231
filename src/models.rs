//! In-memory grid model: buses keyed by name and equipment that refers to them by name
//!
//! This is the JSON grid-data-model format read from `*.json` system files and
//! the target of the OpenDSS reader in [`crate::dss`].

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A phase conductor or neutral present at a bus or on a piece of equipment.
///
/// Declaration order is the canonical order used to render phase sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    A,
    B,
    C,
    N,
    S1,
    S2,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::A => "A",
            Phase::B => "B",
            Phase::C => "C",
            Phase::N => "N",
            Phase::S1 => "S1",
            Phase::S2 => "S2",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    pub name: String,
    pub phases: Vec<Phase>,
    /// Line-to-neutral voltage base
    pub nominal_voltage_kv: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltageSource {
    pub name: String,
    pub bus: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Load {
    pub name: String,
    pub bus: String,
    pub active_kw: f64,
    #[serde(default)]
    pub reactive_kvar: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solar {
    pub name: String,
    pub bus: String,
    pub rated_kw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capacitor {
    pub name: String,
    pub bus: String,
    pub rated_kvar: f64,
}

/// Per-mile symmetrical-component impedance (ohms)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceImpedance {
    pub r0: f64,
    pub r1: f64,
    pub x0: f64,
    pub x1: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub name: String,
    pub from_bus: String,
    pub to_bus: String,
    pub phases: Vec<Phase>,
    pub length_miles: f64,
    pub ampacity_a: f64,
    #[serde(default)]
    pub impedance: Option<SequenceImpedance>,
}

impl Line {
    /// Number of phase conductors, neutral excluded
    pub fn num_phases(&self) -> usize {
        self.phases.iter().filter(|p| **p != Phase::N).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformer {
    pub name: String,
    pub from_bus: String,
    pub to_bus: String,
    pub num_phases: usize,
    pub rated_kva: f64,
    #[serde(default)]
    pub r_percent: f64,
    #[serde(default)]
    pub xhl_percent: f64,
}

/// One feeder. Vector order is the model's insertion order and is preserved
/// through graph building.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridModel {
    #[serde(default)]
    pub name: String,
    pub buses: Vec<Bus>,
    #[serde(default)]
    pub sources: Vec<VoltageSource>,
    #[serde(default)]
    pub loads: Vec<Load>,
    #[serde(default)]
    pub solars: Vec<Solar>,
    #[serde(default)]
    pub capacitors: Vec<Capacitor>,
    #[serde(default)]
    pub lines: Vec<Line>,
    #[serde(default)]
    pub transformers: Vec<Transformer>,
}

impl GridModel {
    pub fn from_json_str(content: &str) -> serde_json::Result<Self> {
        serde_json::from_str(content)
    }

    /// Read a JSON system file. The file stem becomes the model name when the
    /// file does not carry one.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut model = Self::from_json_str(&content)
            .with_context(|| format!("Failed to parse grid model {}", path.display()))?;
        if model.name.is_empty() {
            model.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
        }
        Ok(model)
    }

    /// Lines and transformers; each becomes one edge.
    pub fn connecting_equipment_count(&self) -> usize {
        self.lines.len() + self.transformers.len()
    }
}
