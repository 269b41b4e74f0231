//! Graph building: one grid model becomes one [`GraphRecord`]

use std::collections::HashMap;

use tracing::debug;

use crate::encoding::{EdgeObject, EdgeType, NodeObject, NodeType, PhaseType};
use crate::error::ModelError;
use crate::models::{Bus, GridModel, Line, Transformer};

/// Ratio of line-to-line to line-to-neutral voltage
pub const SQRT_3: f64 = 1.732_050_807_568_877_2;

/// One training example.
///
/// `nodes[i]` is node `i`; `edges[k]` joins `edge_index[k].0` to `edge_index[k].1`.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphRecord {
    pub nodes: Vec<NodeObject>,
    pub edge_index: Vec<(usize, usize)>,
    pub edges: Vec<EdgeObject>,
}

impl GraphRecord {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Index of the first SOURCE node, if any
    pub fn source_node(&self) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.node_type == NodeType::Source)
    }

    /// Neighbour lists treating every edge as undirected; entries are
    /// `(neighbour, edge position)`.
    pub fn adjacency(&self) -> Vec<Vec<(usize, usize)>> {
        let mut adjacency = vec![Vec::new(); self.nodes.len()];
        for (k, &(from, to)) in self.edge_index.iter().enumerate() {
            adjacency[from].push((to, k));
            adjacency[to].push((from, k));
        }
        adjacency
    }
}

/// Power attached to one bus
#[derive(Debug, Default, Clone, Copy)]
struct Injection {
    has_source: bool,
    has_load: bool,
    has_generation: bool,
    demand_kw: f64,
    demand_kvar: f64,
    generation_kw: f64,
    generation_kvar: f64,
}

impl Injection {
    fn node_type(&self) -> NodeType {
        if self.has_source {
            NodeType::Source
        } else if self.has_load && self.has_generation {
            NodeType::LoadAndGeneration
        } else if self.has_load {
            NodeType::Load
        } else if self.has_generation {
            NodeType::Generation
        } else {
            NodeType::Junction
        }
    }
}

/// Bus name to node index, established once per model.
struct BusIndex<'a> {
    by_name: HashMap<&'a str, usize>,
}

impl<'a> BusIndex<'a> {
    fn new(buses: &'a [Bus]) -> Result<Self, ModelError> {
        let mut by_name = HashMap::with_capacity(buses.len());
        for (i, bus) in buses.iter().enumerate() {
            if by_name.insert(bus.name.as_str(), i).is_some() {
                return Err(ModelError::DuplicateBus(bus.name.clone()));
            }
        }
        Ok(Self { by_name })
    }

    fn resolve(&self, equipment: &str, bus: &str) -> Result<usize, ModelError> {
        self.by_name
            .get(bus)
            .copied()
            .ok_or_else(|| ModelError::UnknownBus {
                equipment: equipment.to_string(),
                bus: bus.to_string(),
            })
    }
}

fn check_value(entity: &str, field: &'static str, value: f64) -> Result<f64, ModelError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ModelError::InvalidValue {
            entity: entity.to_string(),
            field,
            value,
        });
    }
    Ok(value)
}

fn check_finite(entity: &str, field: &'static str, value: f64) -> Result<f64, ModelError> {
    if !value.is_finite() {
        return Err(ModelError::InvalidValue {
            entity: entity.to_string(),
            field,
            value,
        });
    }
    Ok(value)
}

fn check_phase_count(equipment: &str, phases: usize) -> Result<u8, ModelError> {
    if !(1..=3).contains(&phases) {
        return Err(ModelError::InvalidPhaseCount {
            equipment: equipment.to_string(),
            phases,
        });
    }
    Ok(phases as u8)
}

fn injections(model: &GridModel, index: &BusIndex<'_>) -> Result<Vec<Injection>, ModelError> {
    let mut per_bus = vec![Injection::default(); model.buses.len()];

    for source in &model.sources {
        per_bus[index.resolve(&source.name, &source.bus)?].has_source = true;
    }
    for load in &model.loads {
        let slot = &mut per_bus[index.resolve(&load.name, &load.bus)?];
        slot.has_load = true;
        slot.demand_kw += check_finite(&load.name, "active_kw", load.active_kw)?;
        slot.demand_kvar += check_finite(&load.name, "reactive_kvar", load.reactive_kvar)?;
    }
    for solar in &model.solars {
        let slot = &mut per_bus[index.resolve(&solar.name, &solar.bus)?];
        slot.has_generation = true;
        slot.generation_kw += check_value(&solar.name, "rated_kw", solar.rated_kw)?;
    }
    for cap in &model.capacitors {
        let slot = &mut per_bus[index.resolve(&cap.name, &cap.bus)?];
        slot.has_generation = true;
        slot.generation_kvar += check_value(&cap.name, "rated_kvar", cap.rated_kvar)?;
    }

    Ok(per_bus)
}

fn node_object(bus: &Bus, injection: &Injection) -> Result<NodeObject, ModelError> {
    let phase_type =
        PhaseType::from_phases(&bus.phases).ok_or_else(|| ModelError::UnsupportedPhases {
            bus: bus.name.clone(),
            phases: PhaseType::render(&bus.phases),
        })?;
    let mut distinct = bus.phases.clone();
    distinct.sort();
    distinct.dedup();

    Ok(NodeObject {
        node_type: injection.node_type(),
        active_demand_kw: injection.demand_kw,
        reactive_demand_kvar: injection.demand_kvar,
        active_generation_kw: injection.generation_kw,
        reactive_generation_kvar: injection.generation_kvar,
        num_nodes: distinct.len(),
        phase_type,
        kv_level: check_value(&bus.name, "nominal_voltage_kv", bus.nominal_voltage_kv)?,
    })
}

fn line_edge(line: &Line, from_kv: f64) -> Result<EdgeObject, ModelError> {
    let num_phase = check_phase_count(&line.name, line.num_phases())?;
    let length = check_value(&line.name, "length_miles", line.length_miles)?;
    let ampacity = check_value(&line.name, "ampacity_a", line.ampacity_a)?;
    let factor = if num_phase > 1 { SQRT_3 } else { 1.0 };
    let z = line.impedance.unwrap_or_default();

    Ok(EdgeObject {
        num_phase,
        capacity_kva: ampacity * from_kv * factor,
        edge_type: EdgeType::Line,
        length_miles: length,
        r0: check_finite(&line.name, "r0", z.r0)? * length,
        r1: check_finite(&line.name, "r1", z.r1)? * length,
        x0: check_finite(&line.name, "x0", z.x0)? * length,
        x1: check_finite(&line.name, "x1", z.x1)? * length,
    })
}

fn transformer_edge(tr: &Transformer) -> Result<EdgeObject, ModelError> {
    Ok(EdgeObject {
        num_phase: check_phase_count(&tr.name, tr.num_phases)?,
        capacity_kva: check_value(&tr.name, "rated_kva", tr.rated_kva)?,
        edge_type: EdgeType::Transformer,
        length_miles: 0.0,
        r0: 0.0,
        r1: check_finite(&tr.name, "r_percent", tr.r_percent)?,
        x0: 0.0,
        x1: check_finite(&tr.name, "xhl_percent", tr.xhl_percent)?,
    })
}

/// Convert a grid model into a graph record.
///
/// Node `i` is `model.buses[i]`. Lines come before transformers in the edge
/// list, each group in model order. Any integrity problem rejects the whole
/// model.
pub fn build_graph(model: &GridModel) -> Result<GraphRecord, ModelError> {
    if model.buses.is_empty() {
        return Err(ModelError::NoBuses);
    }

    let index = BusIndex::new(&model.buses)?;
    let per_bus = injections(model, &index)?;

    let nodes = model
        .buses
        .iter()
        .zip(&per_bus)
        .map(|(bus, injection)| node_object(bus, injection))
        .collect::<Result<Vec<_>, _>>()?;

    let mut edge_index = Vec::with_capacity(model.connecting_equipment_count());
    let mut edges = Vec::with_capacity(model.connecting_equipment_count());

    for line in &model.lines {
        let from = index.resolve(&line.name, &line.from_bus)?;
        let to = index.resolve(&line.name, &line.to_bus)?;
        edges.push(line_edge(line, nodes[from].kv_level)?);
        edge_index.push((from, to));
    }
    for tr in &model.transformers {
        let from = index.resolve(&tr.name, &tr.from_bus)?;
        let to = index.resolve(&tr.name, &tr.to_bus)?;
        edges.push(transformer_edge(tr)?);
        edge_index.push((from, to));
    }

    debug!(
        model = %model.name,
        nodes = nodes.len(),
        edges = edges.len(),
        "built graph"
    );

    Ok(GraphRecord {
        nodes,
        edge_index,
        edges,
    })
}
