//! Per-field summary statistics over a stored dataset
//!
//! Numeric values are gathered and sorted before they are reduced, so the
//! report does not depend on the order rows are visited in.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

use crate::db::Dataset;
use crate::encoding::{EDGE_FIELDS, FeatureField, FieldKind, NODE_FIELDS};
use crate::error::StoreError;
use crate::graph::GraphRecord;

/// One line of the report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsRow {
    pub entity: &'static str,
    pub field: &'static str,
    pub kind: &'static str,
    pub count: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub median: Option<f64>,
    pub max: Option<f64>,
    /// `LABEL:count` pairs in code order, `;`-separated
    pub categories: String,
}

enum Accumulator {
    Categorical {
        label: fn(u8) -> Option<&'static str>,
        counts: BTreeMap<u8, usize>,
    },
    Numeric(Vec<f64>),
}

struct FieldStats {
    entity: &'static str,
    field: &'static str,
    acc: Accumulator,
}

impl FieldStats {
    fn new(entity: &'static str, field: &FeatureField) -> Self {
        let acc = match field.kind {
            FieldKind::Categorical(label) => Accumulator::Categorical {
                label,
                counts: BTreeMap::new(),
            },
            FieldKind::Numeric => Accumulator::Numeric(Vec::new()),
        };
        FieldStats {
            entity,
            field: field.name,
            acc,
        }
    }

    fn numeric(entity: &'static str, field: &'static str) -> Self {
        FieldStats {
            entity,
            field,
            acc: Accumulator::Numeric(Vec::new()),
        }
    }

    fn push(&mut self, value: f64) {
        match &mut self.acc {
            // decoded vectors only carry valid codes
            Accumulator::Categorical { counts, .. } => *counts.entry(value as u8).or_default() += 1,
            Accumulator::Numeric(values) => values.push(value),
        }
    }

    fn finish(self) -> StatsRow {
        let mut row = StatsRow {
            entity: self.entity,
            field: self.field,
            kind: "numeric",
            count: 0,
            mean: None,
            std: None,
            min: None,
            median: None,
            max: None,
            categories: String::new(),
        };

        match self.acc {
            Accumulator::Categorical { label, counts } => {
                row.kind = "categorical";
                row.count = counts.values().sum();
                row.categories = counts
                    .iter()
                    .map(|(code, n)| match label(*code) {
                        Some(l) => format!("{l}:{n}"),
                        None => format!("{code}:{n}"),
                    })
                    .collect::<Vec<_>>()
                    .join(";");
            }
            Accumulator::Numeric(mut values) => {
                values.sort_by(f64::total_cmp);
                row.count = values.len();
                if let (Some(&first), Some(&last)) = (values.first(), values.last()) {
                    let n = values.len() as f64;
                    let mean = values.iter().sum::<f64>() / n;
                    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                    let mid = values.len() / 2;
                    let median = if values.len() % 2 == 1 {
                        values[mid]
                    } else {
                        (values[mid - 1] + values[mid]) / 2.0
                    };
                    row.mean = Some(mean);
                    row.std = Some(variance.sqrt());
                    row.min = Some(first);
                    row.median = Some(median);
                    row.max = Some(last);
                }
            }
        }
        row
    }
}

/// Accumulates records one at a time.
pub struct StatsBuilder {
    node: Vec<FieldStats>,
    edge: Vec<FieldStats>,
    graph: Vec<FieldStats>,
}

impl Default for StatsBuilder {
    fn default() -> Self {
        StatsBuilder {
            node: NODE_FIELDS.iter().map(|f| FieldStats::new("node", f)).collect(),
            edge: EDGE_FIELDS.iter().map(|f| FieldStats::new("edge", f)).collect(),
            graph: vec![
                FieldStats::numeric("graph", "num_nodes"),
                FieldStats::numeric("graph", "num_edges"),
            ],
        }
    }
}

impl StatsBuilder {
    pub fn add(&mut self, record: &GraphRecord) {
        for node in &record.nodes {
            for (slot, value) in self.node.iter_mut().zip(node.to_array()) {
                slot.push(value);
            }
        }
        for edge in &record.edges {
            for (slot, value) in self.edge.iter_mut().zip(edge.to_array()) {
                slot.push(value);
            }
        }
        self.graph[0].push(record.node_count() as f64);
        self.graph[1].push(record.edge_count() as f64);
    }

    pub fn finish(self) -> Vec<StatsRow> {
        self.node
            .into_iter()
            .chain(self.edge)
            .chain(self.graph)
            .map(FieldStats::finish)
            .collect()
    }
}

/// Report over a whole dataset
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetStats {
    pub rows_read: usize,
    pub rows_skipped: usize,
    pub fields: Vec<StatsRow>,
}

impl DatasetStats {
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        for row in &self.fields {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Display for DatasetStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Analyzed {} rows ({} skipped), {} fields",
            self.rows_read,
            self.rows_skipped,
            self.fields.len()
        )
    }
}

/// Summary statistics for in-memory records
pub fn analyze_records<'a, I>(records: I) -> Vec<StatsRow>
where
    I: IntoIterator<Item = &'a GraphRecord>,
{
    let mut builder = StatsBuilder::default();
    for record in records {
        builder.add(record);
    }
    builder.finish()
}

/// Decode and summarize every row. Rows that fail to decode are skipped and counted.
pub fn analyze_dataset(dataset: &Dataset) -> Result<DatasetStats, StoreError> {
    let mut builder = StatsBuilder::default();
    let mut rows_read = 0;
    let mut rows_skipped = 0;

    dataset.for_each_row(|index, row| {
        match row.and_then(|r| r.to_record()) {
            Ok(record) => {
                builder.add(&record);
                rows_read += 1;
            }
            Err(e) => {
                warn!(index, "Skipping row: {}", e);
                rows_skipped += 1;
            }
        }
    })?;

    Ok(DatasetStats {
        rows_read,
        rows_skipped,
        fields: builder.finish(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{EdgeObject, EdgeType, NodeObject, NodeType, PhaseType};
    use approx::assert_relative_eq;

    fn node(node_type: NodeType, kw: f64) -> NodeObject {
        NodeObject {
            node_type,
            active_demand_kw: kw,
            reactive_demand_kvar: 0.0,
            active_generation_kw: 0.0,
            reactive_generation_kvar: 0.0,
            num_nodes: 1,
            phase_type: PhaseType::from_label("A").unwrap(),
            kv_level: 0.12,
        }
    }

    fn record(kws: &[f64]) -> GraphRecord {
        let mut nodes = vec![node(NodeType::Source, 0.0)];
        nodes.extend(kws.iter().map(|&kw| node(NodeType::Load, kw)));
        let edge_index: Vec<_> = (1..nodes.len()).map(|i| (0, i)).collect();
        let edges = edge_index
            .iter()
            .map(|_| EdgeObject {
                num_phase: 1,
                capacity_kva: 50.0,
                edge_type: EdgeType::Line,
                length_miles: 0.1,
                r0: 0.0,
                r1: 0.0,
                x0: 0.0,
                x1: 0.0,
            })
            .collect();
        GraphRecord {
            nodes,
            edge_index,
            edges,
        }
    }

    fn field<'a>(rows: &'a [StatsRow], entity: &str, name: &str) -> &'a StatsRow {
        rows.iter()
            .find(|r| r.entity == entity && r.field == name)
            .unwrap()
    }

    #[test]
    fn categorical_fields_count_labels() {
        let rows = analyze_records(&[record(&[1.0, 2.0]), record(&[3.0])]);
        let node_type = field(&rows, "node", "node_type");
        assert_eq!(node_type.kind, "categorical");
        assert_eq!(node_type.count, 5);
        assert_eq!(node_type.categories, "SOURCE:2;LOAD:3");
        assert_eq!(field(&rows, "edge", "edge_type").categories, "LINE:3");
    }

    #[test]
    fn numeric_fields_summarize() {
        let rows = analyze_records(&[record(&[1.0, 2.0]), record(&[3.0])]);
        let demand = field(&rows, "node", "active_demand_kw");
        assert_eq!(demand.count, 5);
        assert_relative_eq!(demand.mean.unwrap(), 1.2);
        assert_eq!(demand.min, Some(0.0));
        assert_eq!(demand.median, Some(1.0));
        assert_eq!(demand.max, Some(3.0));

        let sizes = field(&rows, "graph", "num_nodes");
        assert_eq!(sizes.median, Some(2.5));
    }

    #[test]
    fn single_record_has_no_spread() {
        let rows = analyze_records(&[record(&[])]);
        let demand = field(&rows, "node", "active_demand_kw");
        assert_eq!(demand.count, 1);
        assert_eq!(demand.std, Some(0.0));
        let length = field(&rows, "edge", "length_miles");
        assert_eq!(length.count, 0);
        assert_eq!(length.mean, None);
    }

    #[test]
    fn order_does_not_change_the_report() {
        let records = vec![
            record(&[0.1, 0.7]),
            record(&[1e16, 1.0]),
            record(&[-1e16, 0.3]),
        ];
        let forward = analyze_records(&records);
        let backward = analyze_records(records.iter().rev());
        assert_eq!(forward, backward);
    }

    #[test]
    fn report_has_one_row_per_field() {
        let rows = analyze_records(&[record(&[1.0])]);
        assert_eq!(rows.len(), NODE_FIELDS.len() + EDGE_FIELDS.len() + 2);
    }
}
