//! SQLite dataset store
//!
//! Each graph record is one row of a named table, holding the node feature
//! matrix, the edge index matrix and the edge feature matrix as little-endian
//! blobs next to their shapes. Row ids start at 0 and follow insertion order.

use std::path::Path;

use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use tracing::debug;

use crate::encoding::{
    EDGE_FEATURE_COUNT, EDGE_FIELDS, ENCODING_VERSION, EdgeObject, NODE_FEATURE_COUNT,
    NODE_FIELDS, NodeObject, field_names,
};
use crate::error::{DecodeError, StoreError};
use crate::graph::GraphRecord;

pub const DEFAULT_TABLE: &str = "data_table";

/// Dense row-major matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<T>,
}

impl<T> Matrix<T> {
    pub fn row(&self, i: usize) -> &[T] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }
}

/// Persisted form of a [`GraphRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRow {
    /// nodes × node features
    pub x: Matrix<f64>,
    /// 2 × edges; row 0 holds sources, row 1 targets
    pub edge_index: Matrix<i64>,
    /// edges × edge features
    pub edge_attr: Matrix<f64>,
}

impl DatasetRow {
    pub fn from_record(record: &GraphRecord) -> Self {
        let x = Matrix {
            rows: record.node_count(),
            cols: NODE_FEATURE_COUNT,
            data: record.nodes.iter().flat_map(|n| n.to_array()).collect(),
        };

        let mut index = Vec::with_capacity(2 * record.edge_count());
        index.extend(record.edge_index.iter().map(|&(from, _)| from as i64));
        index.extend(record.edge_index.iter().map(|&(_, to)| to as i64));
        let edge_index = Matrix {
            rows: 2,
            cols: record.edge_count(),
            data: index,
        };

        let edge_attr = Matrix {
            rows: record.edge_count(),
            cols: EDGE_FEATURE_COUNT,
            data: record.edges.iter().flat_map(|e| e.to_array()).collect(),
        };

        DatasetRow {
            x,
            edge_index,
            edge_attr,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.x.rows
    }

    pub fn num_edges(&self) -> usize {
        self.edge_attr.rows
    }

    /// Decode the matrices back into node and edge objects.
    pub fn to_record(&self) -> Result<GraphRecord, DecodeError> {
        let nodes = (0..self.x.rows)
            .map(|i| NodeObject::from_array(self.x.row(i)))
            .collect::<Result<Vec<_>, _>>()?;
        let edges = (0..self.edge_attr.rows)
            .map(|i| EdgeObject::from_array(self.edge_attr.row(i)))
            .collect::<Result<Vec<_>, _>>()?;

        let node_count = nodes.len();
        let endpoint = |edge: usize, value: i64| {
            usize::try_from(value)
                .ok()
                .filter(|&v| v < node_count)
                .ok_or(DecodeError::EdgeOutOfRange {
                    edge,
                    node: value,
                    node_count,
                })
        };
        let mut edge_index = Vec::with_capacity(self.edge_index.cols);
        for k in 0..self.edge_index.cols {
            let from = endpoint(k, self.edge_index.data[k])?;
            let to = endpoint(k, self.edge_index.data[self.edge_index.cols + k])?;
            edge_index.push((from, to));
        }
        if edge_index.len() != edges.len() {
            return Err(DecodeError::Length {
                kind: "edge_index",
                expected: edges.len(),
                actual: edge_index.len(),
            });
        }

        Ok(GraphRecord {
            nodes,
            edge_index,
            edges,
        })
    }
}

fn f64_blob(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn i64_blob(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Number of values a `rows` x `cols` matrix holds, checked against the blob size
fn check_blob(
    matrix: &'static str,
    bytes: &[u8],
    rows: usize,
    cols: usize,
) -> Result<usize, DecodeError> {
    let len = rows
        .checked_mul(cols)
        .filter(|len| len.checked_mul(8).is_some())
        .ok_or(DecodeError::Shape { matrix, rows, cols })?;
    if bytes.len() != len * 8 {
        return Err(DecodeError::BlobSize {
            matrix,
            bytes: bytes.len(),
            expected: len * 8,
        });
    }
    Ok(len)
}

fn blob_f64(
    matrix: &'static str,
    bytes: &[u8],
    rows: usize,
    cols: usize,
) -> Result<Vec<f64>, DecodeError> {
    check_blob(matrix, bytes, rows, cols)?;
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            f64::from_le_bytes(buf)
        })
        .collect())
}

fn blob_i64(
    matrix: &'static str,
    bytes: &[u8],
    rows: usize,
    cols: usize,
) -> Result<Vec<i64>, DecodeError> {
    check_blob(matrix, bytes, rows, cols)?;
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            i64::from_le_bytes(buf)
        })
        .collect())
}

fn dim(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

/// Columns of one stored row before the blobs are checked against their shapes
struct RawRow {
    num_nodes: i64,
    num_edges: i64,
    node_features: i64,
    edge_features: i64,
    x: Vec<u8>,
    edge_index: Vec<u8>,
    edge_attr: Vec<u8>,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRow {
            num_nodes: row.get(0)?,
            num_edges: row.get(1)?,
            node_features: row.get(2)?,
            edge_features: row.get(3)?,
            x: row.get(4)?,
            edge_index: row.get(5)?,
            edge_attr: row.get(6)?,
        })
    }

    fn decode(self) -> Result<DatasetRow, DecodeError> {
        let (nodes, edges) = (dim(self.num_nodes), dim(self.num_edges));
        let (node_cols, edge_cols) = (dim(self.node_features), dim(self.edge_features));

        Ok(DatasetRow {
            x: Matrix {
                rows: nodes,
                cols: node_cols,
                data: blob_f64("x", &self.x, nodes, node_cols)?,
            },
            edge_index: Matrix {
                rows: 2,
                cols: edges,
                data: blob_i64("edge_index", &self.edge_index, 2, edges)?,
            },
            edge_attr: Matrix {
                rows: edges,
                cols: edge_cols,
                data: blob_f64("edge_attr", &self.edge_attr, edges, edge_cols)?,
            },
        })
    }
}

/// Summary of a dataset file, as recorded in its metadata table.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetInfo {
    pub table: String,
    pub rows: usize,
    pub encoding_version: i64,
    pub node_features: String,
    pub edge_features: String,
}

/// A named table of graph rows inside a SQLite file.
pub struct Dataset {
    conn: Connection,
    table: String,
}

fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let mut chars = table.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(StoreError::InvalidTableName(table.to_string()));
    }
    Ok(())
}

impl Dataset {
    /// Open a dataset for writing, creating the file and schema if needed.
    pub fn create_or_open(path: &Path, table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        let conn = Connection::open(path)?;
        Self::with_schema(conn, table)
    }

    /// Open an existing dataset without write access.
    pub fn open_read_only(path: &Path, table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(StoreError::MissingTable(table.to_string()));
        }
        let dataset = Dataset {
            conn,
            table: table.to_string(),
        };
        dataset.check_version()?;
        Ok(dataset)
    }

    /// Scratch dataset for tests and dry runs.
    pub fn in_memory(table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        Self::with_schema(Connection::open_in_memory()?, table)
    }

    fn with_schema(conn: Connection, table: &str) -> Result<Self, StoreError> {
        conn.execute_batch(&format!(
            r#"
            -- Encoding tables the rows were written with
            CREATE TABLE IF NOT EXISTS dataset_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- One graph per row; id is the dataset index
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY,
                num_nodes INTEGER NOT NULL,
                num_edges INTEGER NOT NULL,
                node_features INTEGER NOT NULL,
                edge_features INTEGER NOT NULL,
                x BLOB NOT NULL,
                edge_index BLOB NOT NULL,
                edge_attr BLOB NOT NULL
            );
            "#
        ))?;

        let meta = [
            ("encoding_version", ENCODING_VERSION.to_string()),
            ("node_features", field_names(&NODE_FIELDS)),
            ("edge_features", field_names(&EDGE_FIELDS)),
        ];
        for (key, value) in meta {
            conn.execute(
                "INSERT OR IGNORE INTO dataset_meta (key, value) VALUES (?1, ?2)",
                (key, value),
            )?;
        }

        let dataset = Dataset {
            conn,
            table: table.to_string(),
        };
        dataset.check_version()?;
        Ok(dataset)
    }

    fn meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let has_meta: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'dataset_meta'",
            [],
            |row| row.get(0),
        )?;
        if has_meta == 0 {
            return Ok(None);
        }
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM dataset_meta WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Encoding version recorded in the file. Files without metadata count as current.
    pub fn encoding_version(&self) -> Result<i64, StoreError> {
        Ok(self
            .meta("encoding_version")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(ENCODING_VERSION))
    }

    fn check_version(&self) -> Result<(), StoreError> {
        let found = self.encoding_version()?;
        if found != ENCODING_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: ENCODING_VERSION,
                found,
            });
        }
        Ok(())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(dim(count))
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    pub fn info(&self) -> Result<DatasetInfo, StoreError> {
        Ok(DatasetInfo {
            table: self.table.clone(),
            rows: self.len()?,
            encoding_version: self.encoding_version()?,
            node_features: self.meta("node_features")?.unwrap_or_default(),
            edge_features: self.meta("edge_features")?.unwrap_or_default(),
        })
    }

    /// Append one record in its own transaction and return its row index.
    pub fn append(&mut self, record: &GraphRecord) -> Result<usize, StoreError> {
        let row = DatasetRow::from_record(record);
        let tx = self.conn.transaction()?;

        let index: i64 = tx.query_row(
            &format!("SELECT COALESCE(MAX(id) + 1, 0) FROM {}", self.table),
            [],
            |r| r.get(0),
        )?;
        tx.execute(
            &format!(
                "INSERT INTO {} (id, num_nodes, num_edges, node_features, edge_features, x, edge_index, edge_attr)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                self.table
            ),
            params![
                index,
                row.x.rows as i64,
                row.edge_attr.rows as i64,
                row.x.cols as i64,
                row.edge_attr.cols as i64,
                f64_blob(&row.x.data),
                i64_blob(&row.edge_index.data),
                f64_blob(&row.edge_attr.data),
            ],
        )?;
        tx.commit()?;

        debug!(
            table = %self.table,
            index,
            nodes = row.num_nodes(),
            edges = row.num_edges(),
            "appended row"
        );
        Ok(dim(index))
    }

    /// Append records in submission order, stopping at the first store failure.
    pub fn append_all<I>(&mut self, records: I) -> Result<Vec<usize>, StoreError>
    where
        I: IntoIterator<Item = GraphRecord>,
    {
        records
            .into_iter()
            .map(|record| self.append(&record))
            .collect()
    }

    fn select(&self) -> String {
        format!(
            "SELECT num_nodes, num_edges, node_features, edge_features, x, edge_index, edge_attr FROM {}",
            self.table
        )
    }

    /// Stored matrices of row `index`.
    pub fn get(&self, index: usize) -> Result<DatasetRow, StoreError> {
        let raw = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", self.select()),
                [index as i64],
                RawRow::read,
            )
            .optional()?;
        match raw {
            Some(raw) => raw
                .decode()
                .map_err(|source| StoreError::Decode { index, source }),
            None => Err(StoreError::RowNotFound {
                index,
                len: self.len()?,
            }),
        }
    }

    /// Row `index` decoded into a graph record.
    pub fn get_record(&self, index: usize) -> Result<GraphRecord, StoreError> {
        self.get(index)?
            .to_record()
            .map_err(|source| StoreError::Decode { index, source })
    }

    /// Visit every row in index order. Rows whose blobs do not match their
    /// shapes are handed over as errors rather than aborting the scan.
    pub fn for_each_row<F>(&self, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(usize, Result<DatasetRow, DecodeError>),
    {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, num_nodes, num_edges, node_features, edge_features, x, edge_index, edge_attr
             FROM {} ORDER BY id",
            self.table
        ))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let raw = RawRow {
                num_nodes: row.get(1)?,
                num_edges: row.get(2)?,
                node_features: row.get(3)?,
                edge_features: row.get(4)?,
                x: row.get(5)?,
                edge_index: row.get(6)?,
                edge_attr: row.get(7)?,
            };
            visit(dim(id), raw.decode());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{EdgeType, NodeType, PhaseType};

    fn record(nodes: usize) -> GraphRecord {
        let nodes: Vec<_> = (0..nodes)
            .map(|i| NodeObject {
                node_type: if i == 0 { NodeType::Source } else { NodeType::Load },
                active_demand_kw: 0.1 * i as f64,
                reactive_demand_kvar: 1.0 / 3.0,
                active_generation_kw: 0.0,
                reactive_generation_kvar: 0.0,
                num_nodes: 3,
                phase_type: PhaseType::from_label("ABC").unwrap(),
                kv_level: 7.199_557_856_794_634,
            })
            .collect();
        let edge_index: Vec<_> = (1..nodes.len()).map(|i| (i - 1, i)).collect();
        let edges = edge_index
            .iter()
            .map(|_| EdgeObject {
                num_phase: 3,
                capacity_kva: 4988.0,
                edge_type: EdgeType::Line,
                length_miles: std::f64::consts::PI,
                r0: 0.0,
                r1: 1e-9,
                x0: 0.0,
                x1: 2.5,
            })
            .collect();
        GraphRecord {
            nodes,
            edge_index,
            edges,
        }
    }

    #[test]
    fn rows_read_back_bit_exact_in_order() {
        let mut dataset = Dataset::in_memory(DEFAULT_TABLE).unwrap();
        let written: Vec<_> = (1..=4).map(record).collect();
        let indices = dataset.append_all(written.clone()).unwrap();

        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(dataset.len().unwrap(), 4);
        for (i, expected) in written.iter().enumerate() {
            assert_eq!(dataset.get(i).unwrap(), DatasetRow::from_record(expected));
            assert_eq!(&dataset.get_record(i).unwrap(), expected);
        }
    }

    #[test]
    fn edge_index_uses_coo_layout() {
        let row = DatasetRow::from_record(&record(3));
        assert_eq!(row.edge_index.rows, 2);
        assert_eq!(row.edge_index.data, vec![0, 1, 1, 2]);
        assert_eq!(row.x.cols, NODE_FEATURE_COUNT);
    }

    #[test]
    fn missing_row_is_an_error() {
        let mut dataset = Dataset::in_memory(DEFAULT_TABLE).unwrap();
        dataset.append(&record(2)).unwrap();
        assert!(matches!(
            dataset.get(5),
            Err(StoreError::RowNotFound { index: 5, len: 1 })
        ));
    }

    #[test]
    fn reopening_continues_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.sqlite");

        let mut first = Dataset::create_or_open(&path, "graphs").unwrap();
        first.append(&record(2)).unwrap();
        first.append(&record(3)).unwrap();
        drop(first);

        let mut second = Dataset::create_or_open(&path, "graphs").unwrap();
        assert_eq!(second.append(&record(4)).unwrap(), 2);
        drop(second);

        let reader = Dataset::open_read_only(&path, "graphs").unwrap();
        assert_eq!(reader.len().unwrap(), 3);
        assert_eq!(reader.get_record(2).unwrap(), record(4));
    }

    #[test]
    fn read_only_open_requires_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.sqlite");
        Dataset::create_or_open(&path, "graphs").unwrap();

        assert!(matches!(
            Dataset::open_read_only(&path, "other"),
            Err(StoreError::MissingTable(_))
        ));
        assert!(Dataset::open_read_only(&dir.path().join("absent.sqlite"), "graphs").is_err());
    }

    #[test]
    fn table_names_are_restricted() {
        assert!(matches!(
            Dataset::in_memory("data; DROP TABLE x"),
            Err(StoreError::InvalidTableName(_))
        ));
        assert!(Dataset::in_memory("_graphs_2").is_ok());
    }

    #[test]
    fn corrupted_blob_is_reported_per_row() {
        let mut dataset = Dataset::in_memory(DEFAULT_TABLE).unwrap();
        dataset.append(&record(2)).unwrap();
        dataset.append(&record(3)).unwrap();
        dataset
            .conn
            .execute(
                "UPDATE data_table SET x = zeroblob(3) WHERE id = 0",
                [],
            )
            .unwrap();

        let mut outcomes = Vec::new();
        dataset
            .for_each_row(|i, row| outcomes.push((i, row.is_ok())))
            .unwrap();
        assert_eq!(outcomes, vec![(0, false), (1, true)]);
    }

    #[test]
    fn oversized_shape_is_a_decode_error() {
        let mut dataset = Dataset::in_memory(DEFAULT_TABLE).unwrap();
        dataset.append(&record(2)).unwrap();
        dataset.append(&record(3)).unwrap();
        dataset
            .conn
            .execute(
                "UPDATE data_table SET num_nodes = ?1 WHERE id = 0",
                [1i64 << 62],
            )
            .unwrap();

        let mut outcomes = Vec::new();
        dataset
            .for_each_row(|i, row| outcomes.push((i, row.err())))
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(
            outcomes[0],
            (0, Some(DecodeError::Shape { matrix: "x", .. }))
        ));
        assert_eq!(outcomes[1], (1, None));
        assert!(matches!(
            dataset.get(0),
            Err(StoreError::Decode { index: 0, .. })
        ));
    }

    #[test]
    fn metadata_is_recorded() {
        let dataset = Dataset::in_memory(DEFAULT_TABLE).unwrap();
        let info = dataset.info().unwrap();
        assert_eq!(info.encoding_version, ENCODING_VERSION);
        assert_eq!(info.rows, 0);
        assert!(info.node_features.starts_with("node_type,"));
        assert!(dataset.is_empty().unwrap());
    }
}
