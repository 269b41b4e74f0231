//! Dataset generation: find feeder models, convert them, append them to the store
//!
//! Models are handled one at a time. A file that cannot be read or a model
//! that fails its integrity checks is logged, counted and skipped; a store
//! failure ends the run with every earlier row intact.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::db::{DEFAULT_TABLE, Dataset};
use crate::dss;
use crate::graph::build_graph;
use crate::models::GridModel;
use crate::sampling::Sampling;

pub const DEFAULT_MASTER_FILE: &str = "Master.dss";

/// Settings for one generation run
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub table_name: String,
    /// File name that marks an OpenDSS model directory
    pub master_file: String,
    pub sampling: Sampling,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        GenerateOptions {
            table_name: DEFAULT_TABLE.to_string(),
            master_file: DEFAULT_MASTER_FILE.to_string(),
            sampling: Sampling::Whole,
        }
    }
}

/// Where models come from
#[derive(Debug, Clone)]
pub enum ModelInput {
    /// Directory searched recursively
    SearchPath(PathBuf),
    /// One system definition file
    SystemFile(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    Json,
    OpenDss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFile {
    pub path: PathBuf,
    pub format: ModelFormat,
}

impl ModelFile {
    /// Classify a file by extension: `.json` is a grid-data-model system, anything else a master script.
    pub fn from_path(path: &Path) -> Self {
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        ModelFile {
            path: path.to_path_buf(),
            format: if is_json {
                ModelFormat::Json
            } else {
                ModelFormat::OpenDss
            },
        }
    }

    pub fn load(&self) -> Result<GridModel> {
        match self.format {
            ModelFormat::Json => GridModel::from_json_file(&self.path),
            ModelFormat::OpenDss => dss::read_master(&self.path)
                .with_context(|| format!("Failed to read OpenDSS model {}", self.path.display())),
        }
    }
}

/// Find every master script and JSON system file below `search_dir`, in file name order
pub fn find_model_files(search_dir: &Path, master_file: &str) -> Result<Vec<ModelFile>> {
    if !search_dir.is_dir() {
        bail!("Search path {} is not a directory", search_dir.display());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(search_dir)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let is_master = filename.eq_ignore_ascii_case(master_file);
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_master || is_json {
            files.push(ModelFile::from_path(path));
        }
    }

    Ok(files)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// File could not be read or parsed as a model
    Unreadable,
    /// Model parsed but failed integrity checks or sampling
    Rejected,
}

#[derive(Debug, Clone)]
pub struct ModelFailure {
    pub path: PathBuf,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct GenerateSummary {
    pub discovered: usize,
    pub written_models: usize,
    pub written_rows: usize,
    pub skipped_invalid: usize,
    pub rejected: usize,
    /// Models that converted fine but yielded no rows under the sampling mode
    pub empty: usize,
    pub failures: Vec<ModelFailure>,
}

impl GenerateSummary {
    fn fail(&mut self, file: &ModelFile, kind: FailureKind, message: String) {
        match kind {
            FailureKind::Unreadable => self.skipped_invalid += 1,
            FailureKind::Rejected => self.rejected += 1,
        }
        warn!(path = %file.path.display(), "{}", message);
        self.failures.push(ModelFailure {
            path: file.path.clone(),
            kind,
            message,
        });
    }
}

impl fmt::Display for GenerateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Wrote {} rows from {} models ({} files found). Skipped: {}, Rejected: {}, Empty: {}",
            self.written_rows,
            self.written_models,
            self.discovered,
            self.skipped_invalid,
            self.rejected,
            self.empty
        )
    }
}

/// Convert each model file and append its rows to `dataset`, in file order.
pub fn generate_into(
    dataset: &mut Dataset,
    files: &[ModelFile],
    sampling: Sampling,
) -> Result<GenerateSummary> {
    let mut summary = GenerateSummary {
        discovered: files.len(),
        ..Default::default()
    };

    for file in files {
        let model = match file.load() {
            Ok(model) => model,
            Err(e) => {
                summary.fail(file, FailureKind::Unreadable, format!("{:#}", e));
                continue;
            }
        };

        let record = match build_graph(&model) {
            Ok(record) => record,
            Err(e) => {
                summary.fail(file, FailureKind::Rejected, e.to_string());
                continue;
            }
        };

        let records = match sampling.apply(record) {
            Ok(records) => records,
            Err(e) => {
                summary.fail(file, FailureKind::Rejected, e.to_string());
                continue;
            }
        };
        if records.is_empty() {
            info!(path = %file.path.display(), %sampling, "Model produced no rows");
            summary.empty += 1;
            continue;
        }

        let count = records.len();
        let indices = dataset
            .append_all(records)
            .with_context(|| format!("Failed to write rows for {}", file.path.display()))?;

        summary.written_models += 1;
        summary.written_rows += count;
        info!(
            "  Converted: {} ({} rows, first index {})",
            file.path.display(),
            count,
            indices.first().copied().unwrap_or_default()
        );
    }

    Ok(summary)
}

/// Full run: discover models, open or create the dataset, and write every valid model.
///
/// Fails when no model files are found or none of them produced a row.
pub fn generate_dataset(
    input: &ModelInput,
    sqlite_file: &Path,
    options: &GenerateOptions,
) -> Result<GenerateSummary> {
    let files = match input {
        ModelInput::SearchPath(dir) => {
            info!("Scanning {} for grid models...", dir.display());
            find_model_files(dir, &options.master_file)?
        }
        ModelInput::SystemFile(path) => {
            if !path.is_file() {
                bail!("System file {} does not exist", path.display());
            }
            vec![ModelFile::from_path(path)]
        }
    };
    if files.is_empty() {
        bail!("No grid model files found");
    }
    info!("Found {} candidate model files", files.len());

    let mut dataset = Dataset::create_or_open(sqlite_file, &options.table_name)
        .with_context(|| format!("Failed to open dataset {}", sqlite_file.display()))?;
    let summary = generate_into(&mut dataset, &files, options.sampling)?;

    if summary.written_rows == 0 {
        bail!(
            "No valid grid models among {} candidates ({} unreadable, {} rejected)",
            summary.discovered,
            summary.skipped_invalid,
            summary.rejected
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn discovery_matches_master_files_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let feeder = dir.path().join("region").join("feeder1");
        fs::create_dir_all(&feeder).unwrap();
        fs::write(feeder.join("master.DSS"), "").unwrap();
        fs::write(feeder.join("Lines.dss"), "").unwrap();
        fs::write(dir.path().join("system.json"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let files = find_model_files(dir.path(), DEFAULT_MASTER_FILE).unwrap();
        let formats: Vec<_> = files.iter().map(|f| f.format).collect();
        assert_eq!(formats, vec![ModelFormat::OpenDss, ModelFormat::Json]);
        assert!(files[0].path.ends_with("region/feeder1/master.DSS"));
    }

    #[test]
    fn discovery_requires_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_model_files(&dir.path().join("missing"), DEFAULT_MASTER_FILE).is_err());
    }

    #[test]
    fn unreadable_files_are_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        fs::write(&bad, "not json").unwrap();

        let mut dataset = Dataset::in_memory(DEFAULT_TABLE).unwrap();
        let summary =
            generate_into(&mut dataset, &[ModelFile::from_path(&bad)], Sampling::Whole).unwrap();
        assert_eq!(summary.skipped_invalid, 1);
        assert_eq!(summary.failures[0].kind, FailureKind::Unreadable);
        assert_eq!(dataset.len().unwrap(), 0);
    }
}
