//! Grid graph dataset generator
//!
//! Builds graph training datasets from distribution feeder models.

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgGroup, Parser, Subcommand};
use tracing_subscriber::FmtSubscriber;

use grid_graph_dataset::db::{DEFAULT_TABLE, Dataset};
use grid_graph_dataset::extract::{self, DEFAULT_MASTER_FILE, GenerateOptions, ModelInput};
use grid_graph_dataset::sampling::Sampling;
use grid_graph_dataset::stats;

#[derive(Parser)]
#[command(name = "grid-dataset")]
#[command(about = "Graph training datasets from distribution feeder models")]
struct Cli {
    /// Set the logging level
    #[arg(long, default_value = "info", global = true)]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert every feeder model found into dataset rows
    #[command(group(ArgGroup::new("input").required(true).args(["search_path", "system_file"])))]
    GenerateDataset {
        /// Parent folder to search for master files and JSON systems
        #[arg(short = 'f', long)]
        search_path: Option<PathBuf>,

        /// Single system definition file (JSON or OpenDSS master)
        #[arg(short = 'y', long)]
        system_file: Option<PathBuf>,

        /// SQLite file for the dataset
        #[arg(short, long, default_value = "dataset.sqlite")]
        sqlite_file: PathBuf,

        /// Table name storing the rows
        #[arg(short, long, default_value = DEFAULT_TABLE)]
        table_name: String,

        /// Name of the OpenDSS master file to search for
        #[arg(short, long, default_value = DEFAULT_MASTER_FILE)]
        master_file: String,

        /// Rows per model: "whole" or "transformer"
        #[arg(long, default_value = "whole")]
        sampling: Sampling,
    },

    /// Write per-field statistics of a dataset to CSV
    GenerateStats {
        /// Path to the dataset SQLite file
        #[arg(short, long)]
        file_path: PathBuf,

        /// CSV file for the report
        #[arg(short, long, default_value = "dataset_stats.csv")]
        out_path: PathBuf,

        /// Table name storing the rows
        #[arg(short, long, default_value = DEFAULT_TABLE)]
        table_name: String,
    },

    /// Show row count and encoding of a dataset
    Info {
        /// Path to the dataset SQLite file
        #[arg(short, long)]
        file_path: PathBuf,

        /// Table name storing the rows
        #[arg(short, long, default_value = DEFAULT_TABLE)]
        table_name: String,
    },

    /// Print the nodes and edges of one row
    ShowRow {
        /// Row index
        index: usize,

        /// Path to the dataset SQLite file
        #[arg(short, long)]
        file_path: PathBuf,

        /// Table name storing the rows
        #[arg(short, long, default_value = DEFAULT_TABLE)]
        table_name: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::GenerateDataset {
            search_path,
            system_file,
            sqlite_file,
            table_name,
            master_file,
            sampling,
        } => {
            let input = match (search_path, system_file) {
                (Some(dir), _) => ModelInput::SearchPath(dir),
                (None, Some(file)) => ModelInput::SystemFile(file),
                (None, None) => anyhow::bail!("Either --search-path or --system-file is required"),
            };
            let options = GenerateOptions {
                table_name,
                master_file,
                sampling,
            };

            let summary = extract::generate_dataset(&input, &sqlite_file, &options)?;
            if !summary.failures.is_empty() {
                println!("Skipped models:");
                for failure in &summary.failures {
                    println!(
                        "  {} [{:?}]: {}",
                        failure.path.display(),
                        failure.kind,
                        failure.message
                    );
                }
            }
            println!("\n{}", summary);
            println!("Dataset written to: {}", sqlite_file.display());
        }

        Commands::GenerateStats {
            file_path,
            out_path,
            table_name,
        } => {
            let dataset = Dataset::open_read_only(&file_path, &table_name)?;
            let report = stats::analyze_dataset(&dataset)?;
            report.write_csv(&out_path)?;
            println!("{}", report);
            println!("Stats written to: {}", out_path.display());
        }

        Commands::Info {
            file_path,
            table_name,
        } => {
            let info = Dataset::open_read_only(&file_path, &table_name)?.info()?;
            println!("Table:            {}", info.table);
            println!("Rows:             {}", info.rows);
            println!("Encoding version: {}", info.encoding_version);
            println!("Node features:    {}", info.node_features);
            println!("Edge features:    {}", info.edge_features);
        }

        Commands::ShowRow {
            index,
            file_path,
            table_name,
        } => {
            let dataset = Dataset::open_read_only(&file_path, &table_name)?;
            let record = dataset.get_record(index)?;

            println!(
                "Row {} ({} nodes, {} edges)\n",
                index,
                record.node_count(),
                record.edge_count()
            );
            println!(
                "{:>5} {:<20} {:>6} {:>10} {:>10} {:>10} {:>10} {:>8}",
                "Node", "Type", "Phases", "P (kW)", "Q (kVAR)", "Gen (kW)", "Gen (kVAR)", "kV"
            );
            println!("{}", "-".repeat(84));
            for (i, n) in record.nodes.iter().enumerate() {
                println!(
                    "{:>5} {:<20} {:>6} {:>10.2} {:>10.2} {:>10.2} {:>10.2} {:>8.3}",
                    i,
                    n.node_type.label(),
                    n.phase_type.label(),
                    n.active_demand_kw,
                    n.reactive_demand_kvar,
                    n.active_generation_kw,
                    n.reactive_generation_kvar,
                    n.kv_level
                );
            }

            if record.edge_count() > 0 {
                println!(
                    "\n{:>5} {:>5} {:<12} {:>3} {:>10} {:>8} {:>8} {:>8} {:>8} {:>8}",
                    "From", "To", "Type", "Ph", "kVA", "Miles", "r0", "r1", "x0", "x1"
                );
                println!("{}", "-".repeat(84));
                for (&(from, to), e) in record.edge_index.iter().zip(&record.edges) {
                    println!(
                        "{:>5} {:>5} {:<12} {:>3} {:>10.1} {:>8.3} {:>8.4} {:>8.4} {:>8.4} {:>8.4}",
                        from,
                        to,
                        e.edge_type.label(),
                        e.num_phase,
                        e.capacity_kva,
                        e.length_miles,
                        e.r0,
                        e.r1,
                        e.x0,
                        e.x1
                    );
                }
            }
        }
    }

    Ok(())
}
