use std::fs;
use std::path::Path;

use approx::assert_relative_eq;
use grid_graph_dataset::db::{DEFAULT_TABLE, Dataset};
use grid_graph_dataset::encoding::{EdgeType, NodeType};
use grid_graph_dataset::extract::{
    self, GenerateOptions, ModelFile, ModelInput, find_model_files, generate_into,
};
use grid_graph_dataset::graph::SQRT_3;
use grid_graph_dataset::sampling::Sampling;
use grid_graph_dataset::stats;

fn three_bus_json(load_kw: f64, to_bus: &str) -> String {
    format!(
        r#"{{
            "buses": [
                {{"name": "src", "phases": ["A", "B", "C"], "nominal_voltage_kv": 7.2}},
                {{"name": "load", "phases": ["A", "B", "C"], "nominal_voltage_kv": 7.2}},
                {{"name": "lv", "phases": ["A", "B", "C"], "nominal_voltage_kv": 0.24}}
            ],
            "sources": [{{"name": "vsource", "bus": "src"}}],
            "loads": [{{"name": "ld1", "bus": "load", "active_kw": {load_kw}, "reactive_kvar": 30.0}}],
            "lines": [{{
                "name": "ln1", "from_bus": "src", "to_bus": "load",
                "phases": ["A", "B", "C"], "length_miles": 2.0, "ampacity_a": 400.0,
                "impedance": {{"r0": 0.5, "r1": 0.25, "x0": 1.0, "x1": 0.5}}
            }}],
            "transformers": [{{
                "name": "tx1", "from_bus": "load", "to_bus": "{to_bus}",
                "num_phases": 3, "rated_kva": 500.0, "r_percent": 1.2, "xhl_percent": 4.5
            }}]
        }}"#
    )
}

const MASTER: &str = r#"
Clear
New Circuit.feeder basekv=12.47 bus1=SourceBus pu=1.0 phases=3
New Linecode.lc3 nphases=3 r1=0.3 x1=0.6 r0=0.9 x0=1.8 units=mi normamps=300
New Line.l1 bus1=sourcebus bus2=n1 linecode=lc3 length=0.5 units=mi
New Transformer.t1 phases=1 windings=2
~ wdg=1 bus=n1.1 kv=7.2 kva=25 %r=0.6
~ wdg=2 bus=lv1.1 kv=0.24 kva=25 %r=0.6
~ xhl=2.04
New Load.ld1 bus1=lv1.1 phases=1 kv=0.24 kw=5 kvar=1.5
Solve
"#;

fn write(dir: &Path, name: &str, content: &str) {
    if let Some(parent) = dir.join(name).parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(dir.join(name), content).unwrap();
}

#[test]
fn three_bus_model_becomes_one_row() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "models/feeder.json", &three_bus_json(100.0, "lv"));
    let db = dir.path().join("dataset.sqlite");

    let summary = extract::generate_dataset(
        &ModelInput::SearchPath(dir.path().join("models")),
        &db,
        &GenerateOptions::default(),
    )
    .unwrap();
    assert_eq!(summary.written_rows, 1);
    assert_eq!(summary.rejected, 0);

    let dataset = Dataset::open_read_only(&db, DEFAULT_TABLE).unwrap();
    let record = dataset.get_record(0).unwrap();
    let types: Vec<_> = record.nodes.iter().map(|n| n.node_type).collect();
    assert_eq!(
        types,
        vec![NodeType::Source, NodeType::Load, NodeType::Junction]
    );
    assert_eq!(record.edge_index, vec![(0, 1), (1, 2)]);
    assert_eq!(record.edges[0].edge_type, EdgeType::Line);
    assert_eq!(record.edges[1].edge_type, EdgeType::Transformer);
    assert_relative_eq!(record.edges[0].capacity_kva, 400.0 * 7.2 * SQRT_3);
}

#[test]
fn rejected_model_does_not_disturb_the_others() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a_good.json", &three_bus_json(100.0, "lv"));
    write(dir.path(), "b_dangling.json", &three_bus_json(100.0, "nowhere"));
    write(dir.path(), "c_good.json", &three_bus_json(200.0, "lv"));
    let db = dir.path().join("dataset.sqlite");

    let summary = extract::generate_dataset(
        &ModelInput::SearchPath(dir.path().to_path_buf()),
        &db,
        &GenerateOptions::default(),
    )
    .unwrap();
    assert_eq!(summary.discovered, 3);
    assert_eq!(summary.written_rows, 2);
    assert_eq!(summary.rejected, 1);
    assert!(summary.failures[0].path.ends_with("b_dangling.json"));

    let dataset = Dataset::open_read_only(&db, DEFAULT_TABLE).unwrap();
    assert_eq!(dataset.len().unwrap(), 2);
    assert_eq!(dataset.get_record(1).unwrap().nodes[1].active_demand_kw, 200.0);
}

#[test]
fn rows_come_back_in_write_order() {
    let dir = tempfile::tempdir().unwrap();
    for (i, kw) in [10.0, 20.0, 30.0, 40.0].iter().enumerate() {
        write(dir.path(), &format!("m{i}.json"), &three_bus_json(*kw, "lv"));
    }
    let files = find_model_files(dir.path(), "Master.dss").unwrap();

    let mut dataset = Dataset::in_memory(DEFAULT_TABLE).unwrap();
    let summary = generate_into(&mut dataset, &files, Sampling::Whole).unwrap();
    assert_eq!(summary.written_rows, 4);

    for (i, kw) in [10.0, 20.0, 30.0, 40.0].iter().enumerate() {
        let record = dataset.get_record(i).unwrap();
        assert_eq!(record.nodes[1].active_demand_kw, *kw);
    }
}

#[test]
fn stats_do_not_depend_on_row_order() {
    let dir = tempfile::tempdir().unwrap();
    for (i, kw) in [1.5, 1e12, 0.1, 7.25].iter().enumerate() {
        write(dir.path(), &format!("m{i}.json"), &three_bus_json(*kw, "lv"));
    }
    let files = find_model_files(dir.path(), "Master.dss").unwrap();
    let reversed: Vec<ModelFile> = files.iter().rev().cloned().collect();

    let mut forward = Dataset::in_memory(DEFAULT_TABLE).unwrap();
    generate_into(&mut forward, &files, Sampling::Whole).unwrap();
    let mut backward = Dataset::in_memory(DEFAULT_TABLE).unwrap();
    generate_into(&mut backward, &reversed, Sampling::Whole).unwrap();

    let a = stats::analyze_dataset(&forward).unwrap();
    let b = stats::analyze_dataset(&backward).unwrap();
    assert_eq!(a.rows_read, 4);
    assert_eq!(a, b);
}

#[test]
fn opendss_master_matches_json_topology() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "feeder1/Master.dss", MASTER);
    write(
        dir.path(),
        "feeder2/system.json",
        r#"{
            "buses": [
                {"name": "sourcebus", "phases": ["A", "B", "C"], "nominal_voltage_kv": 7.2},
                {"name": "n1", "phases": ["A", "B", "C"], "nominal_voltage_kv": 7.2},
                {"name": "lv1", "phases": ["A"], "nominal_voltage_kv": 0.24}
            ],
            "sources": [{"name": "source", "bus": "sourcebus"}],
            "loads": [{"name": "ld1", "bus": "lv1", "active_kw": 5.0, "reactive_kvar": 1.5}],
            "lines": [{
                "name": "l1", "from_bus": "sourcebus", "to_bus": "n1",
                "phases": ["A", "B", "C"], "length_miles": 0.5, "ampacity_a": 300.0
            }],
            "transformers": [{
                "name": "t1", "from_bus": "n1", "to_bus": "lv1",
                "num_phases": 1, "rated_kva": 25.0, "r_percent": 0.6, "xhl_percent": 2.04
            }]
        }"#,
    );

    let files = find_model_files(dir.path(), "Master.dss").unwrap();
    let mut dataset = Dataset::in_memory(DEFAULT_TABLE).unwrap();
    let summary = generate_into(&mut dataset, &files, Sampling::Whole).unwrap();
    assert_eq!(summary.written_rows, 2);

    let dss = dataset.get_record(0).unwrap();
    let json = dataset.get_record(1).unwrap();
    let node_types = |r: &grid_graph_dataset::GraphRecord| {
        r.nodes.iter().map(|n| n.node_type).collect::<Vec<_>>()
    };
    assert_eq!(node_types(&dss), node_types(&json));
    assert_eq!(dss.edge_index, json.edge_index);
    for (a, b) in dss.edges.iter().zip(&json.edges) {
        assert_eq!(a.edge_type, b.edge_type);
        assert_eq!(a.num_phase, b.num_phase);
        assert_relative_eq!(a.length_miles, b.length_miles);
    }
    assert_eq!(dss.nodes[2].phase_type.label(), "A");
    assert_relative_eq!(dss.edges[1].capacity_kva, 25.0);
}

#[test]
fn transformer_sampling_writes_service_areas() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "feeder1/Master.dss", MASTER);
    let db = dir.path().join("dataset.sqlite");

    let options = GenerateOptions {
        sampling: Sampling::Transformer,
        ..Default::default()
    };
    let summary =
        extract::generate_dataset(&ModelInput::SearchPath(dir.path().to_path_buf()), &db, &options)
            .unwrap();
    assert_eq!(summary.written_rows, 1);

    let record = Dataset::open_read_only(&db, DEFAULT_TABLE)
        .unwrap()
        .get_record(0)
        .unwrap();
    assert_eq!(record.node_count(), 2);
    assert_eq!(record.nodes[0].node_type, NodeType::Source);
    assert_eq!(record.nodes[1].node_type, NodeType::Load);
    assert_eq!(record.edge_index, vec![(0, 1)]);
    assert_eq!(record.edges[0].edge_type, EdgeType::Transformer);
}

#[test]
fn stats_report_is_written_as_csv() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "feeder.json", &three_bus_json(100.0, "lv"));
    let db = dir.path().join("dataset.sqlite");
    extract::generate_dataset(
        &ModelInput::SystemFile(dir.path().join("feeder.json")),
        &db,
        &GenerateOptions::default(),
    )
    .unwrap();

    let report = stats::analyze_dataset(&Dataset::open_read_only(&db, DEFAULT_TABLE).unwrap())
        .unwrap();
    let out = dir.path().join("dataset_stats.csv");
    report.write_csv(&out).unwrap();

    let mut reader = csv::Reader::from_path(&out).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(&headers[0], "entity");
    assert_eq!(&headers[1], "field");
    let rows: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), report.fields.len());

    let node_type = rows
        .iter()
        .find(|r| &r[0] == "node" && &r[1] == "node_type")
        .unwrap();
    assert_eq!(&node_type[9], "SOURCE:1;LOAD:1;JUNCTION:1");
}

#[test]
fn empty_search_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = extract::generate_dataset(
        &ModelInput::SearchPath(dir.path().to_path_buf()),
        &dir.path().join("dataset.sqlite"),
        &GenerateOptions::default(),
    );
    assert!(result.is_err());
}

#[test]
fn table_name_is_honoured() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "feeder.json", &three_bus_json(100.0, "lv"));
    let db = dir.path().join("dataset.sqlite");
    let options = GenerateOptions {
        table_name: "train_graphs".to_string(),
        ..Default::default()
    };
    extract::generate_dataset(&ModelInput::SystemFile(dir.path().join("feeder.json")), &db, &options)
        .unwrap();

    assert!(Dataset::open_read_only(&db, DEFAULT_TABLE).is_err());
    let info = Dataset::open_read_only(&db, "train_graphs").unwrap().info().unwrap();
    assert_eq!(info.rows, 1);
}

#[test]
fn stats_skip_rows_with_corrupted_shapes() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.json", &three_bus_json(100.0, "lv"));
    write(dir.path(), "b.json", &three_bus_json(200.0, "lv"));
    let db = dir.path().join("dataset.sqlite");
    extract::generate_dataset(
        &ModelInput::SearchPath(dir.path().to_path_buf()),
        &db,
        &GenerateOptions::default(),
    )
    .unwrap();

    let conn = rusqlite::Connection::open(&db).unwrap();
    conn.execute(
        "UPDATE data_table SET num_nodes = ?1 WHERE id = 0",
        [1i64 << 62],
    )
    .unwrap();
    drop(conn);

    let report = stats::analyze_dataset(&Dataset::open_read_only(&db, DEFAULT_TABLE).unwrap())
        .unwrap();
    assert_eq!(report.rows_read, 1);
    assert_eq!(report.rows_skipped, 1);
}
