use std::path::PathBuf;
use std::sync::Mutex;

use fpl_graph::config::{LoadSettings, StoreConfig};
use fpl_graph::error::LoadError;
use fpl_graph::extract::KeyPolicy;
use fpl_graph::gateway::{GatewayError, GraphGateway, UpsertRequest};
use fpl_graph::graph_store::{SqliteGraphStore, with_store};
use fpl_graph::loader::{LoadPlan, Loader, Phase};
use fpl_graph::retry::RetryPolicy;
use fpl_graph::schema::{EntityKind, KeyValue, NodeKey, RelationKind, SOURCE_COLUMNS};
use fpl_graph::table::{FieldValue, RowTable, read_csv_from, read_table};

type FailRule = Box<dyn Fn(&str, usize) -> Option<GatewayError> + Send + Sync>;

/// Records every upsert call; `fail` sees the target name and the 1-based
/// call number for that target.
struct RecordingGateway {
    calls: Mutex<Vec<(&'static str, usize)>>,
    fail: FailRule,
}

impl RecordingGateway {
    fn new() -> Self {
        Self::failing(|_, _| None)
    }

    fn failing(fail: impl Fn(&str, usize) -> Option<GatewayError> + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: Box::new(fail),
        }
    }

    fn calls(&self) -> Vec<(&'static str, usize)> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_to(&self, name: &str) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, len)| len)
            .collect()
    }
}

impl GraphGateway for RecordingGateway {
    fn upsert(&self, request: UpsertRequest<'_>) -> Result<usize, GatewayError> {
        let nth = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((request.name(), request.len()));
            calls.iter().filter(|(n, _)| *n == request.name()).count()
        };
        if let Some(err) = (self.fail)(request.name(), nth) {
            return Err(err);
        }
        Ok(request.len())
    }

    fn reset(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

fn csv_row(fixture: u32, name: &str, element: u32, minutes: u32, goals: u32) -> String {
    format!(
        "20/21,1,{fixture},2020-09-12T11:30:00Z,A,B,{name},{element},MID,{minutes},{goals},0,2,0,0,0,0,0,0,0,0,0,10,1.0,2.0,3.0,0.6,0.0"
    )
}

fn table(lines: &[String]) -> RowTable {
    let mut raw = SOURCE_COLUMNS.join(",");
    raw.push('\n');
    for line in lines {
        raw.push_str(line);
        raw.push('\n');
    }
    read_csv_from(raw.as_bytes()).expect("generated csv should parse")
}

fn scenario_table() -> RowTable {
    table(&[csv_row(101, "X", 7, 90, 1), csv_row(101, "X", 7, 45, 0)])
}

fn settings() -> LoadSettings {
    LoadSettings {
        retry: RetryPolicy::no_delay(3),
        ..LoadSettings::default()
    }
}

fn player_x() -> NodeKey {
    NodeKey(vec![KeyValue::Text("X".to_string()), KeyValue::Int(7)])
}

fn fixture_101() -> NodeKey {
    NodeKey(vec![KeyValue::Text("20/21".to_string()), KeyValue::Int(101)])
}

fn graph_counts(store: &SqliteGraphStore) -> (Vec<usize>, Vec<usize>) {
    let nodes = EntityKind::ALL
        .iter()
        .map(|k| store.node_count(*k).unwrap())
        .collect();
    let edges = RelationKind::ALL
        .iter()
        .map(|k| store.edge_count(*k).unwrap())
        .collect();
    (nodes, edges)
}

#[test]
fn scenario_two_rows_same_appearance() {
    let store = SqliteGraphStore::open_in_memory().unwrap();
    let plan = LoadPlan::build(&scenario_table(), KeyPolicy::Strict).unwrap();
    let report = Loader::new(&store, settings()).run(&plan).expect("load succeeds");
    assert!(report.is_complete());

    let (nodes, edges) = graph_counts(&store);
    // Season, Gameweek, Fixture, Team, Player, Position
    assert_eq!(nodes, vec![1, 1, 1, 2, 1, 1]);
    // HAS_GW, HAS_FIXTURE, HAS_HOME_TEAM, HAS_AWAY_TEAM, PLAYS_AS, PLAYED_IN
    assert_eq!(edges, vec![1, 1, 1, 1, 1, 1]);

    let props = store
        .edge_properties(RelationKind::PlayedIn, &player_x(), &fixture_101())
        .unwrap()
        .expect("PLAYED_IN edge exists");
    assert_eq!(props.get("minutes"), Some(&FieldValue::Int(45)));
    assert_eq!(props.get("goals_scored"), Some(&FieldValue::Int(0)));

    let played_in = report.step("PLAYED_IN").unwrap();
    assert_eq!(played_in.records, 2);
    assert_eq!(played_in.calls, 1);
}

#[test]
fn second_run_leaves_counts_unchanged() {
    let store = SqliteGraphStore::open_in_memory().unwrap();
    let plan = LoadPlan::build(&scenario_table(), KeyPolicy::Strict).unwrap();
    let loader = Loader::new(&store, settings());

    loader.run(&plan).unwrap();
    let once = graph_counts(&store);
    loader.run(&plan).unwrap();
    assert_eq!(graph_counts(&store), once);
}

#[test]
fn superset_source_extends_graph_without_duplicates() {
    let store = SqliteGraphStore::open_in_memory().unwrap();
    let loader = Loader::new(&store, settings());
    let first = table(&[csv_row(101, "X", 7, 90, 1)]);
    loader
        .run(&LoadPlan::build(&first, KeyPolicy::Strict).unwrap())
        .unwrap();

    let superset = table(&[csv_row(101, "X", 7, 60, 2), csv_row(102, "Y", 9, 90, 0)]);
    loader
        .run(&LoadPlan::build(&superset, KeyPolicy::Strict).unwrap())
        .unwrap();

    assert_eq!(store.node_count(EntityKind::Player).unwrap(), 2);
    assert_eq!(store.node_count(EntityKind::Fixture).unwrap(), 2);
    assert_eq!(store.edge_count(RelationKind::PlayedIn).unwrap(), 2);
    let props = store
        .edge_properties(RelationKind::PlayedIn, &player_x(), &fixture_101())
        .unwrap()
        .unwrap();
    assert_eq!(props.get("minutes"), Some(&FieldValue::Int(60)));
    assert_eq!(props.get("goals_scored"), Some(&FieldValue::Int(2)));
}

#[test]
fn played_in_is_split_into_fixed_size_batches() {
    let lines = (1..=4500)
        .map(|i| csv_row(101, &format!("P{i}"), i, 90, 0))
        .collect::<Vec<_>>();
    let plan = LoadPlan::build(&table(&lines), KeyPolicy::Strict).unwrap();
    let gateway = RecordingGateway::new();
    let report = Loader::new(
        &gateway,
        LoadSettings {
            batch_size: 2000,
            ..settings()
        },
    )
    .run(&plan)
    .unwrap();

    assert_eq!(gateway.calls_to("PLAYED_IN"), vec![2000, 2000, 500]);
    let played_in = report.step("PLAYED_IN").unwrap();
    assert_eq!(played_in.affected, 4500);
    assert_eq!(played_in.calls, 3);
    assert_eq!(report.affected_in(Phase::Appearances), 4500);
}

#[test]
fn every_node_kind_is_written_before_any_relationship() {
    let plan = LoadPlan::build(&scenario_table(), KeyPolicy::Strict).unwrap();
    let gateway = RecordingGateway::new();
    Loader::new(&gateway, settings()).run(&plan).unwrap();

    let names = gateway.calls().into_iter().map(|(n, _)| n).collect::<Vec<_>>();
    let labels = EntityKind::ALL.map(|k| k.label());
    let last_node = names.iter().rposition(|n| labels.contains(n)).unwrap();
    let first_edge = names.iter().position(|n| !labels.contains(n)).unwrap();
    assert!(last_node < first_edge);
    assert_eq!(names.last(), Some(&"PLAYED_IN"));
    assert_eq!(names.len(), 12);
}

#[test]
fn failed_player_upsert_stops_before_relationships() {
    let plan = LoadPlan::build(&scenario_table(), KeyPolicy::Strict).unwrap();
    let gateway = RecordingGateway::failing(|name, _| {
        (name == "Player").then(|| GatewayError::Rejected("constraint violated".to_string()))
    });
    let failure = Loader::new(&gateway, settings()).run(&plan).unwrap_err();

    assert_eq!(failure.phase, Phase::Entities);
    assert_eq!(failure.step, "Player");
    assert!(matches!(failure.error, LoadError::Rejected { .. }));
    // Season, Gameweek, Fixture and two Teams went through first.
    assert_eq!(failure.applied, 5);
    assert!(failure.report.completed.is_empty());

    let names = gateway.calls().into_iter().map(|(n, _)| n).collect::<Vec<_>>();
    for rel in RelationKind::ALL {
        assert!(!names.contains(&rel.rel_type()), "{rel} ran after Player failed");
    }
    assert!(!names.contains(&"Position"));
}

#[test]
fn unavailable_store_is_retried_then_fatal() {
    let plan = LoadPlan::build(&scenario_table(), KeyPolicy::Strict).unwrap();
    let gateway = RecordingGateway::failing(|name, _| {
        (name == "HAS_FIXTURE").then(|| GatewayError::Unavailable("timed out".to_string()))
    });
    let failure = Loader::new(&gateway, settings()).run(&plan).unwrap_err();

    assert_eq!(failure.phase, Phase::Relationships);
    assert_eq!(failure.step, "HAS_FIXTURE");
    assert!(matches!(
        failure.error,
        LoadError::GatewayUnavailable { attempts: 3, .. }
    ));
    assert_eq!(gateway.calls_to("HAS_FIXTURE").len(), 3);
    assert!(gateway.calls_to("PLAYED_IN").is_empty());
    assert_eq!(failure.report.completed, vec![Phase::Entities]);
}

#[test]
fn transient_failure_recovers_within_retry_budget() {
    let plan = LoadPlan::build(&scenario_table(), KeyPolicy::Strict).unwrap();
    let gateway = RecordingGateway::failing(|name, nth| {
        (name == "Team" && nth < 3).then(|| GatewayError::Unavailable("busy".to_string()))
    });
    let report = Loader::new(&gateway, settings()).run(&plan).unwrap();

    assert_eq!(gateway.calls_to("Team"), vec![2, 2, 2]);
    assert_eq!(report.step("Team").unwrap().affected, 2);
    assert!(report.is_complete());
}

#[test]
fn batch_failure_reports_applied_records() {
    let lines = (1..=25)
        .map(|i| csv_row(101, &format!("P{i}"), i, 90, 0))
        .collect::<Vec<_>>();
    let plan = LoadPlan::build(&table(&lines), KeyPolicy::Strict).unwrap();
    let gateway = RecordingGateway::failing(|name, nth| {
        (name == "PLAYED_IN" && nth == 2).then(|| GatewayError::Rejected("payload".to_string()))
    });
    let failure = Loader::new(
        &gateway,
        LoadSettings {
            batch_size: 10,
            ..settings()
        },
    )
    .run(&plan)
    .unwrap_err();

    assert_eq!(failure.phase, Phase::Appearances);
    let played_in = failure.report.step("PLAYED_IN").unwrap();
    assert_eq!(played_in.affected, 10);
    assert_eq!(played_in.calls, 2);
    // 6 node kinds (two teams, 25 players) plus 5 structural types.
    let nodes = 1 + 1 + 1 + 2 + 25 + 1;
    let structural = 1 + 1 + 1 + 1 + 25;
    assert_eq!(failure.applied, nodes + structural + 10);
    assert_eq!(gateway.calls_to("PLAYED_IN"), vec![10, 10]);
}

#[test]
fn missing_endpoint_is_an_ordering_violation() {
    let store = SqliteGraphStore::open_in_memory().unwrap();
    let mut plan = LoadPlan::build(&scenario_table(), KeyPolicy::Strict).unwrap();
    plan.entities.retain(|(kind, _)| *kind != EntityKind::Team);

    let failure = Loader::new(&store, settings()).run(&plan).unwrap_err();
    assert_eq!(failure.phase, Phase::Relationships);
    assert_eq!(failure.step, "HAS_HOME_TEAM");
    assert!(matches!(failure.error, LoadError::OrderingViolation { .. }));
    assert_eq!(store.edge_count(RelationKind::HasHomeTeam).unwrap(), 0);
    assert_eq!(store.edge_count(RelationKind::PlayedIn).unwrap(), 0);
}

#[test]
fn parallel_load_matches_sequential_graph() {
    let mut lines = (1..=40)
        .map(|i| csv_row(100 + i % 4, &format!("P{i}"), i, 90, 0))
        .collect::<Vec<_>>();
    lines.push(csv_row(101, "P1", 1, 30, 3));
    let plan = LoadPlan::build(&table(&lines), KeyPolicy::Strict).unwrap();

    let sequential = SqliteGraphStore::open_in_memory().unwrap();
    Loader::new(
        &sequential,
        LoadSettings {
            batch_size: 7,
            ..settings()
        },
    )
    .run(&plan)
    .unwrap();

    let parallel = SqliteGraphStore::open_in_memory().unwrap();
    let report = Loader::new(
        &parallel,
        LoadSettings {
            batch_size: 7,
            workers: 4,
            ..settings()
        },
    )
    .run(&plan)
    .unwrap();

    assert!(report.is_complete());
    assert_eq!(graph_counts(&parallel), graph_counts(&sequential));
    assert_eq!(report.step("PLAYED_IN").unwrap().records, 40);

    let p1 = NodeKey(vec![KeyValue::Text("P1".to_string()), KeyValue::Int(1)]);
    for store in [&sequential, &parallel] {
        let props = store
            .edge_properties(RelationKind::PlayedIn, &p1, &fixture_101())
            .unwrap()
            .unwrap();
        assert_eq!(props.get("minutes"), Some(&FieldValue::Int(30)));
        assert_eq!(props.get("goals_scored"), Some(&FieldValue::Int(3)));
    }
}

#[test]
fn reset_clears_the_store() {
    let store = SqliteGraphStore::open_in_memory().unwrap();
    let plan = LoadPlan::build(&scenario_table(), KeyPolicy::Strict).unwrap();
    Loader::new(&store, settings()).run(&plan).unwrap();
    store.reset().unwrap();
    let (nodes, edges) = graph_counts(&store);
    assert!(nodes.iter().chain(&edges).all(|n| *n == 0));
}

fn fixture_path(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path
}

#[test]
fn sample_file_loads_expected_graph() {
    let table = read_table(&fixture_path("fpl_sample.csv")).unwrap();
    let plan = LoadPlan::build(&table, KeyPolicy::Strict).unwrap();
    let store = SqliteGraphStore::open_in_memory().unwrap();
    Loader::new(&store, settings()).run(&plan).unwrap();

    let (nodes, edges) = graph_counts(&store);
    assert_eq!(nodes, vec![2, 3, 4, 6, 4, 3]);
    assert_eq!(edges, vec![3, 4, 4, 4, 4, 6]);

    let white = NodeKey(vec![KeyValue::Text("Ben White".to_string()), KeyValue::Int(558)]);
    let props = store
        .node_properties(EntityKind::Player, &white)
        .unwrap()
        .expect("player stored");
    assert_eq!(props.get("player_element"), Some(&FieldValue::Int(558)));
}

#[test]
fn file_store_keeps_graph_between_connections() {
    let path = std::env::temp_dir().join(format!("fpl_graph_{}.sqlite", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let config = StoreConfig {
        uri: format!("sqlite://{}", path.display()),
        user: Some("neo4j".to_string()),
        password: Some("ignored".to_string()),
    };
    let plan = LoadPlan::build(&scenario_table(), KeyPolicy::Strict).unwrap();

    with_store(&config, |store| {
        Loader::new(store, settings()).run(&plan)?;
        Ok(())
    })
    .unwrap();
    let seasons = with_store(&config, |store| store.node_count(EntityKind::Season)).unwrap();
    assert_eq!(seasons, 1);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn bolt_uri_is_refused() {
    let config = StoreConfig {
        uri: "neo4j://localhost:7687".to_string(),
        user: None,
        password: None,
    };
    let err = with_store(&config, |_| Ok(())).unwrap_err();
    assert!(err.to_string().contains("neo4j"));
}

#[test]
fn non_finite_statistics_survive_the_load() {
    let line = csv_row(101, "X", 7, 90, 0).replace(",1.0,2.0,3.0,0.6,", ",1.0,2.0,-inf,0.6,");
    let plan = LoadPlan::build(&table(&[line]), KeyPolicy::Strict).unwrap();
    let store = SqliteGraphStore::open_in_memory().unwrap();
    Loader::new(&store, settings()).run(&plan).unwrap();

    let props = store
        .edge_properties(RelationKind::PlayedIn, &player_x(), &fixture_101())
        .unwrap()
        .unwrap();
    assert_eq!(props.get("threat"), Some(&FieldValue::Text("-inf".to_string())));
    assert_eq!(props.len(), 19);
}
