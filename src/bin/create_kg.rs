use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use fpl_graph::config::{LoadSettings, StoreConfig};
use fpl_graph::extract::KeyPolicy;
use fpl_graph::gateway::GraphGateway;
use fpl_graph::graph_store::with_store;
use fpl_graph::loader::{LoadPlan, Loader};
use fpl_graph::schema::{EntityKind, RelationKind};
use fpl_graph::table::read_table;

const DEFAULT_CONFIG_PATH: &str = "config.txt";
const DEFAULT_SOURCE_PATH: &str = "fpl_two_seasons.csv";

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path =
        parse_path_arg("--config").unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let source_path =
        parse_path_arg("--csv").unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCE_PATH));
    let settings = settings_from_args(LoadSettings::from_env())?;

    let store_config = if config_path.exists() {
        StoreConfig::from_file(&config_path)?.with_env_overrides()
    } else {
        StoreConfig::from_env().with_context(|| {
            format!(
                "no store config at {} and FPL_GRAPH_URI is unset",
                config_path.display()
            )
        })?
    };

    let table = read_table(&source_path)?;
    info!(rows = table.len(), source = %source_path.display(), "source table loaded");
    let plan = LoadPlan::build(&table, settings.key_policy)
        .context("extract graph from source table")?;

    with_store(&store_config, |store| {
        if has_flag("--no-reset") {
            info!("keeping existing graph contents");
        } else {
            store.reset().context("reset graph store")?;
            info!("cleared all nodes and relationships");
        }

        let report = match Loader::new(store, settings).run(&plan) {
            Ok(report) => report,
            Err(failure) => {
                eprintln!("Load failed in phase: {}", failure.phase);
                eprintln!("Step: {}", failure.step);
                eprintln!("Records applied before failure: {}", failure.applied);
                eprintln!("Re-run the full load to recover; upserts are idempotent.");
                return Err(anyhow::Error::new(failure));
            }
        };

        println!("Graph load complete");
        println!("Rows: {}", table.len());
        if !plan.skipped_rows.is_empty() {
            println!("Rows skipped for unusable keys: {}", plan.skipped_rows.len());
        }
        for step in &report.steps {
            println!(
                "{:<14} {:>8} record(s) in {} call(s)",
                step.name, step.affected, step.calls
            );
        }
        for kind in EntityKind::ALL {
            println!("{:<14} {:>8} node(s)", kind.label(), store.node_count(kind)?);
        }
        for kind in RelationKind::ALL {
            println!("{:<14} {:>8} edge(s)", kind.rel_type(), store.edge_count(kind)?);
        }
        Ok(())
    })
}

fn settings_from_args(mut settings: LoadSettings) -> Result<LoadSettings> {
    if let Some(raw) = parse_value_arg("--batch-size") {
        settings.batch_size = raw
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| anyhow!("invalid --batch-size {raw}"))?;
    }
    if let Some(raw) = parse_value_arg("--workers") {
        settings.workers = raw
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| anyhow!("invalid --workers {raw}"))?
            .min(32);
    }
    if has_flag("--lenient") {
        settings.key_policy = KeyPolicy::Lenient;
    }
    Ok(settings)
}

fn has_flag(flag: &str) -> bool {
    std::env::args().skip(1).any(|a| a == flag)
}

fn parse_path_arg(name: &str) -> Option<PathBuf> {
    parse_value_arg(name).map(PathBuf::from)
}

fn parse_value_arg(name: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let prefix = format!("{name}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&prefix) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == name {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() {
                return Some(next.trim().to_string());
            }
        }
    }
    None
}
