//! Phase-ordered load of a `LoadPlan` through a `GraphGateway`.
//!
//! Nodes of every kind are written before any relationship, structural
//! relationships before PLAYED_IN. A failed call stops the run; whatever was
//! already applied stays, and re-running the whole load is the recovery path.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::LoadSettings;
use crate::error::{LoadError, LoadFailure, SourceDataError};
use crate::extract::{
    EdgeRecord, KeyPolicy, NodeRecord, collapse_last_write, extract_entities,
    extract_relationships,
};
use crate::gateway::{GraphGateway, UpsertRequest};
use crate::schema::{EntityKind, RelationKind};
use crate::table::RowTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Entities,
    Relationships,
    Appearances,
}

impl Phase {
    pub const ORDER: [Phase; 3] = [Phase::Entities, Phase::Relationships, Phase::Appearances];

    pub fn depends_on(self) -> &'static [Phase] {
        match self {
            Phase::Entities => &[],
            Phase::Relationships => &[Phase::Entities],
            Phase::Appearances => &[Phase::Entities, Phase::Relationships],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Entities => "entities",
            Phase::Relationships => "relationships",
            Phase::Appearances => "appearances",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything one run will write, extracted up front so bad source data is
/// reported before the store is touched.
#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub entities: Vec<(EntityKind, Vec<NodeRecord>)>,
    pub relationships: Vec<(RelationKind, Vec<EdgeRecord>)>,
    /// Row-granular PLAYED_IN records, in source order.
    pub appearances: Vec<EdgeRecord>,
    pub skipped_rows: BTreeSet<usize>,
}

impl LoadPlan {
    pub fn build(table: &RowTable, policy: KeyPolicy) -> Result<Self, SourceDataError> {
        let mut skipped_rows = BTreeSet::new();

        let mut entities = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            let extracted = extract_entities(table, kind, policy)?;
            skipped_rows.extend(extracted.skipped_rows);
            entities.push((kind, extracted.records));
        }

        let mut relationships = Vec::with_capacity(RelationKind::STRUCTURAL.len());
        for kind in RelationKind::STRUCTURAL {
            let extracted = extract_relationships(table, kind, policy)?;
            skipped_rows.extend(extracted.skipped_rows);
            relationships.push((kind, extracted.records));
        }

        let extracted = extract_relationships(table, RelationKind::PlayedIn, policy)?;
        skipped_rows.extend(extracted.skipped_rows);

        if !skipped_rows.is_empty() {
            warn!(
                skipped = skipped_rows.len(),
                "rows with unusable keys were left out of one or more targets"
            );
        }

        Ok(Self {
            entities,
            relationships,
            appearances: extracted.records,
            skipped_rows,
        })
    }

    pub fn nodes(&self, kind: EntityKind) -> &[NodeRecord] {
        self.entities
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, records)| records.as_slice())
            .unwrap_or(&[])
    }

    pub fn edges(&self, kind: RelationKind) -> &[EdgeRecord] {
        if kind == RelationKind::PlayedIn {
            return &self.appearances;
        }
        self.relationships
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, records)| records.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub phase: Phase,
    pub name: &'static str,
    pub records: usize,
    pub affected: usize,
    pub calls: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub steps: Vec<StepReport>,
    pub completed: Vec<Phase>,
}

impl LoadReport {
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn affected_in(&self, phase: Phase) -> usize {
        self.steps
            .iter()
            .filter(|s| s.phase == phase)
            .map(|s| s.affected)
            .sum()
    }

    pub fn total_affected(&self) -> usize {
        self.steps.iter().map(|s| s.affected).sum()
    }

    pub fn is_complete(&self) -> bool {
        Phase::ORDER.iter().all(|p| self.completed.contains(p))
    }
}

/// Outcome of one gateway-facing step before it is folded into the report.
struct StepOutcome {
    report: StepReport,
    error: Option<LoadError>,
}

pub struct Loader<'g, G: GraphGateway + ?Sized> {
    gateway: &'g G,
    settings: LoadSettings,
}

impl<'g, G: GraphGateway + ?Sized> Loader<'g, G> {
    pub fn new(gateway: &'g G, settings: LoadSettings) -> Self {
        Self { gateway, settings }
    }

    pub fn run(&self, plan: &LoadPlan) -> Result<LoadReport, LoadFailure> {
        let pool = self.build_pool();
        let mut report = LoadReport::default();
        for phase in Phase::ORDER {
            ensure_ready(phase, &mut report)?;
            let outcomes = match phase {
                Phase::Entities => self.with_pool(&pool, || self.load_entities(plan)),
                Phase::Relationships => self.with_pool(&pool, || self.load_relationships(plan)),
                Phase::Appearances => {
                    vec![self.with_pool(&pool, || self.load_appearances(&plan.appearances))]
                }
            };
            let mut failed = None;
            for outcome in outcomes {
                if failed.is_none()
                    && let Some(error) = outcome.error
                {
                    failed = Some((outcome.report.name, error));
                }
                report.steps.push(outcome.report);
            }
            if let Some((step, error)) = failed {
                return Err(LoadFailure {
                    phase,
                    step,
                    applied: report.total_affected(),
                    report,
                    error,
                });
            }
            info!(
                phase = %phase,
                affected = report.affected_in(phase),
                "phase complete"
            );
            report.completed.push(phase);
        }
        Ok(report)
    }

    fn load_entities(&self, plan: &LoadPlan) -> Vec<StepOutcome> {
        let upsert_one = |(kind, records): &(EntityKind, Vec<NodeRecord>)| {
            self.single_call(
                Phase::Entities,
                UpsertRequest::Nodes {
                    kind: *kind,
                    records,
                },
            )
        };
        if self.parallel() {
            plan.entities.par_iter().map(upsert_one).collect()
        } else {
            collect_until_failure(plan.entities.iter().map(upsert_one))
        }
    }

    fn load_relationships(&self, plan: &LoadPlan) -> Vec<StepOutcome> {
        let upsert_one = |(kind, records): &(RelationKind, Vec<EdgeRecord>)| {
            self.single_call(
                Phase::Relationships,
                UpsertRequest::Edges {
                    kind: *kind,
                    records,
                },
            )
        };
        if self.parallel() {
            plan.relationships.par_iter().map(upsert_one).collect()
        } else {
            collect_until_failure(plan.relationships.iter().map(upsert_one))
        }
    }

    /// PLAYED_IN in fixed-size batches. In parallel mode repeated
    /// (player, fixture) pairs are collapsed first so batches never share a key.
    fn load_appearances(&self, records: &[EdgeRecord]) -> StepOutcome {
        let name = RelationKind::PlayedIn.rel_type();
        let collapsed;
        let records = if self.parallel() {
            collapsed = collapse_last_write(records);
            collapsed.as_slice()
        } else {
            records
        };
        let total = records.len();
        let batch_size = self.settings.batch_size.max(1);
        let mut report = StepReport {
            phase: Phase::Appearances,
            name,
            records: total,
            affected: 0,
            calls: 0,
        };

        if self.parallel() {
            let done = AtomicUsize::new(0);
            let results = records
                .par_chunks(batch_size)
                .map(|batch| {
                    let res = self.call(UpsertRequest::Edges {
                        kind: RelationKind::PlayedIn,
                        records: batch,
                    });
                    if let Ok(n) = res {
                        let so_far = done.fetch_add(n, Ordering::Relaxed) + n;
                        info!(step = name, "Inserted {so_far}/{total}");
                    }
                    res
                })
                .collect::<Vec<_>>();
            let mut error = None;
            for res in results {
                report.calls += 1;
                match res {
                    Ok(n) => report.affected += n,
                    Err(err) => {
                        error.get_or_insert(err);
                    }
                }
            }
            return StepOutcome { report, error };
        }

        for (idx, batch) in records.chunks(batch_size).enumerate() {
            report.calls += 1;
            match self.call(UpsertRequest::Edges {
                kind: RelationKind::PlayedIn,
                records: batch,
            }) {
                Ok(n) => {
                    report.affected += n;
                    info!(
                        step = name,
                        batch = idx + 1,
                        "Inserted {}/{}",
                        report.affected,
                        total
                    );
                }
                Err(error) => {
                    return StepOutcome {
                        report,
                        error: Some(error),
                    };
                }
            }
        }
        StepOutcome {
            report,
            error: None,
        }
    }

    fn single_call(&self, phase: Phase, request: UpsertRequest<'_>) -> StepOutcome {
        let mut report = StepReport {
            phase,
            name: request.name(),
            records: request.len(),
            affected: 0,
            calls: 0,
        };
        if request.is_empty() {
            info!(phase = %phase, step = report.name, "nothing to upsert");
            return StepOutcome {
                report,
                error: None,
            };
        }
        report.calls = 1;
        match self.call(request) {
            Ok(n) => {
                report.affected = n;
                info!(phase = %phase, step = report.name, affected = n, "upserted");
                StepOutcome {
                    report,
                    error: None,
                }
            }
            Err(error) => StepOutcome {
                report,
                error: Some(error),
            },
        }
    }

    fn call(&self, request: UpsertRequest<'_>) -> Result<usize, LoadError> {
        self.settings
            .retry
            .run(request.name(), || self.gateway.upsert(request))
            .map_err(|exhausted| LoadError::from_gateway(exhausted.error, exhausted.attempts))
    }

    fn parallel(&self) -> bool {
        self.settings.workers > 1
    }

    fn build_pool(&self) -> Option<rayon::ThreadPool> {
        if !self.parallel() {
            return None;
        }
        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.workers)
            .build()
        {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!("worker pool unavailable, loading sequentially: {err}");
                None
            }
        }
    }

    fn with_pool<T: Send>(
        &self,
        pool: &Option<rayon::ThreadPool>,
        action: impl FnOnce() -> T + Send,
    ) -> T {
        match pool {
            Some(pool) => pool.install(action),
            None => action(),
        }
    }
}

fn ensure_ready(phase: Phase, report: &mut LoadReport) -> Result<(), LoadFailure> {
    let Some(&missing) = phase
        .depends_on()
        .iter()
        .find(|dep| !report.completed.contains(dep))
    else {
        return Ok(());
    };
    Err(LoadFailure {
        phase,
        step: phase.label(),
        applied: report.total_affected(),
        report: std::mem::take(report),
        error: LoadError::PhaseOutOfOrder { phase, missing },
    })
}

/// Sequential steps stop at the first failure; later steps of the phase are
/// never attempted.
fn collect_until_failure(steps: impl Iterator<Item = StepOutcome>) -> Vec<StepOutcome> {
    let mut out = Vec::new();
    for outcome in steps {
        let failed = outcome.error.is_some();
        out.push(outcome);
        if failed {
            break;
        }
    }
    out
}
