use thiserror::Error;

use crate::gateway::GatewayError;
use crate::loader::{LoadReport, Phase};

/// A source row cannot produce the key a node or relationship needs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceDataError {
    #[error("column `{column}` required by {target} is missing from the source table")]
    MissingColumn { column: String, target: &'static str },

    #[error("row {row}: {target} key column `{column}` is empty")]
    MissingKey {
        row: usize,
        column: String,
        target: &'static str,
    },

    #[error("row {row}: {target} key column `{column}` holds {value}, which is not an exact integer")]
    InvalidKey {
        row: usize,
        column: String,
        target: &'static str,
        value: f64,
    },
}

impl SourceDataError {
    /// 1-based data row the error points at, if it is row-specific.
    pub fn row(&self) -> Option<usize> {
        match self {
            SourceDataError::MissingColumn { .. } => None,
            SourceDataError::MissingKey { row, .. } | SourceDataError::InvalidKey { row, .. } => {
                Some(*row)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("graph store unavailable after {attempts} attempt(s)")]
    GatewayUnavailable {
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    #[error("ordering violation")]
    OrderingViolation {
        #[source]
        source: GatewayError,
    },

    #[error("phase {phase} started before {missing} completed")]
    PhaseOutOfOrder { phase: Phase, missing: Phase },

    #[error("graph store rejected the batch")]
    Rejected {
        #[source]
        source: GatewayError,
    },
}

impl LoadError {
    pub fn from_gateway(source: GatewayError, attempts: u32) -> Self {
        match source {
            GatewayError::Unavailable(_) => LoadError::GatewayUnavailable { attempts, source },
            GatewayError::MissingEndpoint { .. } => LoadError::OrderingViolation { source },
            GatewayError::Rejected(_) => LoadError::Rejected { source },
        }
    }
}

/// A run stopped part-way. Everything counted in `applied` stays in the
/// store; re-running the whole load is the recovery path.
#[derive(Debug, Error)]
#[error("load failed in {phase} phase at {step} after {applied} record(s) applied")]
pub struct LoadFailure {
    pub phase: Phase,
    pub step: &'static str,
    pub applied: usize,
    pub report: LoadReport,
    #[source]
    pub error: LoadError,
}
