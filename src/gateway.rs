use thiserror::Error;

use crate::extract::{EdgeRecord, NodeRecord};
use crate::schema::{EntityKind, RelationKind};

/// One idempotent upsert call. Identity comes from the kind's merge keys;
/// everything else on a record is written as an overwrite.
#[derive(Debug, Clone, Copy)]
pub enum UpsertRequest<'a> {
    Nodes {
        kind: EntityKind,
        records: &'a [NodeRecord],
    },
    Edges {
        kind: RelationKind,
        records: &'a [EdgeRecord],
    },
}

impl UpsertRequest<'_> {
    /// Node label or relationship type.
    pub fn name(&self) -> &'static str {
        match self {
            UpsertRequest::Nodes { kind, .. } => kind.label(),
            UpsertRequest::Edges { kind, .. } => kind.rel_type(),
        }
    }

    /// Fields that decide whether a record matches an existing node or edge.
    /// For edges these are the endpoint keys, from side first.
    pub fn merge_keys(&self) -> Vec<&'static str> {
        match self {
            UpsertRequest::Nodes { kind, .. } => kind.key_fields().to_vec(),
            UpsertRequest::Edges { kind, .. } => kind
                .from_kind()
                .key_fields()
                .iter()
                .chain(kind.to_kind().key_fields())
                .copied()
                .collect(),
        }
    }

    pub fn set_fields(&self) -> &'static [&'static str] {
        match self {
            UpsertRequest::Nodes { kind, .. } => kind.attribute_fields(),
            UpsertRequest::Edges { kind, .. } => kind.property_columns(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            UpsertRequest::Nodes { records, .. } => records.len(),
            UpsertRequest::Edges { records, .. } => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("graph store unavailable: {0}")]
    Unavailable(String),

    #[error("{rel_type} references missing {label} node {key}")]
    MissingEndpoint {
        rel_type: &'static str,
        label: &'static str,
        key: String,
    },

    #[error("graph store rejected batch: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

/// Write side of a property-graph store.
///
/// Implementations must apply a request fully or not at all, and applying
/// the same request twice must leave the store unchanged the second time.
pub trait GraphGateway: Send + Sync {
    /// Returns the number of records affected.
    fn upsert(&self, request: UpsertRequest<'_>) -> Result<usize, GatewayError>;

    /// Removes every node and relationship.
    fn reset(&self) -> Result<(), GatewayError>;
}
