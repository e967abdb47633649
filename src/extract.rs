use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::error::SourceDataError;
use crate::schema::{EntityKind, KeyValue, NodeKey, Props, RelationKind};
use crate::table::{FieldValue, RowTable};

/// What to do with a row whose key cells are blank or unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyPolicy {
    /// Abort extraction on the first bad key.
    #[default]
    Strict,
    /// Skip the row for the affected node or relationship type only.
    Lenient,
}

impl KeyPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(KeyPolicy::Strict),
            "lenient" => Some(KeyPolicy::Lenient),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub key: NodeKey,
    pub attributes: Props,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRecord {
    pub from: NodeKey,
    pub to: NodeKey,
    pub properties: Props,
}

#[derive(Debug, Clone)]
pub struct Extracted<T> {
    pub records: Vec<T>,
    /// 1-based rows dropped under `KeyPolicy::Lenient`.
    pub skipped_rows: Vec<usize>,
}

/// Distinct nodes of `kind`, in first-seen order. Attributes follow the last
/// row that mentions the key.
pub fn extract_entities(
    table: &RowTable,
    kind: EntityKind,
    policy: KeyPolicy,
) -> Result<Extracted<NodeRecord>, SourceDataError> {
    let target = kind.label();
    let projections = kind
        .projections()
        .iter()
        .map(|p| -> Result<_, SourceDataError> {
            Ok((
                resolve_columns(table, p.keys, target)?,
                resolve_columns(table, p.attributes, target)?,
            ))
        })
        .collect::<Result<Vec<_>, SourceDataError>>()?;

    let mut records: Vec<NodeRecord> = Vec::new();
    let mut seen: HashMap<NodeKey, usize> = HashMap::new();
    let mut skipped_rows = Vec::new();

    for (idx, row) in table.rows().enumerate() {
        let row_no = idx + 1;
        for (key_cols, attr_cols) in &projections {
            let key = match build_key(row, key_cols, row_no, target) {
                Ok(key) => key,
                Err(err) => {
                    reject(policy, err, row_no, &mut skipped_rows)?;
                    continue;
                }
            };
            let attributes = collect_props(row, attr_cols, kind.attribute_fields());
            match seen.get(&key) {
                Some(&pos) => records[pos].attributes = attributes,
                None => {
                    seen.insert(key.clone(), records.len());
                    records.push(NodeRecord { key, attributes });
                }
            }
        }
    }

    Ok(Extracted {
        records,
        skipped_rows,
    })
}

/// Edges of `kind`. Structural types are deduplicated on the endpoint pair;
/// PLAYED_IN yields one record per row, in row order.
pub fn extract_relationships(
    table: &RowTable,
    kind: RelationKind,
    policy: KeyPolicy,
) -> Result<Extracted<EdgeRecord>, SourceDataError> {
    let target = kind.rel_type();
    let from_cols = resolve_columns(table, kind.from_columns(), target)?;
    let to_cols = resolve_columns(table, kind.to_columns(), target)?;
    let prop_cols = resolve_columns(table, kind.property_columns(), target)?;

    let mut records = Vec::new();
    let mut seen: HashSet<(NodeKey, NodeKey)> = HashSet::new();
    let mut skipped_rows = Vec::new();

    for (idx, row) in table.rows().enumerate() {
        let row_no = idx + 1;
        let endpoints = build_key(row, &from_cols, row_no, target)
            .and_then(|from| Ok((from, build_key(row, &to_cols, row_no, target)?)));
        let (from, to) = match endpoints {
            Ok(pair) => pair,
            Err(err) => {
                reject(policy, err, row_no, &mut skipped_rows)?;
                continue;
            }
        };
        if kind.deduplicates() && !seen.insert((from.clone(), to.clone())) {
            continue;
        }
        let properties = collect_props(row, &prop_cols, kind.property_columns());
        records.push(EdgeRecord {
            from,
            to,
            properties,
        });
    }

    Ok(Extracted {
        records,
        skipped_rows,
    })
}

/// Collapses repeated (from, to) pairs to a single record carrying the last
/// row's properties, keeping first-seen order.
pub fn collapse_last_write(records: &[EdgeRecord]) -> Vec<EdgeRecord> {
    let mut out: Vec<EdgeRecord> = Vec::with_capacity(records.len());
    let mut seen: HashMap<(&NodeKey, &NodeKey), usize> = HashMap::new();
    for record in records {
        match seen.get(&(&record.from, &record.to)) {
            Some(&pos) => out[pos].properties = record.properties.clone(),
            None => {
                seen.insert((&record.from, &record.to), out.len());
                out.push(record.clone());
            }
        }
    }
    out
}

fn resolve_columns(
    table: &RowTable,
    names: &'static [&'static str],
    target: &'static str,
) -> Result<Vec<(usize, &'static str)>, SourceDataError> {
    names
        .iter()
        .map(|name| {
            table
                .column_index(name)
                .map(|idx| (idx, *name))
                .ok_or_else(|| SourceDataError::MissingColumn {
                    column: name.to_string(),
                    target,
                })
        })
        .collect()
}

fn build_key(
    row: &[FieldValue],
    cols: &[(usize, &'static str)],
    row_no: usize,
    target: &'static str,
) -> Result<NodeKey, SourceDataError> {
    let mut parts = Vec::with_capacity(cols.len());
    for (idx, column) in cols {
        let part = match &row[*idx] {
            FieldValue::Int(n) => KeyValue::Int(*n),
            FieldValue::Float(f) => match exact_i64(*f) {
                Some(n) => KeyValue::Int(n),
                None => {
                    return Err(SourceDataError::InvalidKey {
                        row: row_no,
                        column: column.to_string(),
                        target,
                        value: *f,
                    });
                }
            },
            FieldValue::Text(s) if !s.trim().is_empty() => KeyValue::Text(s.trim().to_string()),
            FieldValue::Bool(b) => KeyValue::Text(b.to_string()),
            FieldValue::Text(_) | FieldValue::Null => {
                return Err(SourceDataError::MissingKey {
                    row: row_no,
                    column: column.to_string(),
                    target,
                });
            }
        };
        parts.push(part);
    }
    Ok(NodeKey(parts))
}

/// `f` as an integer when the conversion is lossless.
fn exact_i64(f: f64) -> Option<i64> {
    // i64::MAX rounds up to 2^63 as f64, so the upper bound is exclusive.
    if f.fract() != 0.0 || f < i64::MIN as f64 || f >= i64::MAX as f64 {
        return None;
    }
    Some(f as i64)
}

fn collect_props(row: &[FieldValue], cols: &[(usize, &'static str)], names: &[&str]) -> Props {
    cols.iter()
        .zip(names)
        .map(|((idx, _), name)| (name.to_string(), row[*idx].clone()))
        .collect()
}

fn reject(
    policy: KeyPolicy,
    err: SourceDataError,
    row_no: usize,
    skipped_rows: &mut Vec<usize>,
) -> Result<(), SourceDataError> {
    match policy {
        KeyPolicy::Strict => Err(err),
        KeyPolicy::Lenient => {
            warn!(row = row_no, "skipping row: {err}");
            if skipped_rows.last() != Some(&row_no) {
                skipped_rows.push(row_no);
            }
            Ok(())
        }
    }
}
