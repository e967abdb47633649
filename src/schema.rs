//! Graph shape of the league dataset: which nodes and relationships exist,
//! how each is identified, and which source columns feed it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::table::FieldValue;

/// Columns the source table must provide.
pub const SOURCE_COLUMNS: &[&str] = &[
    "season",
    "GW",
    "fixture",
    "kickoff_time",
    "home_team",
    "away_team",
    "name",
    "element",
    "position",
    "minutes",
    "goals_scored",
    "assists",
    "total_points",
    "bonus",
    "clean_sheets",
    "goals_conceded",
    "own_goals",
    "penalties_saved",
    "penalties_missed",
    "yellow_cards",
    "red_cards",
    "saves",
    "bps",
    "influence",
    "creativity",
    "threat",
    "ict_index",
    "form",
];

/// Per-appearance statistics carried on PLAYED_IN, stored under the same names.
pub const APPEARANCE_STAT_COLUMNS: &[&str] = &[
    "minutes",
    "goals_scored",
    "assists",
    "total_points",
    "bonus",
    "clean_sheets",
    "goals_conceded",
    "own_goals",
    "penalties_saved",
    "penalties_missed",
    "yellow_cards",
    "red_cards",
    "saves",
    "bps",
    "influence",
    "creativity",
    "threat",
    "ict_index",
    "form",
];

/// Property map set on a node or relationship.
pub type Props = BTreeMap<String, FieldValue>;

/// One component of a natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Int(i64),
    Text(String),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(n) => write!(f, "{n}"),
            KeyValue::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// Natural key of a node, ordered like the owning kind's `key_fields()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(pub Vec<KeyValue>);

impl NodeKey {
    pub fn text(value: &str) -> Self {
        NodeKey(vec![KeyValue::Text(value.to_string())])
    }

    /// Canonical text form used as a storage identity.
    pub fn canonical(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (idx, part) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{part}")?;
        }
        f.write_str(")")
    }
}

/// Source columns projected onto one node kind. `keys` line up with
/// `EntityKind::key_fields`, `attributes` with `EntityKind::attribute_fields`.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    pub keys: &'static [&'static str],
    pub attributes: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Season,
    Gameweek,
    Fixture,
    Team,
    Player,
    Position,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Season,
        EntityKind::Gameweek,
        EntityKind::Fixture,
        EntityKind::Team,
        EntityKind::Player,
        EntityKind::Position,
    ];

    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Season => "Season",
            EntityKind::Gameweek => "Gameweek",
            EntityKind::Fixture => "Fixture",
            EntityKind::Team => "Team",
            EntityKind::Player => "Player",
            EntityKind::Position => "Position",
        }
    }

    pub fn key_fields(self) -> &'static [&'static str] {
        match self {
            EntityKind::Season => &["season_name"],
            EntityKind::Gameweek => &["season_name", "GW_number"],
            EntityKind::Fixture => &["season_name", "fixture_number"],
            EntityKind::Team | EntityKind::Position => &["name"],
            EntityKind::Player => &["player_name", "player_element"],
        }
    }

    pub fn attribute_fields(self) -> &'static [&'static str] {
        match self {
            EntityKind::Fixture => &["kickoff_time"],
            _ => &[],
        }
    }

    /// Teams appear under two source columns, every other kind under one.
    pub fn projections(self) -> &'static [Projection] {
        match self {
            EntityKind::Season => &[Projection {
                keys: &["season"],
                attributes: &[],
            }],
            EntityKind::Gameweek => &[Projection {
                keys: &["season", "GW"],
                attributes: &[],
            }],
            EntityKind::Fixture => &[Projection {
                keys: &["season", "fixture"],
                attributes: &["kickoff_time"],
            }],
            EntityKind::Team => &[
                Projection {
                    keys: &["home_team"],
                    attributes: &[],
                },
                Projection {
                    keys: &["away_team"],
                    attributes: &[],
                },
            ],
            EntityKind::Player => &[Projection {
                keys: &["name", "element"],
                attributes: &[],
            }],
            EntityKind::Position => &[Projection {
                keys: &["position"],
                attributes: &[],
            }],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelationKind {
    HasGw,
    HasFixture,
    HasHomeTeam,
    HasAwayTeam,
    PlaysAs,
    PlayedIn,
}

impl RelationKind {
    pub const ALL: [RelationKind; 6] = [
        RelationKind::HasGw,
        RelationKind::HasFixture,
        RelationKind::HasHomeTeam,
        RelationKind::HasAwayTeam,
        RelationKind::PlaysAs,
        RelationKind::PlayedIn,
    ];

    /// Relationship types loaded in one call each, after all nodes.
    pub const STRUCTURAL: [RelationKind; 5] = [
        RelationKind::HasGw,
        RelationKind::HasFixture,
        RelationKind::HasHomeTeam,
        RelationKind::HasAwayTeam,
        RelationKind::PlaysAs,
    ];

    pub fn rel_type(self) -> &'static str {
        match self {
            RelationKind::HasGw => "HAS_GW",
            RelationKind::HasFixture => "HAS_FIXTURE",
            RelationKind::HasHomeTeam => "HAS_HOME_TEAM",
            RelationKind::HasAwayTeam => "HAS_AWAY_TEAM",
            RelationKind::PlaysAs => "PLAYS_AS",
            RelationKind::PlayedIn => "PLAYED_IN",
        }
    }

    pub fn from_kind(self) -> EntityKind {
        match self {
            RelationKind::HasGw => EntityKind::Season,
            RelationKind::HasFixture => EntityKind::Gameweek,
            RelationKind::HasHomeTeam | RelationKind::HasAwayTeam => EntityKind::Fixture,
            RelationKind::PlaysAs | RelationKind::PlayedIn => EntityKind::Player,
        }
    }

    pub fn to_kind(self) -> EntityKind {
        match self {
            RelationKind::HasGw => EntityKind::Gameweek,
            RelationKind::HasFixture | RelationKind::PlayedIn => EntityKind::Fixture,
            RelationKind::HasHomeTeam | RelationKind::HasAwayTeam => EntityKind::Team,
            RelationKind::PlaysAs => EntityKind::Position,
        }
    }

    pub fn from_columns(self) -> &'static [&'static str] {
        match self {
            RelationKind::HasGw => &["season"],
            RelationKind::HasFixture => &["season", "GW"],
            RelationKind::HasHomeTeam | RelationKind::HasAwayTeam => &["season", "fixture"],
            RelationKind::PlaysAs | RelationKind::PlayedIn => &["name", "element"],
        }
    }

    pub fn to_columns(self) -> &'static [&'static str] {
        match self {
            RelationKind::HasGw => &["season", "GW"],
            RelationKind::HasFixture | RelationKind::PlayedIn => &["season", "fixture"],
            RelationKind::HasHomeTeam => &["home_team"],
            RelationKind::HasAwayTeam => &["away_team"],
            RelationKind::PlaysAs => &["position"],
        }
    }

    pub fn property_columns(self) -> &'static [&'static str] {
        match self {
            RelationKind::PlayedIn => APPEARANCE_STAT_COLUMNS,
            _ => &[],
        }
    }

    /// PLAYED_IN keeps one record per source row; the store overwrite resolves repeats.
    pub fn deduplicates(self) -> bool {
        !matches!(self, RelationKind::PlayedIn)
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rel_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projections_line_up_with_key_fields() {
        for kind in EntityKind::ALL {
            for projection in kind.projections() {
                assert_eq!(projection.keys.len(), kind.key_fields().len(), "{kind}");
                assert_eq!(
                    projection.attributes.len(),
                    kind.attribute_fields().len(),
                    "{kind}"
                );
            }
        }
    }

    #[test]
    fn relationship_columns_match_endpoint_keys() {
        for rel in RelationKind::ALL {
            assert_eq!(rel.from_columns().len(), rel.from_kind().key_fields().len());
            assert_eq!(rel.to_columns().len(), rel.to_kind().key_fields().len());
            for col in rel.from_columns().iter().chain(rel.to_columns()) {
                assert!(SOURCE_COLUMNS.contains(col), "{rel} uses unknown column {col}");
            }
        }
    }

    #[test]
    fn canonical_key_is_stable_json() {
        let key = NodeKey(vec![KeyValue::Text("20/21".to_string()), KeyValue::Int(1)]);
        assert_eq!(key.canonical(), r#"["20/21",1]"#);
        assert_eq!(key.to_string(), r#"("20/21", 1)"#);
    }
}
