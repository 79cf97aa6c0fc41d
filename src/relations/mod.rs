mod resolver;

pub use resolver::{load_relationships, RelationshipSources};

use std::collections::{btree_map, BTreeMap};
use std::error::Error;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Asn;

/// Commercial relationship between two adjacent ASes, read in the
/// direction of the ordered pair it is stored under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AsRelation {
    #[serde(rename = "sibling")]
    Sibling,
    #[serde(rename = "p2c")]
    ProviderToCustomer,
    #[serde(rename = "c2p")]
    CustomerToProvider,
    #[serde(rename = "p2p")]
    PeerToPeer,
}

impl AsRelation {
    /// The label stored under the reversed pair.
    ///   rel(U,V) = p2c  <=>  rel(V,U) = c2p
    /// sibling and p2p are their own inverses.
    pub fn inverse(self) -> Self {
        use AsRelation::*;
        match self {
            ProviderToCustomer => CustomerToProvider,
            CustomerToProvider => ProviderToCustomer,
            Sibling => Sibling,
            PeerToPeer => PeerToPeer,
        }
    }

    pub fn as_str(self) -> &'static str {
        use AsRelation::*;
        match self {
            Sibling => "sibling",
            ProviderToCustomer => "p2c",
            CustomerToProvider => "c2p",
            PeerToPeer => "p2p",
        }
    }
}

impl fmt::Display for AsRelation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relation token that none of the datasets define. Never silently
/// defaulted; ingest treats it as a fatal parse error.
#[derive(Debug)]
pub struct UnknownRelation {
    pub token: String,
}

impl fmt::Display for UnknownRelation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown AS relation '{}'", self.token)
    }
}

impl Error for UnknownRelation {}

impl FromStr for AsRelation {
    type Err = UnknownRelation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use AsRelation::*;
        match s {
            "sibling" => Ok(Sibling),
            "p2c" => Ok(ProviderToCustomer),
            "c2p" => Ok(CustomerToProvider),
            "p2p" => Ok(PeerToPeer),
            other => Err(UnknownRelation {
                token: other.to_string(),
            }),
        }
    }
}

/// One labeled directed adjacency, as exchanged with relationship
/// datasets (`[{"as1": .., "as2": .., "relation": ..}]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationRecord {
    pub as1: Asn,
    pub as2: Asn,
    pub relation: AsRelation,
}

/// Emitted whenever a later relationship source overwrites a differing
/// label left by an earlier one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub as1: Asn,
    pub as2: Asn,
    pub old: AsRelation,
    pub new: AsRelation,
    pub source: String,
}

/// The AS-relationship table: a label for every known ordered pair.
/// Writing a pair always writes its inverse, so the inversion rules
/// hold by construction.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelationTable {
    rels: BTreeMap<Asn, BTreeMap<Asn, AsRelation>>,
}

impl RelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, u: &str, v: &str) -> Option<AsRelation> {
        self.rels.get(u).and_then(|m| m.get(v)).copied()
    }

    /// Number of directed entries.
    pub fn len(&self) -> usize {
        self.rels.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rels.is_empty()
    }

    pub fn clear(&mut self) {
        self.rels.clear();
    }

    /// Install a record and its inverse. The forward and inverse slots are
    /// independent observations; either may conflict with an existing label
    /// on its own, in which case the old value is overwritten and a
    /// conflict is recorded.
    pub fn apply(
        &mut self,
        record: &RelationRecord,
        source: &str,
        conflicts: &mut Vec<ConflictRecord>,
    ) {
        if let Some(old) = self.set(&record.as1, &record.as2, record.relation) {
            conflicts.push(ConflictRecord {
                as1: record.as1.clone(),
                as2: record.as2.clone(),
                old,
                new: record.relation,
                source: source.to_string(),
            });
        }
        let inverse = record.relation.inverse();
        if let Some(old) = self.set(&record.as2, &record.as1, inverse) {
            conflicts.push(ConflictRecord {
                as1: record.as2.clone(),
                as2: record.as1.clone(),
                old,
                new: inverse,
                source: source.to_string(),
            });
        }
    }

    /// Returns the previous label when it existed and differed.
    fn set(&mut self, u: &str, v: &str, rel: AsRelation) -> Option<AsRelation> {
        let slot = self
            .rels
            .entry(u.to_string())
            .or_insert_with(BTreeMap::new)
            .entry(v.to_string());
        match slot {
            btree_map::Entry::Occupied(mut occupied) => {
                let old = *occupied.get();
                if old == rel {
                    None
                } else {
                    occupied.insert(rel);
                    Some(old)
                }
            }
            btree_map::Entry::Vacant(vacant) => {
                vacant.insert(rel);
                None
            }
        }
    }
}
