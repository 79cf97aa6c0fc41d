use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use itertools::Itertools;
use log::{info, warn};

use crate::relations::{AsRelation, RelationRecord};
use crate::store::SurePathIndex;
use crate::Asn;

/// Tuning knobs for the relationship heuristics.
#[derive(Clone, Copy, Debug)]
pub struct GaoParams {
    /// Transit-count threshold (`L`).
    pub transit_threshold: u32,
    /// Degree-ratio bound (`R`) within which two ASes may peer.
    pub degree_ratio: f64,
}

impl Default for GaoParams {
    fn default() -> Self {
        Self {
            transit_threshold: 1,
            degree_ratio: 60.0,
        }
    }
}

/// Running tally of assigned labels. Replacements decrement the old
/// label, so totals can transiently dip when heuristics disagree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LabelCounts {
    pub sibling: i64,
    pub p2c: i64,
    pub c2p: i64,
    pub p2p: i64,
}

impl LabelCounts {
    fn incr(&mut self, rel: AsRelation) {
        *self.slot(rel) += 1;
    }

    fn decr(&mut self, rel: AsRelation) {
        *self.slot(rel) -= 1;
    }

    fn slot(&mut self, rel: AsRelation) -> &mut i64 {
        match rel {
            AsRelation::Sibling => &mut self.sibling,
            AsRelation::ProviderToCustomer => &mut self.p2c,
            AsRelation::CustomerToProvider => &mut self.c2p,
            AsRelation::PeerToPeer => &mut self.p2p,
        }
    }
}

impl fmt::Display for LabelCounts {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} siblings, {} p2c, {} c2p, {} p2p",
            self.sibling, self.p2c, self.c2p, self.p2p
        )
    }
}

/// The labeled directed adjacencies produced by one inference run.
#[derive(Clone, Debug, Default)]
pub struct RelationInference {
    labels: BTreeMap<(Asn, Asn), AsRelation>,
    counts: LabelCounts,
}

impl RelationInference {
    pub fn get(&self, u: &str, v: &str) -> Option<AsRelation> {
        self.labels.get(&(u.to_string(), v.to_string())).copied()
    }

    pub fn counts(&self) -> LabelCounts {
        self.counts
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Serialize every directed edge as `{as1, as2, relation}`.
    pub fn to_records(&self) -> Vec<RelationRecord> {
        self.labels
            .iter()
            .map(|((as1, as2), relation)| RelationRecord {
                as1: as1.clone(),
                as2: as2.clone(),
                relation: *relation,
            })
            .collect()
    }

    /// Install a label and its inverse. Identical re-assignments leave
    /// the tally unchanged; replacements adjust it.
    fn assign(&mut self, u: &Asn, v: &Asn, label: AsRelation) {
        let key = (u.clone(), v.clone());
        if self.labels.get(&key) == Some(&label) {
            return;
        }
        if let Some(old) = self.labels.insert(key, label) {
            warn!("Replacing '{}' rel of {} -> {} with '{}'", old, u, v, label);
            self.counts.decr(old);
        }
        self.labels.insert((v.clone(), u.clone()), label.inverse());
        self.counts.incr(label);
    }
}

fn degree(degrees: &BTreeMap<&Asn, usize>, asn: &Asn) -> usize {
    degrees.get(asn).copied().unwrap_or(0)
}

/// Index of the highest-degree AS on the path; ties break toward the
/// lowest index.
fn top_provider_index(path: &[Asn], degrees: &BTreeMap<&Asn, usize>) -> usize {
    let mut top = 0;
    for i in 1..path.len() {
        if degree(degrees, &path[i]) > degree(degrees, &path[top]) {
            top = i;
        }
    }
    top
}

type Transit<'a> = BTreeMap<(&'a Asn, &'a Asn), u32>;

fn is_sibling(transit: &Transit, u: &Asn, v: &Asn, l: u32) -> bool {
    match (transit.get(&(u, v)), transit.get(&(v, u))) {
        (Some(&fwd), Some(&rev)) => (fwd > l && rev > l) || (fwd <= l && rev <= l),
        _ => false,
    }
}

fn is_p2c(transit: &Transit, u: &Asn, v: &Asn, l: u32) -> bool {
    match transit.get(&(u, v)) {
        None => true,
        Some(_) => transit.get(&(v, u)).map(|&rev| rev > l).unwrap_or(false),
    }
}

fn is_c2p(transit: &Transit, u: &Asn, v: &Asn, l: u32) -> bool {
    match transit.get(&(v, u)) {
        None => true,
        Some(_) => transit.get(&(u, v)).map(|&fwd| fwd > l).unwrap_or(false),
    }
}

/// Run Gao's relationship inference over one RIB-tagged graph: an
/// undirected degree graph built from the link set, transit tallies
/// around each sure path's top provider, per-adjacency classification,
/// and a degree-ratio peering upgrade outside the non-peering mask.
pub fn infer_relationships(
    links: &BTreeMap<Asn, BTreeSet<Asn>>,
    sure_paths: &SurePathIndex,
    params: &GaoParams,
) -> RelationInference {
    let degrees: BTreeMap<&Asn, usize> = links.iter().map(|(asn, peers)| (asn, peers.len())).collect();
    let l = params.transit_threshold;

    // Tally transit: below the top provider each AS routes up through its
    // successor, above it each AS routes up through its predecessor.
    info!("Determining transit relationships");
    let mut transit: Transit = BTreeMap::new();
    for path in sure_paths.iter() {
        let top = top_provider_index(path, &degrees);
        for i in 0..top {
            *transit.entry((&path[i], &path[i + 1])).or_insert(0) += 1;
        }
        for i in top..path.len().saturating_sub(1) {
            *transit.entry((&path[i + 1], &path[i])).or_insert(0) += 1;
        }
    }

    info!("Assigning relationships");
    let mut inference = RelationInference::default();
    for path in sure_paths.iter() {
        for (u, v) in path.iter().tuple_windows() {
            if is_sibling(&transit, u, v, l) {
                inference.assign(u, v, AsRelation::Sibling);
            } else if is_p2c(&transit, u, v, l) {
                inference.assign(u, v, AsRelation::ProviderToCustomer);
            } else if is_c2p(&transit, u, v, l) {
                inference.assign(u, v, AsRelation::CustomerToProvider);
            } else {
                warn!("{} -> {} didn't match any transit heuristic", u, v);
            }
        }
    }

    // Adjacencies well below or above the top provider cannot be peers.
    // The straddling adjacency stays eligible, also when the top provider
    // sits at either end of the path.
    info!("Identifying ASes that cannot be peers");
    let mut notpeering: BTreeSet<(&Asn, &Asn)> = BTreeSet::new();
    for path in sure_paths.iter() {
        let top = top_provider_index(path, &degrees);
        for i in 0..top.saturating_sub(1) {
            notpeering.insert((&path[i], &path[i + 1]));
        }
        for i in (top + 1)..path.len().saturating_sub(1) {
            notpeering.insert((&path[i], &path[i + 1]));
        }
    }

    info!("Assigning p2p relationships");
    for path in sure_paths.iter() {
        for (u, v) in path.iter().tuple_windows() {
            if notpeering.contains(&(u, v)) || notpeering.contains(&(v, u)) {
                continue;
            }
            let (deg_u, deg_v) = (degree(&degrees, u), degree(&degrees, v));
            if deg_v == 0 {
                continue;
            }
            let ratio = deg_u as f64 / deg_v as f64;
            if ratio < params.degree_ratio && ratio > 1.0 / params.degree_ratio {
                inference.assign(u, v, AsRelation::PeerToPeer);
            }
        }
    }

    info!("Determined relationships: {}", inference.counts());
    inference
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links_from(pairs: &[(&str, &str)]) -> BTreeMap<Asn, BTreeSet<Asn>> {
        let mut links: BTreeMap<Asn, BTreeSet<Asn>> = BTreeMap::new();
        for (u, v) in pairs {
            links.entry(u.to_string()).or_default().insert(v.to_string());
            links.entry(v.to_string()).or_default().insert(u.to_string());
        }
        links
    }

    fn index_from(paths: &[&[&str]]) -> SurePathIndex {
        let mut index = SurePathIndex::default();
        for path in paths {
            let owned: Vec<Asn> = path.iter().map(|h| h.to_string()).collect();
            index.insert_observed(&owned);
        }
        index
    }

    #[test]
    fn test_transit_classification() {
        // 2 is the top provider (degree 3); a tight degree-ratio bound
        // keeps the up/down labels from being upgraded to p2p.
        let links = links_from(&[("1", "2"), ("2", "3"), ("2", "4")]);
        let index = index_from(&[&["1", "2", "3"]]);
        let params = GaoParams {
            transit_threshold: 1,
            degree_ratio: 1.5,
        };
        let inference = infer_relationships(&links, &index, &params);

        assert_eq!(inference.get("1", "2"), Some(AsRelation::CustomerToProvider));
        assert_eq!(inference.get("2", "1"), Some(AsRelation::ProviderToCustomer));
        assert_eq!(inference.get("2", "3"), Some(AsRelation::ProviderToCustomer));
        assert_eq!(inference.get("3", "2"), Some(AsRelation::CustomerToProvider));
    }

    #[test]
    fn test_degree_ratio_upgrade_to_p2p() {
        let links = links_from(&[("1", "2"), ("2", "3")]);
        let index = index_from(&[&["1", "2", "3"]]);
        let inference = infer_relationships(&links, &index, &GaoParams::default());

        // Degrees 1:2 are well inside the default ratio of 60, and the
        // short path leaves no non-peering marks.
        assert_eq!(inference.get("1", "2"), Some(AsRelation::PeerToPeer));
        assert_eq!(inference.get("2", "1"), Some(AsRelation::PeerToPeer));
        let counts = inference.counts();
        assert_eq!(counts.p2p, 2);
        assert_eq!(counts.p2c + counts.c2p + counts.sibling, 0);
    }

    #[test]
    fn test_non_peering_mask_blocks_upgrade() {
        // Chain 1-2-3-4-5 with extra fan-out on 4 making it the top
        // provider of the full path; adjacencies two or more hops below
        // it are marked not-peerable.
        let links = links_from(&[
            ("1", "2"),
            ("2", "3"),
            ("3", "4"),
            ("4", "5"),
            ("4", "6"),
            ("4", "7"),
        ]);
        let index = index_from(&[&["1", "2", "3", "4", "5"]]);
        let inference = infer_relationships(&links, &index, &GaoParams::default());

        // (1,2) sits below the top provider (index 3) with i < t-1.
        assert_ne!(inference.get("1", "2"), Some(AsRelation::PeerToPeer));
        // The straddling adjacency (3,4) stays eligible for peering, but
        // the degree gap 2:5 still falls inside the default ratio, so it
        // upgrades.
        assert_eq!(inference.get("3", "4"), Some(AsRelation::PeerToPeer));
    }

    #[test]
    fn test_inference_is_deterministic() {
        let links = links_from(&[
            ("1", "2"),
            ("2", "3"),
            ("3", "4"),
            ("2", "5"),
            ("5", "3"),
        ]);
        let index = index_from(&[&["1", "2", "3", "4"], &["1", "2", "5"], &["5", "3", "4"]]);
        let first = infer_relationships(&links, &index, &GaoParams::default());
        let second = infer_relationships(&links, &index, &GaoParams::default());
        assert_eq!(first.counts(), second.counts());
        assert_eq!(first.to_records(), second.to_records());
    }

    #[test]
    fn test_inverse_consistency() {
        let links = links_from(&[("1", "2"), ("2", "3"), ("3", "1")]);
        let index = index_from(&[&["1", "2", "3"], &["3", "1", "2"]]);
        let inference = infer_relationships(&links, &index, &GaoParams::default());
        for record in inference.to_records() {
            let reverse = inference.get(&record.as2, &record.as1).unwrap();
            assert_eq!(record.relation.inverse(), reverse);
        }
    }
}
