mod path;

pub use path::Path;

use std::collections::{btree_map, BTreeMap, BTreeSet, HashSet, VecDeque};

use log::{debug, warn};

use crate::relations::{AsRelation, RelationTable};
use crate::Asn;

/// Walking direction of the valley-free state machine.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Direction {
    Down,
    Up,
}

/// Outcome of a valley-free walk.
#[derive(Clone, Debug, PartialEq)]
pub enum ValleyCheck {
    Valid,
    Invalid,
    /// No relation is known for this pair; the candidate is rejected and
    /// the pair recorded for reporting.
    MissingData(Asn, Asn),
}

/// Walk the first `pairs` adjacencies of `hops` through the valley-free
/// state machine, relations read in path-traversal direction:
///
/// - first pair: p2p or c2p go down, p2c goes up, sibling leaves the
///   state unset
/// - Down admits only p2c
/// - Up stays up on p2c and sibling, drops to Down on p2p or c2p
///
/// Candidate paths pass `pairs = unsure hops`, which covers the expanded
/// prefix and the junction into the sure suffix; the suffix itself was
/// observed and is taken as valid.
pub fn check_valley_free(hops: &[Asn], pairs: usize, relations: &RelationTable) -> ValleyCheck {
    let mut direction: Option<Direction> = None;
    let limit = pairs.min(hops.len().saturating_sub(1));

    for i in 0..limit {
        let (u, v) = (&hops[i], &hops[i + 1]);
        let relation = match relations.get(u, v) {
            Some(rel) => rel,
            None => return ValleyCheck::MissingData(u.clone(), v.clone()),
        };
        match direction {
            None => match relation {
                AsRelation::PeerToPeer | AsRelation::CustomerToProvider => {
                    direction = Some(Direction::Down)
                }
                AsRelation::ProviderToCustomer => direction = Some(Direction::Up),
                AsRelation::Sibling => {}
            },
            Some(Direction::Down) => {
                if relation != AsRelation::ProviderToCustomer {
                    return ValleyCheck::Invalid;
                }
            }
            Some(Direction::Up) => match relation {
                AsRelation::PeerToPeer | AsRelation::CustomerToProvider => {
                    direction = Some(Direction::Down)
                }
                AsRelation::ProviderToCustomer | AsRelation::Sibling => {}
            },
        }
    }
    ValleyCheck::Valid
}

/// Iterative path-vector expansion: seed every source with a stored sure
/// path to the destination, then push candidate paths outward across the
/// composite link graph, keeping per source the preferred loop-free,
/// valley-free path.
pub struct PathVectorBuilder<'a> {
    links: &'a BTreeMap<Asn, BTreeSet<Asn>>,
    relations: &'a RelationTable,
    missing: HashSet<(Asn, Asn)>,
}

impl<'a> PathVectorBuilder<'a> {
    pub fn new(links: &'a BTreeMap<Asn, BTreeSet<Asn>>, relations: &'a RelationTable) -> Self {
        Self {
            links,
            relations,
            missing: HashSet::new(),
        }
    }

    /// Relation pairs that were missing but of interest during the run.
    pub fn missing_relations(&self) -> &HashSet<(Asn, Asn)> {
        &self.missing
    }

    /// Expand from the sure-path seeds to every reachable source and
    /// return the best path per source, the seeds included.
    pub fn infer(&mut self, seeds: Vec<(Asn, Vec<Asn>)>) -> BTreeMap<Asn, Path> {
        let mut rib_in: BTreeMap<Asn, Path> = BTreeMap::new();
        let mut seeded: HashSet<Asn> = HashSet::new();
        let mut queue: VecDeque<Asn> = VecDeque::new();
        let mut queued: HashSet<Asn> = HashSet::new();

        for (source, hops) in seeds {
            seeded.insert(source.clone());
            if queued.insert(source.clone()) {
                queue.push_back(source.clone());
            }
            rib_in.insert(source, Path::from_sure(hops));
        }

        while let Some(u) = queue.pop_front() {
            queued.remove(&u);
            let path_u = match rib_in.get(&u) {
                Some(path) => path.clone(),
                None => continue,
            };
            let neighbors = match self.links.get(&u) {
                Some(peers) => peers,
                None => continue,
            };

            for v in neighbors {
                // Sure-path holders keep their observed path.
                if seeded.contains(v) {
                    continue;
                }
                if path_u.contains(v) {
                    continue;
                }
                let candidate = path_u.prepended(v.clone());
                match check_valley_free(candidate.hops(), candidate.unsure_len(), self.relations) {
                    ValleyCheck::Valid => {}
                    ValleyCheck::Invalid => continue,
                    ValleyCheck::MissingData(a, b) => {
                        self.missing.insert((a, b));
                        continue;
                    }
                }

                let improved = match rib_in.entry(v.clone()) {
                    btree_map::Entry::Vacant(vacant) => {
                        vacant.insert(candidate);
                        true
                    }
                    btree_map::Entry::Occupied(mut occupied) => {
                        let existing = occupied.get_mut();
                        if *existing == candidate {
                            existing.bump_frequency();
                            false
                        } else if candidate.is_preferred_over(existing) {
                            *existing = candidate;
                            true
                        } else {
                            false
                        }
                    }
                };
                if improved {
                    debug!("{} got a new best path; requeueing", v);
                    if queued.insert(v.clone()) {
                        queue.push_back(v.clone());
                    }
                }
            }
        }

        if !self.missing.is_empty() {
            warn!(
                "Missing {} AS relationships that were otherwise of interest",
                self.missing.len()
            );
        }
        rib_in
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relations::{RelationRecord, RelationTable};

    fn table(entries: &[(&str, &str, AsRelation)]) -> RelationTable {
        let mut table = RelationTable::new();
        let mut conflicts = Vec::new();
        for (u, v, rel) in entries {
            table.apply(
                &RelationRecord {
                    as1: u.to_string(),
                    as2: v.to_string(),
                    relation: *rel,
                },
                "test",
                &mut conflicts,
            );
        }
        table
    }

    fn links(pairs: &[(&str, &str)]) -> BTreeMap<Asn, BTreeSet<Asn>> {
        let mut links: BTreeMap<Asn, BTreeSet<Asn>> = BTreeMap::new();
        for (u, v) in pairs {
            links.entry(u.to_string()).or_default().insert(v.to_string());
            links.entry(v.to_string()).or_default().insert(u.to_string());
        }
        links
    }

    fn hops(path: &[&str]) -> Vec<Asn> {
        path.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_valley_free_down_admits_only_p2c() {
        use AsRelation::*;
        let rels = table(&[("1", "2", PeerToPeer), ("2", "3", ProviderToCustomer)]);
        assert_eq!(
            check_valley_free(&hops(&["1", "2", "3"]), 2, &rels),
            ValleyCheck::Valid
        );

        let rels = table(&[("1", "2", PeerToPeer), ("2", "3", PeerToPeer)]);
        assert_eq!(
            check_valley_free(&hops(&["1", "2", "3"]), 2, &rels),
            ValleyCheck::Invalid
        );
    }

    #[test]
    fn test_valley_free_up_then_down() {
        use AsRelation::*;
        // p2c keeps climbing, c2p turns down, then only p2c may follow.
        let rels = table(&[
            ("1", "2", ProviderToCustomer),
            ("2", "3", CustomerToProvider),
            ("3", "4", ProviderToCustomer),
        ]);
        assert_eq!(
            check_valley_free(&hops(&["1", "2", "3", "4"]), 3, &rels),
            ValleyCheck::Valid
        );

        // Once Down, a p2p edge is a valley.
        let rels = table(&[
            ("1", "2", ProviderToCustomer),
            ("2", "3", CustomerToProvider),
            ("3", "4", PeerToPeer),
        ]);
        assert_eq!(
            check_valley_free(&hops(&["1", "2", "3", "4"]), 3, &rels),
            ValleyCheck::Invalid
        );
    }

    #[test]
    fn test_valley_free_sibling_keeps_state() {
        use AsRelation::*;
        let rels = table(&[
            ("1", "2", Sibling),
            ("2", "3", ProviderToCustomer),
            ("3", "4", Sibling),
        ]);
        assert_eq!(
            check_valley_free(&hops(&["1", "2", "3", "4"]), 3, &rels),
            ValleyCheck::Valid
        );

        // In Down state a sibling edge is not admitted.
        let rels = table(&[("1", "2", PeerToPeer), ("2", "3", Sibling)]);
        assert_eq!(
            check_valley_free(&hops(&["1", "2", "3"]), 2, &rels),
            ValleyCheck::Invalid
        );
    }

    #[test]
    fn test_valley_free_missing_relation() {
        let rels = table(&[("1", "2", AsRelation::PeerToPeer)]);
        assert_eq!(
            check_valley_free(&hops(&["1", "2", "3"]), 2, &rels),
            ValleyCheck::MissingData("2".to_string(), "3".to_string())
        );
    }

    #[test]
    fn test_walk_stops_at_sure_suffix() {
        // Only the junction pair is inspected for a candidate one hop
        // beyond its sure suffix.
        let rels = table(&[("9", "1", AsRelation::ProviderToCustomer)]);
        assert_eq!(
            check_valley_free(&hops(&["9", "1", "2", "3"]), 1, &rels),
            ValleyCheck::Valid
        );
    }

    #[test]
    fn test_seeded_paths_returned_verbatim() {
        use AsRelation::*;
        // Scenario: sure paths [1,2,3] and [4,3] toward 3.
        let graph = links(&[("1", "2"), ("2", "3"), ("4", "3"), ("1", "4")]);
        let rels = table(&[
            ("1", "2", CustomerToProvider),
            ("2", "3", CustomerToProvider),
            ("4", "3", CustomerToProvider),
            ("1", "4", PeerToPeer),
        ]);
        let mut builder = PathVectorBuilder::new(&graph, &rels);
        let result = builder.infer(vec![
            ("1".to_string(), hops(&["1", "2", "3"])),
            ("2".to_string(), hops(&["2", "3"])),
            ("4".to_string(), hops(&["4", "3"])),
        ]);

        assert_eq!(result.get("1").unwrap().render(), "1 2 3");
        assert_eq!(result.get("4").unwrap().render(), "4 3");
    }

    #[test]
    fn test_expansion_beyond_seeds() {
        use AsRelation::*;
        // 5 hangs off 1 and should learn [5,1,2,3] through it.
        let graph = links(&[("1", "2"), ("2", "3"), ("5", "1")]);
        let rels = table(&[
            ("1", "2", CustomerToProvider),
            ("2", "3", CustomerToProvider),
            ("5", "1", ProviderToCustomer),
        ]);
        let mut builder = PathVectorBuilder::new(&graph, &rels);
        let result = builder.infer(vec![
            ("1".to_string(), hops(&["1", "2", "3"])),
            ("2".to_string(), hops(&["2", "3"])),
        ]);

        assert_eq!(result.get("5").unwrap().render(), "5 1 2 3");
    }

    #[test]
    fn test_no_repeated_as_in_results() {
        use AsRelation::*;
        let graph = links(&[("1", "2"), ("2", "3"), ("3", "1"), ("5", "1"), ("5", "3")]);
        let rels = table(&[
            ("1", "2", CustomerToProvider),
            ("2", "3", CustomerToProvider),
            ("3", "1", ProviderToCustomer),
            ("5", "1", ProviderToCustomer),
            ("5", "3", ProviderToCustomer),
        ]);
        let mut builder = PathVectorBuilder::new(&graph, &rels);
        let result = builder.infer(vec![("1".to_string(), hops(&["1", "2", "3"]))]);
        for path in result.values() {
            let mut seen = HashSet::new();
            for hop in path.hops() {
                assert!(seen.insert(hop.clone()), "loop in {}", path.render());
            }
        }
    }

    #[test]
    fn test_missing_relation_recorded_not_fatal() {
        let graph = links(&[("1", "2"), ("5", "1")]);
        let rels = table(&[("1", "2", AsRelation::CustomerToProvider)]);
        let mut builder = PathVectorBuilder::new(&graph, &rels);
        let result = builder.infer(vec![("1".to_string(), hops(&["1", "2"]))]);

        // No relation for (5,1): candidate rejected, pair recorded.
        assert!(result.get("5").is_none());
        assert!(builder
            .missing_relations()
            .contains(&("5".to_string(), "1".to_string())));
    }

    #[test]
    fn test_shorter_path_preferred() {
        use AsRelation::*;
        // 5 can reach 3 via 1 (3 hops) or via 4 (2 hops to the seed's
        // suffix): [5,4,3] must win over [5,1,2,3].
        let graph = links(&[("1", "2"), ("2", "3"), ("4", "3"), ("5", "1"), ("5", "4")]);
        let rels = table(&[
            ("1", "2", CustomerToProvider),
            ("2", "3", CustomerToProvider),
            ("4", "3", CustomerToProvider),
            ("5", "1", ProviderToCustomer),
            ("5", "4", ProviderToCustomer),
        ]);
        let mut builder = PathVectorBuilder::new(&graph, &rels);
        let result = builder.infer(vec![
            ("1".to_string(), hops(&["1", "2", "3"])),
            ("2".to_string(), hops(&["2", "3"])),
            ("4".to_string(), hops(&["4", "3"])),
        ]);
        assert_eq!(result.get("5").unwrap().render(), "5 4 3");
    }
}
