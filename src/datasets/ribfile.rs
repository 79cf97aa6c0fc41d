use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::info;

use super::DatasetError;
use crate::store::{AsAttrs, LinkAttrs, RibOverlay, Snapshot};
use crate::utils::basename;
use crate::Asn;

/// Clean one raw AS path: order-preserving dedup of tokens, braces
/// stripped from singleton AS_SET members, parsing halted before a
/// multi-member AS_SET (tokens containing ',').
fn clean_as_path(raw: &str) -> Vec<Asn> {
    let mut seen = HashSet::new();
    let mut path = Vec::new();
    for token in raw.split_whitespace() {
        if token.contains(',') {
            break;
        }
        let token = token.trim_matches(|c| c == '{' || c == '}');
        if token.is_empty() {
            continue;
        }
        if seen.insert(token.to_string()) {
            path.push(token.to_string());
        }
    }
    path
}

/// Ingest a Routeviews text RIB (as produced by `bgpdump -M`) under a
/// RIB tag: tag-scoped AS set, bidirectional links, and the sure-path
/// index of every observed path.
pub fn load_ribfile(snapshot: &mut Snapshot, path: &Path, tag: &str) -> Result<usize, DatasetError> {
    let file = File::open(path).map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
    let reader = BufReader::new(file);
    let source = basename(path);

    let overlay = snapshot
        .tags
        .entry(tag.to_string())
        .or_insert_with(RibOverlay::default);

    let mut routes = 0;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 8 {
            return Err(DatasetError::parse(
                path,
                lineno + 1,
                format!("expected 8 pipe-delimited fields, got {}", fields.len()),
            ));
        }
        let (date, msg_type, raw_path) = (fields[1], fields[2], fields[6]);

        // Withdrawn routes carry no usable path.
        if msg_type == "W" {
            continue;
        }

        let as_path = clean_as_path(raw_path);
        if as_path.is_empty() {
            continue;
        }

        for asn in &as_path {
            overlay.graph.add_as(
                asn,
                AsAttrs {
                    source: Some(source.clone()),
                    observed_after: None,
                    observed_before: None,
                },
            );
        }
        for window in as_path.windows(2) {
            overlay.graph.add_link(
                &window[0],
                &window[1],
                LinkAttrs {
                    source: None,
                    observed: Some(date.to_string()),
                },
            );
        }
        overlay.sure_paths.insert_observed(&as_path);

        routes += 1;
        if routes % 1000 == 0 {
            info!("Processed {} lines from {}", routes, path.display());
        }
    }

    info!(
        "RIB tag '{}' now has {} ASes and {} sure paths",
        tag,
        overlay.graph.as_count(),
        overlay.sure_paths.len()
    );
    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_clean_as_path() {
        assert_eq!(clean_as_path("1 2 3"), vec!["1", "2", "3"]);
        // Prepending dedup
        assert_eq!(clean_as_path("1 1 2 2 2 3"), vec!["1", "2", "3"]);
        // Singleton AS_SET braces are stripped
        assert_eq!(clean_as_path("1 2 {3}"), vec!["1", "2", "3"]);
        // Multi-member AS_SET halts parsing
        assert_eq!(clean_as_path("1 2 {3,4} 5"), vec!["1", "2"]);
    }

    #[test]
    fn test_load_ribfile() {
        let path = std::env::temp_dir().join("aspathd-test-rib.txt");
        let mut file = File::create(&path).unwrap();
        writeln!(
            file,
            "TABLE_DUMP|1000|B|10.0.0.1|1|10.0.0.0/8|1 2 3|IGP"
        )
        .unwrap();
        writeln!(
            file,
            "TABLE_DUMP|1000|W|10.0.0.1|1|10.0.0.0/8|4 5 6|IGP"
        )
        .unwrap();
        drop(file);

        let mut snapshot = Snapshot::default();
        let routes = load_ribfile(&mut snapshot, &path, "T").unwrap();
        assert_eq!(routes, 1);
        let overlay = snapshot.tags.get("T").unwrap();
        assert!(overlay.sure_paths.lookup("1", "3").is_some());
        // Withdrawn route is ignored entirely.
        assert!(overlay.sure_paths.lookup("4", "6").is_none());
        assert_eq!(
            overlay.graph.neighbors("2").collect::<Vec<_>>(),
            vec!["1", "3"]
        );
    }
}
