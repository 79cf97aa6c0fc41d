use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::info;

use super::DatasetError;
use crate::store::{AsAttrs, LinkAttrs, Snapshot};

fn is_multi_origin(token: &str) -> bool {
    token.contains(',') || token.contains('_')
}

/// Ingest a CAIDA AS-links datafile into the base link set.
///
/// `T` lines carry the observation time range applied to subsequent
/// records; `D` lines are direct links, `I` indirect ones (accepted only
/// with `include_indirect`). Multi-origin AS tokens are discarded.
pub fn load_aslinks(
    snapshot: &mut Snapshot,
    path: &Path,
    include_indirect: bool,
) -> Result<usize, DatasetError> {
    let file = File::open(path).map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
    let reader = BufReader::new(file);

    let mut observed: Option<(String, String)> = None;
    let mut loaded = 0;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }

        if fields[0] == "T" {
            if fields.len() < 3 {
                return Err(DatasetError::parse(
                    path,
                    lineno + 1,
                    "time-range record needs two timestamps".to_string(),
                ));
            }
            observed = Some((fields[1].to_string(), fields[2].to_string()));
            continue;
        }

        let accepted = fields[0] == "D" || (include_indirect && fields[0] == "I");
        if !accepted {
            continue;
        }
        if fields.len() < 3 {
            return Err(DatasetError::parse(
                path,
                lineno + 1,
                "link record needs two AS fields".to_string(),
            ));
        }
        if is_multi_origin(fields[1]) || is_multi_origin(fields[2]) {
            continue;
        }

        let attrs = AsAttrs {
            source: None,
            observed_after: observed.as_ref().map(|o| o.0.clone()),
            observed_before: observed.as_ref().map(|o| o.1.clone()),
        };
        snapshot.base.add_as(fields[1], attrs.clone());
        snapshot.base.add_as(fields[2], attrs);
        snapshot.base.add_link(
            fields[1],
            fields[2],
            LinkAttrs {
                source: Some("caida".to_string()),
                observed: None,
            },
        );
        loaded += 1;
    }

    info!(
        "Loaded {} links for {} ASes from {}",
        loaded,
        snapshot.base.as_count(),
        path.display()
    );
    Ok(loaded)
}
