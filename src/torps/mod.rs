//! Off-line pipelines around the inference service: preprocessing Tor
//! path-simulator output into `@`-prefixed path records through the
//! querier pool, ad-hoc endpoint-pair lookups, and the analyze stage
//! that tallies which adversaries observe both ends of each stream.

mod analyze;

pub use self::analyze::{analyze, AnalyzeOptions};

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{error, info};
use rand::seq::SliceRandom;

use crate::datasets::{DatasetError, IxpTable};
use crate::querier::{AsPathQuerier, QueryCallback, DEFAULT_MAX_OUTSTANDING};
use crate::service::{AddressKind, EndpointSpec, Response};
use crate::Asn;

pub struct PreprocessOptions {
    pub tag: String,
    pub server: SocketAddr,
    pub datafiles: Vec<PathBuf>,
    pub ixp_file: PathBuf,
    pub metaixp_file: PathBuf,
    /// Fixed client AS for every sample, or...
    pub client_as: Option<Asn>,
    /// ...a file of candidate client ASes assigned per sample.
    pub client_as_file: Option<PathBuf>,
    /// Previously emitted `@PATH` records; those lookups are skipped.
    pub load_paths: Option<PathBuf>,
}

struct StreamInfo {
    count: u64,
    first_observation: String,
}

/// Print one `@PATH` (or `@ERROR`) record for a finished lookup,
/// annotated with the IXPs and MetaIXPs crossed.
fn path_callback(
    ixps: Arc<IxpTable>,
    endpoints: (String, String),
    timestamp: String,
    sample: String,
    finished: Arc<AtomicUsize>,
) -> QueryCallback {
    Box::new(move |response| {
        match response {
            Response::Error { msg } => {
                println!("@ERROR|{}:{}|{}", timestamp, sample, msg);
            }
            Response::Response { path, .. } => {
                let rendered = path.as_deref().unwrap_or("None");
                let (path_ixps, path_metas) = match &path {
                    Some(path) => ixps.identify(path),
                    None => Default::default(),
                };
                let ixp_field = if path_ixps.is_empty() {
                    "-".to_string()
                } else {
                    path_ixps.into_iter().collect::<Vec<_>>().join(" ")
                };
                let meta_field = if path_metas.is_empty() {
                    "-".to_string()
                } else {
                    path_metas.into_iter().collect::<Vec<_>>().join(" ")
                };
                println!(
                    "@PATH|{}::{}|{}|{}|{}",
                    endpoints.0, endpoints.1, rendered, ixp_field, meta_field
                );
                finished.fetch_add(1, Ordering::SeqCst);
            }
        }
    })
}

fn read_lines(path: &PathBuf) -> Result<Vec<String>, DatasetError> {
    let file = File::open(path).map_err(|e| DatasetError::Io(path.clone(), e))?;
    BufReader::new(file)
        .lines()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DatasetError::Io(path.clone(), e))
}

/// Process path-simulator output: assign each sample a client AS, skip
/// repeated streams and lookups, and query the Client-Guard and
/// Exit-Destination AS paths concurrently. Emits `@CLIENT_MAPPING`,
/// `@PATH`/`@ERROR`, `@STREAM_CTR`, `@TOTAL_STREAMS` and `@PAIR_COUNTER`
/// records on stdout.
pub async fn preprocess(options: PreprocessOptions) -> Result<(), DatasetError> {
    let ixps = Arc::new(IxpTable::load(
        &options.ixp_file,
        Some(options.metaixp_file.as_path()),
    )?);

    let client_pool: Vec<Asn> = match &options.client_as_file {
        Some(path) => read_lines(path)?
            .into_iter()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect(),
        None => Vec::new(),
    };
    if options.client_as.is_none() && client_pool.is_empty() {
        return Err(DatasetError::Parse {
            path: options
                .client_as_file
                .clone()
                .unwrap_or_else(|| PathBuf::from("-")),
            line: 0,
            reason: "no client AS configured and no usable client AS file".to_string(),
        });
    }

    // Lookups already answered in an earlier run.
    let mut completed: HashMap<(String, String), u64> = HashMap::new();
    if let Some(path) = &options.load_paths {
        for line in read_lines(path)? {
            println!("{}", line.trim());
            let fields: Vec<&str> = line.trim().split('|').collect();
            if fields.first() == Some(&"@PATH") {
                if let Some((src, dest)) = fields.get(1).and_then(|f| split_endpoints(f)) {
                    completed.insert((src, dest), 1);
                }
            }
        }
        info!("Loaded {} existing paths", completed.len());
    }

    info!("Starting querier");
    let searcher = AsPathQuerier::new(options.server, DEFAULT_MAX_OUTSTANDING);
    let finished = Arc::new(AtomicUsize::new(0));

    let mut sample_as_map: HashMap<String, Asn> = HashMap::new();
    let mut unique_streams: HashMap<(Asn, String, String, String), StreamInfo> = HashMap::new();
    let mut lines_seen: u64 = 0;

    for (file_no, datafile) in options.datafiles.iter().enumerate() {
        let lines = read_lines(datafile)?;
        let mut read = 0u64;
        let mut skipped = 0u64;

        // First line is the column header.
        for (lineno, line) in lines.iter().enumerate().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                error!("Error on line {}: expected 6 fields", lineno + 1);
                continue;
            }
            let (sample, timestamp, guard, exit, destination) =
                (fields[0], fields[1], fields[2], fields[4], fields[5]);

            // Only streams with something on both ends matter.
            if destination == "0" {
                continue;
            }
            lines_seen += 1;

            let client_as = match &options.client_as {
                Some(fixed) => fixed.clone(),
                None => match sample_as_map.get(sample) {
                    Some(assigned) => assigned.clone(),
                    None => {
                        let chosen = client_pool
                            .choose(&mut rand::thread_rng())
                            .expect("client pool checked non-empty")
                            .clone();
                        sample_as_map.insert(sample.to_string(), chosen.clone());
                        println!("@CLIENT_MAPPING|{}|{}", sample, chosen);
                        chosen
                    }
                },
            };

            read += 1;
            if read % 1000 == 0 {
                info!(
                    "File {}/{} :: Read/PreviouslySeen/UniqueStreams/Paths: {}/{}/{}/{}",
                    file_no + 1,
                    options.datafiles.len(),
                    read,
                    skipped,
                    unique_streams.len(),
                    completed.len()
                );
            }

            let stream_key = (
                client_as.clone(),
                guard.to_string(),
                exit.to_string(),
                destination.to_string(),
            );
            if let Some(info) = unique_streams.get_mut(&stream_key) {
                info.count += 1;
                *completed.entry((client_as.clone(), guard.to_string())).or_insert(0) += 1;
                *completed
                    .entry((exit.to_string(), destination.to_string()))
                    .or_insert(0) += 1;
                skipped += 1;
                continue;
            }

            let entry_guard = (client_as.clone(), guard.to_string());
            if !completed.contains_key(&entry_guard) {
                completed.insert(entry_guard, 1);
                searcher
                    .query_mixed(
                        &options.tag,
                        EndpointSpec::Typed(client_as.clone(), AddressKind::As),
                        EndpointSpec::Typed(guard.to_string(), AddressKind::Ip),
                        path_callback(
                            Arc::clone(&ixps),
                            (client_as.clone(), guard.to_string()),
                            timestamp.to_string(),
                            sample.to_string(),
                            Arc::clone(&finished),
                        ),
                    )
                    .await;
            } else {
                *completed.get_mut(&(client_as.clone(), guard.to_string())).expect("just checked") += 1;
            }

            let entry_exit = (exit.to_string(), destination.to_string());
            if !completed.contains_key(&entry_exit) {
                completed.insert(entry_exit, 1);
                searcher
                    .query_by_ip(
                        &options.tag,
                        exit,
                        destination,
                        path_callback(
                            Arc::clone(&ixps),
                            (exit.to_string(), destination.to_string()),
                            timestamp.to_string(),
                            sample.to_string(),
                            Arc::clone(&finished),
                        ),
                    )
                    .await;
            } else {
                *completed.get_mut(&entry_exit).expect("just checked") += 1;
            }

            unique_streams.insert(
                stream_key,
                StreamInfo {
                    count: 1,
                    first_observation: timestamp.to_string(),
                },
            );
        }
    }

    searcher.shutdown().await;

    info!("Printing streams");
    for ((client, guard, exit, dest), info) in &unique_streams {
        println!(
            "@STREAM_CTR|{}::{}|{}::{}|{}|{}",
            client, guard, exit, dest, info.count, info.first_observation
        );
    }
    println!("@TOTAL_STREAMS|{}", lines_seen);
    for ((src, dest), count) in &completed {
        println!("@PAIR_COUNTER|{}::{}|{}", src, dest, count);
    }
    info!("Finished {} path lookups", finished.load(Ordering::SeqCst));
    Ok(())
}

/// Look up paths for ad-hoc endpoint pairs, one `<e1>::<e2>` per line.
/// Endpoints containing dots are treated as IP-IP pairs; otherwise the
/// first is an AS and the second an IP.
pub async fn lookup_missing(
    tag: &str,
    server: SocketAddr,
    datafiles: Vec<PathBuf>,
    ixp_file: PathBuf,
    metaixp_file: PathBuf,
) -> Result<(), DatasetError> {
    let ixps = Arc::new(IxpTable::load(&ixp_file, Some(metaixp_file.as_path()))?);

    info!("Starting querier");
    let searcher = AsPathQuerier::new(server, DEFAULT_MAX_OUTSTANDING);
    let finished = Arc::new(AtomicUsize::new(0));

    for datafile in &datafiles {
        for (lineno, line) in read_lines(datafile)?.iter().enumerate() {
            let (e1, e2) = match split_endpoints(line.trim()) {
                Some(pair) => pair,
                None => {
                    error!("Error on line {}: expected <e1>::<e2>", lineno + 1);
                    continue;
                }
            };
            let callback = path_callback(
                Arc::clone(&ixps),
                (e1.clone(), e2.clone()),
                "N/A".to_string(),
                "N/A".to_string(),
                Arc::clone(&finished),
            );
            if e1.contains('.') {
                searcher.query_by_ip(tag, &e1, &e2, callback).await;
            } else {
                searcher
                    .query_mixed(
                        tag,
                        EndpointSpec::Typed(e1, AddressKind::As),
                        EndpointSpec::Typed(e2, AddressKind::Ip),
                        callback,
                    )
                    .await;
            }
        }
    }

    searcher.shutdown().await;
    info!("Finished {} path lookups", finished.load(Ordering::SeqCst));
    Ok(())
}

fn split_endpoints(field: &str) -> Option<(String, String)> {
    let mut parts = field.splitn(2, "::");
    match (parts.next(), parts.next()) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => {
            Some((a.to_string(), b.to_string()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_endpoints() {
        assert_eq!(
            split_endpoints("1::2"),
            Some(("1".to_string(), "2".to_string()))
        );
        assert_eq!(
            split_endpoints("10.0.0.1::10.0.0.2"),
            Some(("10.0.0.1".to_string(), "10.0.0.2".to_string()))
        );
        assert_eq!(split_endpoints("nodelim"), None);
    }
}
