use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use log::info;

use super::read_lines;
use crate::datasets::DatasetError;

pub struct AnalyzeOptions {
    /// Preprocess output files (`@PATH`/`@STREAM_CTR` records).
    pub datafiles: Vec<PathBuf>,
    /// Write `<prefix>.globals.dat`, `<prefix>.as.dat`, ... instead of a
    /// stdout summary.
    pub output_prefix: Option<String>,
    /// Record endpoint pairs whose paths never arrived.
    pub log_missing: Option<PathBuf>,
    /// Also count (guard-AS, exit-AS) and (guard-IXP, exit-IXP) pairs.
    pub pairs: bool,
}

/// The AS, IXP and MetaIXP sets crossed by one looked-up path.
#[derive(Clone, Debug, Default)]
struct PathSets {
    ases: BTreeSet<String>,
    ixps: BTreeSet<String>,
    metas: BTreeSet<String>,
}

fn field_set(field: &str) -> BTreeSet<String> {
    if field == "-" || field == "None" {
        return BTreeSet::new();
    }
    field.split_whitespace().map(|f| f.to_string()).collect()
}

impl PathSets {
    fn parse(path: &str, ixps: &str, metas: Option<&str>) -> Self {
        Self {
            ases: field_set(path),
            ixps: field_set(ixps),
            metas: metas.map(field_set).unwrap_or_default(),
        }
    }
}

/// One relayed stream: the client-guard link on one side, the
/// exit-destination link on the other.
struct StreamRec {
    guard_link: String,
    exit_link: String,
    count: u64,
    guard: Option<PathSets>,
    exit: Option<PathSets>,
    counted: bool,
}

impl StreamRec {
    fn fill(&mut self, link: &str, sets: &PathSets) {
        if link == self.guard_link {
            self.guard = Some(sets.clone());
        }
        if link == self.exit_link {
            self.exit = Some(sets.clone());
        }
    }

    fn complete(&self) -> bool {
        self.guard.is_some() && self.exit.is_some()
    }
}

/// Per-adversary tallies of streams observable on both sides.
#[derive(Default)]
pub struct Stats {
    pub stream_ctr: u64,
    pub streams_comp_as: u64,
    pub streams_comp_ixp: u64,
    pub streams_comp_both: u64,
    both_as: BTreeMap<String, u64>,
    both_ixp: BTreeMap<String, u64>,
    both_meta: BTreeMap<String, u64>,
    as_pairs: BTreeMap<String, u64>,
    ixp_pairs: BTreeMap<String, u64>,
    pairs: bool,
}

impl Stats {
    fn new(pairs: bool) -> Self {
        Self {
            pairs,
            ..Self::default()
        }
    }

    pub fn compromised_by_as(&self, asn: &str) -> u64 {
        self.both_as.get(asn).copied().unwrap_or(0)
    }

    pub fn compromised_by_ixp(&self, ixp: &str) -> u64 {
        self.both_ixp.get(ixp).copied().unwrap_or(0)
    }

    /// Fold one completed stream into the tallies: any AS or IXP present
    /// on both the guard side and the exit side observes both ends of
    /// the connection.
    fn update(&mut self, stream: &StreamRec) {
        let guard = stream.guard.as_ref().expect("stream complete");
        let exit = stream.exit.as_ref().expect("stream complete");
        self.stream_ctr += stream.count;

        let mut as_comp = false;
        for asn in guard.ases.intersection(&exit.ases) {
            as_comp = true;
            self.streams_comp_as += stream.count;
            *self.both_as.entry(asn.clone()).or_insert(0) += stream.count;
        }
        let mut ixp_comp = false;
        for ixp in guard.ixps.intersection(&exit.ixps) {
            ixp_comp = true;
            self.streams_comp_ixp += stream.count;
            *self.both_ixp.entry(ixp.clone()).or_insert(0) += stream.count;
        }
        if as_comp && ixp_comp {
            self.streams_comp_both += stream.count;
        }
        for meta in guard.metas.intersection(&exit.metas) {
            *self.both_meta.entry(meta.clone()).or_insert(0) += stream.count;
        }

        if self.pairs {
            for g in &guard.ases {
                for e in &exit.ases {
                    *self
                        .as_pairs
                        .entry(format!("{},{}", g, e))
                        .or_insert(0) += stream.count;
                }
            }
            for g in &guard.ixps {
                for e in &exit.ixps {
                    *self
                        .ixp_pairs
                        .entry(format!("{},{}", g, e))
                        .or_insert(0) += stream.count;
                }
            }
        }
    }

    fn write_table(prefix: &str, kind: &str, table: &BTreeMap<String, u64>) -> io::Result<()> {
        let file = File::create(format!("{}.{}.dat", prefix, kind))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "id both")?;
        for (id, count) in table {
            writeln!(out, "{} {}", id, count)?;
        }
        Ok(())
    }

    fn write_reports(&self, prefix: &str) -> io::Result<()> {
        let file = File::create(format!("{}.globals.dat", prefix))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "n_streams streams_comp_as streams_comp_ixp streams_comp_both")?;
        writeln!(
            out,
            "{} {} {} {}",
            self.stream_ctr, self.streams_comp_as, self.streams_comp_ixp, self.streams_comp_both
        )?;
        drop(out);

        Self::write_table(prefix, "as", &self.both_as)?;
        Self::write_table(prefix, "ixp", &self.both_ixp)?;
        Self::write_table(prefix, "meta_ixp", &self.both_meta)?;
        if self.pairs {
            Self::write_table(prefix, "as_pair", &self.as_pairs)?;
            Self::write_table(prefix, "ixp_pair", &self.ixp_pairs)?;
        }
        Ok(())
    }
}

/// Consume preprocess records and tally compromise counts. Streams whose
/// paths have not arrived yet wait; a later `@PATH` record completes
/// them. Returns the stats plus the endpoint pairs still missing a path.
fn process_records<I>(lines: I, pairs: bool) -> (Stats, Vec<String>)
where
    I: IntoIterator<Item = String>,
{
    let mut stats = Stats::new(pairs);
    let mut paths: HashMap<String, PathSets> = HashMap::new();
    let mut streams: Vec<StreamRec> = Vec::new();
    let mut waiting: HashMap<String, Vec<usize>> = HashMap::new();

    for line in lines {
        let fields: Vec<&str> = line.trim().split('|').collect();
        match fields.first().copied() {
            Some("@PATH") if fields.len() >= 4 => {
                let link = fields[1].to_string();
                let sets = PathSets::parse(fields[2], fields[3], fields.get(4).copied());
                if let Some(indices) = waiting.remove(&link) {
                    for idx in indices {
                        let stream = &mut streams[idx];
                        stream.fill(&link, &sets);
                        if stream.complete() && !stream.counted {
                            stream.counted = true;
                            let stream = &streams[idx];
                            stats.update(stream);
                        }
                    }
                }
                paths.insert(link, sets);
            }
            Some("@STREAM_CTR") if fields.len() >= 4 => {
                let mut stream = StreamRec {
                    guard_link: fields[1].to_string(),
                    exit_link: fields[2].to_string(),
                    count: fields[3].parse().unwrap_or(1),
                    guard: None,
                    exit: None,
                    counted: false,
                };
                if let Some(sets) = paths.get(&stream.guard_link) {
                    stream.guard = Some(sets.clone());
                }
                if let Some(sets) = paths.get(&stream.exit_link) {
                    stream.exit = Some(sets.clone());
                }
                if stream.complete() {
                    stats.update(&stream);
                } else {
                    let idx = streams.len();
                    if stream.guard.is_none() {
                        waiting.entry(stream.guard_link.clone()).or_default().push(idx);
                    }
                    if stream.exit.is_none() {
                        waiting.entry(stream.exit_link.clone()).or_default().push(idx);
                    }
                    streams.push(stream);
                }
            }
            _ => {}
        }
    }

    let mut missing: Vec<String> = waiting.keys().cloned().collect();
    missing.sort();
    (stats, missing)
}

/// Analyze preprocess output: per adversary (AS, IXP, MetaIXP), how many
/// streams it can observe on both the client-guard and exit-destination
/// sides.
pub fn analyze(options: AnalyzeOptions) -> Result<(), DatasetError> {
    let mut lines = Vec::new();
    for datafile in &options.datafiles {
        lines.extend(read_lines(datafile)?);
    }
    let (stats, missing) = process_records(lines, options.pairs);

    info!(
        "{} streams: {} AS-compromised, {} IXP-compromised, {} both; {} paths missing",
        stats.stream_ctr,
        stats.streams_comp_as,
        stats.streams_comp_ixp,
        stats.streams_comp_both,
        missing.len()
    );

    match &options.output_prefix {
        Some(prefix) => stats
            .write_reports(prefix)
            .map_err(|e| DatasetError::Io(PathBuf::from(prefix), e))?,
        None => {
            println!(
                "streams {} comp_as {} comp_ixp {} comp_both {}",
                stats.stream_ctr, stats.streams_comp_as, stats.streams_comp_ixp,
                stats.streams_comp_both
            );
            for (asn, count) in &stats.both_as {
                println!("as {} {}", asn, count);
            }
            for (ixp, count) in &stats.both_ixp {
                println!("ixp {} {}", ixp, count);
            }
            for (meta, count) in &stats.both_meta {
                println!("meta_ixp {} {}", meta, count);
            }
        }
    }

    if let Some(path) = &options.log_missing {
        let file = File::create(path).map_err(|e| DatasetError::Io(path.clone(), e))?;
        let mut out = BufWriter::new(file);
        for link in &missing {
            writeln!(out, "{}", link).map_err(|e| DatasetError::Io(path.clone(), e))?;
        }
    }
    Ok(())
}
