use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Args as ClapArgs, Parser, Subcommand};
use env_logger::Builder;
use log::{error, info, warn, LevelFilter};

use aspathd::config::{self, SeedPolicy, ServiceConfig};
use aspathd::datasets::{load_aslinks, load_ribfile, DatasetError};
use aspathd::gao::{self, GaoParams};
use aspathd::relations::{load_relationships, RelationshipSources};
use aspathd::service::{self, ServiceError};
use aspathd::store::{Snapshot, StoreError};
use aspathd::torps;
use aspathd::utils::confirm;

#[derive(Parser, Debug)]
#[clap(name = "aspathd", about = "AS-level path inference service", version)]
struct Args {
    /// Path of the graph-store snapshot
    #[clap(long, global = true, default_value = "aspathd.db.json")]
    db: PathBuf,
    /// Sets the level of logging verbosity
    #[clap(short = 'v', parse(from_occurrences), global = true)]
    verbose: u64,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load datasets into the graph store
    #[clap(subcommand)]
    Load(LoadCommand),
    /// Start the AS-path inference service
    Infer(InferArgs),
    /// Auxiliary analyses
    #[clap(subcommand)]
    Extra(ExtraCommand),
    /// Delete graph data from the store
    Clean(CleanArgs),
    /// List miscellaneous information
    List(ListArgs),
}

#[derive(Subcommand, Debug)]
enum LoadCommand {
    /// CAIDA AS-links datafile
    Aslinks {
        path: PathBuf,
        /// Include links CAIDA has flagged as indirect
        #[clap(long)]
        include_indirect: bool,
    },
    /// Routeviews RIB in text format, as output by 'bgpdump -M'
    Ribfile {
        path: PathBuf,
        /// Tag for the routes parsed from this RIB (probably a timestamp)
        #[clap(short, long)]
        tag: String,
    },
    /// AS relationships: Gao output first, CAIDA overlaid, WHOIS siblings last
    Asrels {
        /// Output file of Gao relationship inference
        #[clap(long)]
        gao: Option<PathBuf>,
        /// CAIDA AS relationship datafile
        #[clap(long)]
        caida: Option<PathBuf>,
        /// WHOIS sibling match dataset
        #[clap(long)]
        siblings: Option<PathBuf>,
        /// A file to log all conflicts to
        #[clap(long)]
        conflict_log: Option<PathBuf>,
    },
}

#[derive(ClapArgs, Debug)]
struct InferArgs {
    /// The RIB tags to include above the base
    #[clap(long, multiple_values = true)]
    tags: Vec<String>,
    /// The number of inferrers per tag
    #[clap(short = 'c', long)]
    inferrer_count: Option<usize>,
    /// Include notes about IXP crossings from this datafile
    #[clap(long, value_name = "IXP_DATAFILE")]
    include_ixps: Option<PathBuf>,
    /// MetaIXP groupings accompanying the IXP datafile
    #[clap(long, value_name = "METAIXP_DATAFILE")]
    meta_ixps: Option<PathBuf>,
    /// Translate IP addresses in queries using this prefix->org table
    #[clap(long, value_name = "GEOIP_TABLE")]
    translate_ips: Option<PathBuf>,
    /// TCP port to listen on
    #[clap(short, long)]
    port: Option<u16>,
    /// TOML service config; explicit flags override its values
    #[clap(long)]
    config: Option<String>,
    /// Leave existing elements in the processing queue
    #[clap(long, conflicts_with = "reset")]
    force: bool,
    /// Clear the processing queue before starting inferrers
    #[clap(long)]
    reset: bool,
}

#[derive(Subcommand, Debug)]
enum ExtraCommand {
    /// Apply Gao's AS relationship algorithm to a tagged graph
    GaoRelation {
        /// The tag to build the link graph from
        tag: String,
        /// Where to dump output
        outfile: PathBuf,
        /// The value of the transit threshold
        #[clap(short = 'L', default_value_t = 1)]
        transit_threshold: u32,
        /// Degree-ratio bound for two ASes to be considered p2p
        #[clap(short = 'R', default_value_t = 60.0)]
        degree_ratio: f64,
    },
    /// Identify the AS path for each path-simulator stream
    TorpsPreprocess {
        /// The tag to search for AS paths within
        tag: String,
        /// Path-simulator output files
        #[clap(required = true)]
        datafiles: Vec<PathBuf>,
        /// IXP datafile: <ixpid> <as1> <as2> <confidence> [source]
        #[clap(long, required = true, value_name = "IXP_DATAFILE")]
        ixps: PathBuf,
        /// MetaIXP datafile (organizations of IXPs)
        #[clap(long, required = true, value_name = "METAIXP_DATAFILE")]
        meta_ixps: PathBuf,
        /// Use this client AS for every sample
        #[clap(long)]
        client_as: Option<String>,
        /// Assign each sample a random client AS from this file
        #[clap(long, conflicts_with = "client_as")]
        client_as_file: Option<PathBuf>,
        /// Previously emitted @PATH records to skip
        #[clap(long)]
        load_paths: Option<PathBuf>,
        /// Inference service to query
        #[clap(long, default_value = "127.0.0.1:9323")]
        server: SocketAddr,
    },
    /// Infer paths for ad-hoc '<endpoint1>::<endpoint2>' pairs
    TorpsInferPath {
        /// The tag to search for AS paths within
        tag: String,
        /// Endpoints files
        #[clap(required = true)]
        datafiles: Vec<PathBuf>,
        #[clap(long, required = true, value_name = "IXP_DATAFILE")]
        ixps: PathBuf,
        #[clap(long, required = true, value_name = "METAIXP_DATAFILE")]
        meta_ixps: PathBuf,
        /// Inference service to query
        #[clap(long, default_value = "127.0.0.1:9323")]
        server: SocketAddr,
    },
    /// Tally adversaries observing both ends of preprocessed streams
    TorpsAnalyze {
        /// Preprocess output files
        #[clap(required = true)]
        datafiles: Vec<PathBuf>,
        /// Write <prefix>.globals.dat, <prefix>.as.dat, ... report files
        #[clap(long)]
        output_prefix: Option<String>,
        /// Record endpoint pairs that never got a path
        #[clap(long)]
        log_missing: Option<PathBuf>,
        /// Also count guard/exit AS and IXP pairs
        #[clap(long)]
        pairs: bool,
    },
}

#[derive(ClapArgs, Debug)]
struct CleanArgs {
    /// Clean base links from CAIDA
    #[clap(long)]
    base_links: bool,
    /// Clean AS relationship data
    #[clap(long)]
    as_rel: bool,
    /// Clean link/path data for these RIB tags
    #[clap(long, multiple_values = true)]
    rib_links: Vec<String>,
}

#[derive(ClapArgs, Debug)]
struct ListArgs {
    /// List the RIB tags that exist
    #[clap(long)]
    tags: bool,
}

enum CliError {
    /// User declined a confirmation prompt; clean abort.
    Aborted,
    Fatal(Box<dyn Error>),
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        CliError::Fatal(Box::new(err))
    }
}

impl From<DatasetError> for CliError {
    fn from(err: DatasetError) -> Self {
        CliError::Fatal(Box::new(err))
    }
}

impl From<ServiceError> for CliError {
    fn from(err: ServiceError) -> Self {
        CliError::Fatal(Box::new(err))
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Fatal(Box::new(err))
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Fatal(Box::new(err))
    }
}

fn fatal(message: String) -> CliError {
    CliError::Fatal(message.into())
}

fn main() {
    let args = Args::parse();

    let (aspathd_level, other_level) = match args.verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("aspathd"), aspathd_level)
        .filter(None, other_level)
        .init();

    match run(args) {
        Ok(()) => {}
        Err(CliError::Aborted) => process::exit(2),
        Err(CliError::Fatal(err)) => {
            error!("{}", err);
            process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<(), CliError> {
    let db = args.db.clone();
    match args.command {
        Command::Load(load) => match load {
            LoadCommand::Aslinks {
                path,
                include_indirect,
            } => {
                let mut snapshot = Snapshot::open(&db)?;
                load_aslinks(&mut snapshot, &path, include_indirect)?;
                snapshot.save(&db)?;
                Ok(())
            }
            LoadCommand::Ribfile { path, tag } => {
                let mut snapshot = Snapshot::open(&db)?;
                load_ribfile(&mut snapshot, &path, &tag)?;
                snapshot.save(&db)?;
                Ok(())
            }
            LoadCommand::Asrels {
                gao,
                caida,
                siblings,
                conflict_log,
            } => load_asrels(&db, gao, caida, siblings, conflict_log),
        },
        Command::Infer(infer) => {
            let config = merge_service_config(infer)?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(service::serve(&db, config))?;
            Ok(())
        }
        Command::Extra(extra) => match extra {
            ExtraCommand::GaoRelation {
                tag,
                outfile,
                transit_threshold,
                degree_ratio,
            } => gao_relation(&db, &tag, &outfile, transit_threshold, degree_ratio),
            ExtraCommand::TorpsPreprocess {
                tag,
                datafiles,
                ixps,
                meta_ixps,
                client_as,
                client_as_file,
                load_paths,
                server,
            } => {
                let runtime = tokio::runtime::Runtime::new()?;
                runtime.block_on(torps::preprocess(torps::PreprocessOptions {
                    tag,
                    server,
                    datafiles,
                    ixp_file: ixps,
                    metaixp_file: meta_ixps,
                    client_as,
                    client_as_file,
                    load_paths,
                }))?;
                Ok(())
            }
            ExtraCommand::TorpsInferPath {
                tag,
                datafiles,
                ixps,
                meta_ixps,
                server,
            } => {
                let runtime = tokio::runtime::Runtime::new()?;
                runtime.block_on(torps::lookup_missing(
                    &tag, server, datafiles, ixps, meta_ixps,
                ))?;
                Ok(())
            }
            ExtraCommand::TorpsAnalyze {
                datafiles,
                output_prefix,
                log_missing,
                pairs,
            } => {
                torps::analyze(torps::AnalyzeOptions {
                    datafiles,
                    output_prefix,
                    log_missing,
                    pairs,
                })?;
                Ok(())
            }
        },
        Command::Clean(clean) => clean_store(&db, clean),
        Command::List(list) => list_misc(&db, list),
    }
}

/// Merge the optional TOML config with command-line flags; flags win.
fn merge_service_config(args: InferArgs) -> Result<ServiceConfig, CliError> {
    let mut merged = match &args.config {
        Some(path) => config::from_file(path)?,
        None => ServiceConfig {
            port: 9323,
            inferrer_count: 1,
            ..ServiceConfig::default()
        },
    };
    if !args.tags.is_empty() {
        merged.tags = args.tags;
    }
    if let Some(port) = args.port {
        merged.port = port;
    }
    if let Some(count) = args.inferrer_count {
        merged.inferrer_count = count;
    }
    if args.include_ixps.is_some() {
        merged.ixp_file = args.include_ixps;
    }
    if args.meta_ixps.is_some() {
        merged.metaixp_file = args.meta_ixps;
    }
    if args.translate_ips.is_some() {
        merged.geoip_file = args.translate_ips;
    }
    if args.force {
        merged.seed_policy = SeedPolicy::Force;
    } else if args.reset {
        merged.seed_policy = SeedPolicy::Reset;
    }
    if merged.tags.is_empty() {
        return Err(fatal("no RIB tags configured; pass --tags".to_string()));
    }
    Ok(merged)
}

fn load_asrels(
    db: &Path,
    gao: Option<PathBuf>,
    caida: Option<PathBuf>,
    siblings: Option<PathBuf>,
    conflict_log: Option<PathBuf>,
) -> Result<(), CliError> {
    let mut snapshot = Snapshot::open(db)?;
    if !snapshot.relations.is_empty() {
        warn!("There appear to be existing relationships in the database.");
        if !confirm("Do you want to continue anyway?")? {
            return Err(CliError::Aborted);
        }
    }

    let sources = RelationshipSources {
        gao,
        caida,
        siblings,
    };
    let conflicts = load_relationships(&mut snapshot.relations, &sources)?;
    match conflict_log {
        Some(path) => {
            let file = File::create(&path)?;
            serde_json::to_writer(BufWriter::new(file), &conflicts)?;
            info!("Wrote {} conflicts to {}", conflicts.len(), path.display());
        }
        None => info!("Stored AS relationships with {} conflicts", conflicts.len()),
    }
    snapshot.save(db)?;
    Ok(())
}

fn gao_relation(
    db: &Path,
    tag: &str,
    outfile: &Path,
    transit_threshold: u32,
    degree_ratio: f64,
) -> Result<(), CliError> {
    let snapshot = Snapshot::open(db)?;
    let overlay = snapshot
        .tags
        .get(tag)
        .ok_or_else(|| fatal(format!("no RIB tag '{}' in the store", tag)))?;

    let links = overlay.graph.neighbor_sets();
    let params = GaoParams {
        transit_threshold,
        degree_ratio,
    };
    let inference = gao::infer_relationships(&links, &overlay.sure_paths, &params);

    let file = File::create(outfile)?;
    serde_json::to_writer(BufWriter::new(file), &inference.to_records())?;
    info!(
        "Wrote {} labeled edges to {}",
        inference.len(),
        outfile.display()
    );
    Ok(())
}

fn clean_store(db: &Path, args: CleanArgs) -> Result<(), CliError> {
    let mut snapshot = Snapshot::open(db)?;

    if args.base_links {
        info!(
            "Cleaning data for {} ASes",
            snapshot.base.as_count()
        );
        snapshot.base = Default::default();
    }

    if args.as_rel {
        info!("Cleaning AS relationship data");
        snapshot.relations.clear();
    }

    for tag in &args.rib_links {
        info!("Cleaning link/path data for RIB {}", tag);
        snapshot.tags.remove(tag);
        snapshot.queues.remove(tag);
    }

    snapshot.save(db)?;
    Ok(())
}

fn list_misc(db: &Path, args: ListArgs) -> Result<(), CliError> {
    let snapshot = Snapshot::open(db)?;
    let mut had_arg = false;

    if args.tags {
        println!("Tags:");
        for tag in snapshot.tags.keys() {
            println!(" - {}", tag);
        }
        had_arg = true;
    }

    if !had_arg {
        println!("No print requests provided. Look at the help and provide an argument");
    }
    Ok(())
}
