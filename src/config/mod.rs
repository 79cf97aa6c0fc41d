mod file;

use std::io;
use std::path::PathBuf;

use file::ServiceConfigSpec;

/// What to do when a processing queue is non-empty at service start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedPolicy {
    /// Refuse to start (default).
    Refuse,
    /// Leave the queued entries in place.
    Force,
    /// Drain the queue before starting.
    Reset,
}

impl Default for SeedPolicy {
    fn default() -> Self {
        SeedPolicy::Refuse
    }
}

/// In-memory service configuration, merged from the optional TOML file
/// and command-line flags (flags win).
#[derive(Clone, Debug, Default)]
pub struct ServiceConfig {
    pub tags: Vec<String>,
    pub port: u16,
    pub inferrer_count: usize,
    pub ixp_file: Option<PathBuf>,
    pub metaixp_file: Option<PathBuf>,
    pub geoip_file: Option<PathBuf>,
    pub seed_policy: SeedPolicy,
}

/// Parse a TOML config file and return a ServiceConfig
pub fn from_file(path: &str) -> io::Result<ServiceConfig> {
    let spec = ServiceConfigSpec::from_file(path)?;
    ServiceConfig::from_spec(spec)
}

impl ServiceConfig {
    fn from_spec(spec: ServiceConfigSpec) -> io::Result<Self> {
        let seed_policy = match spec.seed_policy.as_deref() {
            None | Some("refuse") => SeedPolicy::Refuse,
            Some("force") => SeedPolicy::Force,
            Some("reset") => SeedPolicy::Reset,
            Some(other) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown seed_policy '{}'", other),
                ))
            }
        };
        Ok(Self {
            tags: spec.tags,
            port: spec.port,
            inferrer_count: spec.inferrer_count,
            ixp_file: spec.ixp_file,
            metaixp_file: spec.metaixp_file,
            geoip_file: spec.geoip_file,
            seed_policy,
        })
    }
}
