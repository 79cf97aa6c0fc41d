use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use serde::Deserialize;

struct Defaults {}

impl Defaults {
    fn port() -> u16 {
        9323
    }

    fn inferrer_count() -> usize {
        1
    }
}

/// Config (toml) representation of the inference service settings.
#[derive(Debug, Default, Deserialize)]
pub(super) struct ServiceConfigSpec {
    // RIB tags to serve; each gets its own processing queue and workers
    #[serde(default = "Vec::new")]
    pub(super) tags: Vec<String>,

    #[serde(default = "Defaults::port")]
    pub(super) port: u16,

    // Inference workers per tag
    #[serde(default = "Defaults::inferrer_count")]
    pub(super) inferrer_count: usize,

    // Optional IXP crossing and MetaIXP grouping datafiles
    pub(super) ixp_file: Option<PathBuf>,
    pub(super) metaixp_file: Option<PathBuf>,

    // Optional prefix -> organization table enabling IP-typed queries
    pub(super) geoip_file: Option<PathBuf>,

    // What to do with a non-empty processing queue at startup:
    // "refuse" (default), "force" or "reset"
    pub(super) seed_policy: Option<String>,
}

impl ServiceConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: ServiceConfigSpec = toml::from_str(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec: ServiceConfigSpec = toml::from_str("tags = [\"T\"]").unwrap();
        assert_eq!(spec.port, 9323);
        assert_eq!(spec.inferrer_count, 1);
        assert!(spec.seed_policy.is_none());
    }

    #[test]
    fn test_spec_full() {
        let spec: ServiceConfigSpec = toml::from_str(
            r#"
            tags = ["a", "b"]
            port = 9999
            inferrer_count = 4
            ixp_file = "ixps.txt"
            seed_policy = "reset"
            "#,
        )
        .unwrap();
        assert_eq!(spec.tags, vec!["a", "b"]);
        assert_eq!(spec.port, 9999);
        assert_eq!(spec.inferrer_count, 4);
        assert_eq!(spec.seed_policy.as_deref(), Some("reset"));
    }
}
