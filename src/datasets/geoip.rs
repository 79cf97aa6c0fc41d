use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::Path;

use ipnetwork::IpNetwork;
use log::info;

use super::DatasetError;
use crate::utils::normalize_asn_token;
use crate::Asn;

/// IP-to-organization table used to translate query endpoints, loaded
/// from a whitespace-delimited `prefix org...` file. Lookups are
/// longest-prefix matches.
#[derive(Clone, Debug, Default)]
pub struct OrgTable {
    // Sorted by prefix length, most specific first.
    networks: Vec<(IpNetwork, String)>,
}

impl OrgTable {
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let file = File::open(path).map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
        let mut networks = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut fields = trimmed.splitn(2, char::is_whitespace);
            let prefix = fields.next().unwrap_or("");
            let org = match fields.next() {
                Some(org) => org.trim().to_string(),
                None => {
                    return Err(DatasetError::parse(
                        path,
                        lineno + 1,
                        "expected: prefix organization".to_string(),
                    ))
                }
            };
            let network: IpNetwork = prefix.parse().map_err(|e| {
                DatasetError::parse(path, lineno + 1, format!("bad prefix '{}': {}", prefix, e))
            })?;
            networks.push((network, org));
        }
        networks.sort_by(|a, b| b.0.prefix().cmp(&a.0.prefix()));
        info!("Loaded {} organization prefixes from {}", networks.len(), path.display());
        Ok(Self { networks })
    }

    /// The organization string of the most specific prefix containing
    /// the address.
    pub fn org_by_addr(&self, addr: IpAddr) -> Option<&str> {
        self.networks
            .iter()
            .find(|(network, _)| network.contains(addr))
            .map(|(_, org)| org.as_str())
    }
}

/// First AS-number token of an organization string, with any leading
/// "AS" stripped (e.g. "AS7922 Comcast" -> "7922").
pub fn org_to_asn(org: &str) -> Option<Asn> {
    org.split_whitespace()
        .next()
        .map(normalize_asn_token)
        .filter(|token| !token.is_empty())
}
