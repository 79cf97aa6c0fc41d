use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;

use super::DatasetError;
use crate::relations::{AsRelation, RelationRecord};
use crate::utils::normalize_asn_token;

/// Read a Gao-inference output file: a JSON array of
/// `{as1, as2, relation}` records. Unknown relation strings fail the
/// whole load.
pub fn read_gao_file(path: &Path) -> Result<Vec<RelationRecord>, DatasetError> {
    let file = File::open(path).map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| DatasetError::parse(path, e.line(), e.to_string()))
}

/// Read a CAIDA AS-relationship file: `#`-commented, `as1|as2|code`
/// where `0 = p2p`, `2 = sibling` and anything else `p2c`.
pub fn read_caida_file(path: &Path) -> Result<Vec<RelationRecord>, DatasetError> {
    let file = File::open(path).map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut fields = trimmed.split('|');
        let (as1, as2, code) = match (fields.next(), fields.next(), fields.next()) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => {
                return Err(DatasetError::parse(
                    path,
                    lineno + 1,
                    "expected as1|as2|code".to_string(),
                ))
            }
        };
        let relation = match code {
            "0" => AsRelation::PeerToPeer,
            "2" => AsRelation::Sibling,
            _ => AsRelation::ProviderToCustomer,
        };
        records.push(RelationRecord {
            as1: as1.to_string(),
            as2: as2.to_string(),
            relation,
        });
    }
    Ok(records)
}

#[derive(Deserialize)]
struct SiblingSide {
    asn: String,
}

#[derive(Deserialize)]
struct SiblingEntry {
    as1: SiblingSide,
    as2: SiblingSide,
}

/// Read a WHOIS sibling-match file: a JSON array of
/// `{as1: {asn}, as2: {asn}}` entries, every pair a sibling. AS tokens
/// are normalized (`AS` prefix stripped).
pub fn read_siblings_file(path: &Path) -> Result<Vec<RelationRecord>, DatasetError> {
    let file = File::open(path).map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
    let entries: Vec<SiblingEntry> = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| DatasetError::parse(path, e.line(), e.to_string()))?;

    Ok(entries
        .into_iter()
        .map(|entry| RelationRecord {
            as1: normalize_asn_token(&entry.as1.asn),
            as2: normalize_asn_token(&entry.as2.asn),
            relation: AsRelation::Sibling,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_read_caida_file() {
        let path = write_temp(
            "aspathd-test-caida.txt",
            "# comment\n1|2|0\n3|4|2\n5|6|-1\n",
        );
        let records = read_caida_file(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].relation, AsRelation::PeerToPeer);
        assert_eq!(records[1].relation, AsRelation::Sibling);
        assert_eq!(records[2].relation, AsRelation::ProviderToCustomer);
    }

    #[test]
    fn test_read_gao_file_rejects_unknown_relation() {
        let path = write_temp(
            "aspathd-test-gao-bad.json",
            r#"[{"as1": "1", "as2": "2", "relation": "friend"}]"#,
        );
        assert!(read_gao_file(&path).is_err());

        let good = write_temp(
            "aspathd-test-gao-good.json",
            r#"[{"as1": "1", "as2": "2", "relation": "p2c"}]"#,
        );
        let records = read_gao_file(&good).unwrap();
        assert_eq!(records[0].relation, AsRelation::ProviderToCustomer);
    }

    #[test]
    fn test_read_siblings_file() {
        let path = write_temp(
            "aspathd-test-siblings.json",
            r#"[{"as1": {"asn": "AS1"}, "as2": {"asn": "as2"}}]"#,
        );
        let records = read_siblings_file(&path).unwrap();
        assert_eq!(records[0].as1, "1");
        assert_eq!(records[0].as2, "2");
        assert_eq!(records[0].relation, AsRelation::Sibling);
    }
}
