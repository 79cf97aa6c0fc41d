use std::path::PathBuf;

use log::info;

use super::{ConflictRecord, RelationTable};
use crate::datasets::{read_caida_file, read_gao_file, read_siblings_file, DatasetError};

/// The three relationship datasets, applied in fixed precedence: Gao
/// inference output first, CAIDA overlaid on it, WHOIS siblings last.
/// All are optional; missing ones are skipped.
#[derive(Clone, Debug, Default)]
pub struct RelationshipSources {
    pub gao: Option<PathBuf>,
    pub caida: Option<PathBuf>,
    pub siblings: Option<PathBuf>,
}

/// Materialize the AS-relationship table from the configured sources.
/// A later source overwrites an earlier one only where they disagree;
/// every overwrite is returned as a conflict record.
pub fn load_relationships(
    table: &mut RelationTable,
    sources: &RelationshipSources,
) -> Result<Vec<ConflictRecord>, DatasetError> {
    let mut conflicts = Vec::new();

    if let Some(path) = &sources.gao {
        info!("Processing relationships from Gao");
        let records = read_gao_file(path)?;
        for record in &records {
            table.apply(record, "gao", &mut conflicts);
        }
        info!("Processed {} relationships", records.len());
    }

    if let Some(path) = &sources.caida {
        info!("Processing CAIDA relationships");
        let records = read_caida_file(path)?;
        for record in &records {
            table.apply(record, "caida", &mut conflicts);
        }
        info!("Processed {} relationships from CAIDA", records.len());
    }

    if let Some(path) = &sources.siblings {
        info!("Processing sibling data");
        let records = read_siblings_file(path)?;
        for record in &records {
            table.apply(record, "WHOIS", &mut conflicts);
        }
        info!("Processed {} sibling relationships", records.len());
    }

    Ok(conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relations::AsRelation;
    use std::fs::File;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_caida_overrides_gao_with_conflicts() {
        let gao = write_temp(
            "aspathd-test-resolver-gao.json",
            r#"[{"as1": "1", "as2": "2", "relation": "p2c"}]"#,
        );
        let caida = write_temp("aspathd-test-resolver-caida.txt", "1|2|0\n");

        let mut table = RelationTable::new();
        let conflicts = load_relationships(
            &mut table,
            &RelationshipSources {
                gao: Some(gao),
                caida: Some(caida),
                siblings: None,
            },
        )
        .unwrap();

        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].as1, "1");
        assert_eq!(conflicts[0].old, AsRelation::ProviderToCustomer);
        assert_eq!(conflicts[0].new, AsRelation::PeerToPeer);
        assert_eq!(conflicts[0].source, "caida");
        assert_eq!(conflicts[1].as1, "2");
        assert_eq!(conflicts[1].old, AsRelation::CustomerToProvider);
        assert_eq!(conflicts[1].new, AsRelation::PeerToPeer);
        assert_eq!(table.get("1", "2"), Some(AsRelation::PeerToPeer));
    }

    #[test]
    fn test_missing_sources_are_skipped() {
        let mut table = RelationTable::new();
        let conflicts =
            load_relationships(&mut table, &RelationshipSources::default()).unwrap();
        assert!(conflicts.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_inversion_invariant_after_load() {
        let caida = write_temp(
            "aspathd-test-resolver-inv.txt",
            "1|2|-1\n3|4|0\n5|6|2\n",
        );
        let mut table = RelationTable::new();
        load_relationships(
            &mut table,
            &RelationshipSources {
                gao: None,
                caida: Some(caida),
                siblings: None,
            },
        )
        .unwrap();
        for (u, v) in &[("1", "2"), ("3", "4"), ("5", "6")] {
            let forward = table.get(u, v).unwrap();
            let backward = table.get(v, u).unwrap();
            assert_eq!(forward.inverse(), backward);
        }
    }
}
