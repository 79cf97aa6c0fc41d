use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use itertools::Itertools;
use log::info;

use super::DatasetError;
use crate::Asn;

/// One IXP crossing observed for an ordered AS pair.
#[derive(Clone, Debug, PartialEq)]
pub struct IxpRecord {
    pub id: String,
    pub confidence: String,
}

/// IXP crossings keyed by ordered AS pair, plus the MetaIXP equivalence
/// classes used by downstream analyzers.
#[derive(Clone, Debug, Default)]
pub struct IxpTable {
    crossings: HashMap<(Asn, Asn), Vec<IxpRecord>>,
    metas: HashMap<String, String>,
}

impl IxpTable {
    /// Load the IXP datafile (`ixpid as1 as2 confidence [source]`;
    /// records flagged `bad` are dropped) and, when given, the MetaIXP
    /// file (`metaid f1 f2 ...`, stored as `"<f2>_<f1>"`).
    pub fn load(ixp_file: &Path, metaixp_file: Option<&Path>) -> Result<Self, DatasetError> {
        let mut table = IxpTable::default();
        table.load_crossings(ixp_file)?;
        if let Some(path) = metaixp_file {
            table.load_metas(path)?;
        }
        info!(
            "loaded IXP datafile with {} IXP crossings",
            table.crossing_count()
        );
        Ok(table)
    }

    fn load_crossings(&mut self, path: &Path) -> Result<(), DatasetError> {
        let file = File::open(path).map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(DatasetError::parse(
                    path,
                    lineno + 1,
                    "expected: ixpid as1 as2 confidence [source]".to_string(),
                ));
            }
            if fields[3] == "bad" {
                continue;
            }
            self.crossings
                .entry((fields[1].to_string(), fields[2].to_string()))
                .or_insert_with(Vec::new)
                .push(IxpRecord {
                    id: fields[0].to_string(),
                    confidence: fields[3].to_string(),
                });
        }
        Ok(())
    }

    fn load_metas(&mut self, path: &Path) -> Result<(), DatasetError> {
        let file = File::open(path).map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| DatasetError::Io(path.to_path_buf(), e))?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return Err(DatasetError::parse(
                    path,
                    lineno + 1,
                    "expected: metaid f1 f2 ...".to_string(),
                ));
            }
            self.metas
                .insert(fields[0].to_string(), format!("{}_{}", fields[2], fields[1]));
        }
        Ok(())
    }

    pub fn crossings(&self, as1: &str, as2: &str) -> &[IxpRecord] {
        self.crossings
            .get(&(as1.to_string(), as2.to_string()))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn crossing_count(&self) -> usize {
        self.crossings.values().map(|v| v.len()).sum()
    }

    /// MetaIXP an IXP belongs to; IXPs without a grouping stand for
    /// themselves.
    pub fn meta<'a>(&'a self, ixp: &'a str) -> &'a str {
        self.metas.get(ixp).map(|m| m.as_str()).unwrap_or(ixp)
    }

    /// The IXP ids and MetaIXP ids crossed along a rendered AS path.
    pub fn identify(&self, path: &str) -> (BTreeSet<String>, BTreeSet<String>) {
        let mut ixps = BTreeSet::new();
        for (as1, as2) in path.split_whitespace().tuple_windows() {
            for record in self.crossings(as1, as2) {
                ixps.insert(record.id.clone());
            }
        }
        let metas = ixps.iter().map(|ixp| self.meta(ixp).to_string()).collect();
        (ixps, metas)
    }
}
