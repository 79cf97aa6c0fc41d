mod aslinks;
mod geoip;
mod ixp;
mod relfiles;
mod ribfile;

pub use aslinks::load_aslinks;
pub use geoip::{org_to_asn, OrgTable};
pub use ixp::{IxpRecord, IxpTable};
pub use relfiles::{read_caida_file, read_gao_file, read_siblings_file};
pub use ribfile::load_ribfile;

use std::error::Error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Ingest failure: either the file could not be read (fatal for the
/// command) or a record did not match the dataset's schema.
#[derive(Debug)]
pub enum DatasetError {
    Io(PathBuf, io::Error),
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

impl DatasetError {
    pub(crate) fn parse(path: &Path, line: usize, reason: String) -> Self {
        DatasetError::Parse {
            path: path.to_path_buf(),
            line,
            reason,
        }
    }
}

impl fmt::Display for DatasetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DatasetError::Io(path, err) => {
                write!(f, "Failed to open file {}: {}", path.display(), err)
            }
            DatasetError::Parse { path, line, reason } => {
                write!(f, "{}:{}: {}", path.display(), line, reason)
            }
        }
    }
}

impl Error for DatasetError {}
