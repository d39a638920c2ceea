use std::path::PathBuf;
use std::time::Duration;

/// Fatal failures while reading a layer. Nothing downstream runs after one of these.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    #[error("layer file not found: {0:?}")]
    Missing(PathBuf),
    #[error("failed to read {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("unsupported layer format: {0:?}")]
    UnsupportedFormat(PathBuf),
    #[error("layer {0:?} has no geometry")]
    NoGeometry(PathBuf),
    #[error("layer {0:?} declares no coordinate reference system")]
    MissingCrs(PathBuf),
    #[error("unrecognised coordinate reference system '{0}'")]
    UnknownCrs(String),
    #[error("cannot reproject from {from} to {to}")]
    UnsupportedReprojection { from: String, to: String },
    #[error("reading {path:?} exceeded {limit:?}")]
    Timeout { path: PathBuf, limit: Duration },
}

/// A single feature whose geometry cannot take part in the join.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("feature {index} has no geometry")]
    Missing { index: usize },
    #[error("feature {index} has an empty geometry")]
    Empty { index: usize },
    #[error("feature {index} has non-finite coordinates")]
    NonFinite { index: usize },
    #[error("feature {index} has a ring with {positions} positions")]
    DegenerateRing { index: usize, positions: usize },
}

impl GeometryError {
    pub fn feature_index(&self) -> usize {
        match self {
            GeometryError::Missing { index }
            | GeometryError::Empty { index }
            | GeometryError::NonFinite { index }
            | GeometryError::DegenerateRing { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no suitable district/name column found in joined data. Checked: {}", .checked.join(", "))]
pub struct NoGroupingKeyError {
    pub checked: Vec<String>,
}
