//! Load-once session state.
//!
//! Reading and joining the two layers is the only expensive step, so its
//! result is kept behind an `Arc` and shared by every interaction until the
//! files change on disk or someone calls [`DatasetCache::invalidate`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use tracing::info;

use crate::config::InputConfig;
use crate::data;
use crate::error::DataLoadError;
use crate::join::{self, JoinedDataset};

static GLOBAL: DatasetCache = DatasetCache::new();

/// The process-wide cache.
pub fn global() -> &'static DatasetCache {
    &GLOBAL
}

/// Reads both layers and joins them. Uncached.
pub fn load_and_join(input: &InputConfig) -> Result<JoinedDataset, DataLoadError> {
    let layers = data::load_layers(input)?;
    Ok(join::spatial_join(layers))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    path: PathBuf,
    len: u64,
    modified: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    files: Vec<FileStamp>,
    declared_crs: (Option<String>, Option<String>),
}

impl Fingerprint {
    fn of(input: &InputConfig) -> Result<Self, DataLoadError> {
        let mut files = Vec::new();
        for layer in [&input.districts, &input.restaurants] {
            files.push(stamp(layer)?);
            // shapefile attributes and projection live next to the .shp
            for sidecar in ["dbf", "prj"] {
                let path = layer.with_extension(sidecar);
                if layer.extension().is_some_and(|e| e.eq_ignore_ascii_case("shp")) && path.exists() {
                    files.push(stamp(&path)?);
                }
            }
        }
        Ok(Fingerprint {
            files,
            declared_crs: (input.districts_crs.clone(), input.restaurants_crs.clone()),
        })
    }
}

fn stamp(path: &Path) -> Result<FileStamp, DataLoadError> {
    let meta = fs::metadata(path).map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => DataLoadError::Missing(path.to_path_buf()),
        _ => DataLoadError::Unreadable { path: path.to_path_buf(), source },
    })?;
    Ok(FileStamp {
        path: path.to_path_buf(),
        len: meta.len(),
        modified: meta.modified().ok(),
    })
}

struct Cached {
    fingerprint: Fingerprint,
    dataset: Arc<JoinedDataset>,
}

pub struct DatasetCache {
    slot: Mutex<Option<Cached>>,
}

impl Default for DatasetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetCache {
    pub const fn new() -> Self {
        Self { slot: Mutex::new(None) }
    }

    /// Returns the cached dataset, loading it first if nothing is cached or the
    /// input files changed since the last load.
    pub fn get_or_load(&self, input: &InputConfig) -> Result<Arc<JoinedDataset>, DataLoadError> {
        let fingerprint = Fingerprint::of(input)?;
        let mut slot = self.lock();

        if let Some(cached) = slot.as_ref() {
            if cached.fingerprint == fingerprint {
                return Ok(Arc::clone(&cached.dataset));
            }
            info!("Input files changed, reloading");
        }

        let dataset = Arc::new(load_and_join(input)?);
        *slot = Some(Cached { fingerprint, dataset: Arc::clone(&dataset) });
        Ok(dataset)
    }

    pub fn invalidate(&self) {
        if self.lock().take().is_some() {
            info!("Dataset cache invalidated");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Cached>> {
        // the slot only ever holds a complete value, so a poisoned lock is still usable
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    const DISTRICTS: &str = r#"{"type": "FeatureCollection", "features": [
        {"type": "Feature", "properties": {"NEIGHBORHENAME": "R1"},
         "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}}
    ]}"#;

    fn restaurants(n: usize) -> String {
        let features: Vec<String> = (0..n)
            .map(|i| {
                format!(
                    r#"{{"type": "Feature", "properties": {{"id": "p{i}"}}, "geometry": {{"type": "Point", "coordinates": [0.5, 0.5]}}}}"#
                )
            })
            .collect();
        format!(r#"{{"type": "FeatureCollection", "features": [{}]}}"#, features.join(","))
    }

    fn write(path: &Path, contents: &str) {
        let mut file = File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    fn setup(dir: &TempDir) -> InputConfig {
        let districts = dir.path().join("districts.geojson");
        let restaurants_path = dir.path().join("restaurants.geojson");
        write(&districts, DISTRICTS);
        write(&restaurants_path, &restaurants(2));
        InputConfig {
            districts,
            restaurants: restaurants_path,
            load_timeout_secs: 30,
            districts_crs: None,
            restaurants_crs: None,
        }
    }

    #[test]
    fn loads_once_and_shares() {
        let dir = TempDir::new().unwrap();
        let input = setup(&dir);
        let cache = DatasetCache::new();
        assert!(!cache.is_loaded());

        let first = cache.get_or_load(&input).unwrap();
        let second = cache.get_or_load(&input).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 2);
        assert!(cache.is_loaded());
    }

    #[test]
    fn invalidate_forces_reload() {
        let dir = TempDir::new().unwrap();
        let input = setup(&dir);
        let cache = DatasetCache::new();

        let first = cache.get_or_load(&input).unwrap();
        cache.invalidate();
        assert!(!cache.is_loaded());
        let second = cache.get_or_load(&input).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn changed_file_is_picked_up() {
        let dir = TempDir::new().unwrap();
        let input = setup(&dir);
        let cache = DatasetCache::new();

        assert_eq!(cache.get_or_load(&input).unwrap().len(), 2);
        // different length, so the stamp changes even on coarse mtime filesystems
        write(&input.restaurants, &restaurants(5));
        assert_eq!(cache.get_or_load(&input).unwrap().len(), 5);
    }

    #[test]
    fn load_failure_leaves_cache_empty() {
        let dir = TempDir::new().unwrap();
        let mut input = setup(&dir);
        input.restaurants = dir.path().join("missing.geojson");
        let cache = DatasetCache::new();

        let err = cache.get_or_load(&input).unwrap_err();
        assert!(matches!(err, DataLoadError::Missing(_)));
        assert!(!cache.is_loaded());
    }
}
