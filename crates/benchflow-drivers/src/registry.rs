/*!
 * Driver registry.
 *
 * A persistent cache mapping identity fragments to driver class paths. The
 * on-disk form is a flat JSON object (`{"2400": "benchflow_drivers::..."}`)
 * that can be edited by hand.
 *
 * The registry is lazily loaded, only ever grows through [`merge`], and is
 * persisted only when a merge actually added entries. All access goes
 * through one async mutex so that load, merge and persist form a single
 * critical section.
 *
 * [`merge`]: DriverRegistry::merge
 */
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::driver::DriverDescriptor;

/// Error type for registry persistence
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Reading or writing the cache file failed
    #[error("Registry I/O error at {path}: {source}")]
    Io {
        /// Cache file path
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The cache file content is not a flat string map
    #[error("Registry file {path} is corrupt: {reason}")]
    Corrupt {
        /// Cache file path
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// Serializing the registry failed
    #[error("Registry serialization error: {0}")]
    Serialization(String),
}

/// A registry hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryMatch {
    /// Fragment that matched
    pub fragment: String,
    /// Driver class path
    pub class_path: String,
}

#[derive(Debug, Default)]
struct RegistryState {
    loaded: bool,
    entries: BTreeMap<String, String>,
}

impl RegistryState {
    fn merge(&mut self, descriptors: &[DriverDescriptor]) -> usize {
        let mut added = 0;
        for descriptor in descriptors {
            for marker in &descriptor.identity_markers {
                let fragment = marker.trim();
                if fragment.is_empty() || self.entries.contains_key(fragment) {
                    continue;
                }
                debug!(fragment, class_path = %descriptor.class_path, "Registry entry added");
                self.entries
                    .insert(fragment.to_string(), descriptor.class_path.clone());
                added += 1;
            }
        }
        added
    }

    fn candidates(&self, identity: &str) -> Vec<RegistryMatch> {
        let mut hits: Vec<RegistryMatch> = self
            .entries
            .iter()
            .filter(|(fragment, _)| identity.contains(fragment.as_str()))
            .map(|(fragment, class_path)| RegistryMatch {
                fragment: fragment.clone(),
                class_path: class_path.clone(),
            })
            .collect();
        // Longest fragment first; equal lengths fall back to key order
        hits.sort_by(|a, b| {
            b.fragment
                .len()
                .cmp(&a.fragment.len())
                .then_with(|| a.fragment.cmp(&b.fragment))
        });
        hits
    }
}

/// Persistent identity-fragment → class-path cache
#[derive(Debug)]
pub struct DriverRegistry {
    path: Option<PathBuf>,
    state: Mutex<RegistryState>,
}

impl DriverRegistry {
    /// Registry backed by the cache file at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Registry without a backing file
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Cache file path, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load the cache file once; later calls are no-ops.
    ///
    /// A missing or corrupt file leaves the registry empty. Returns the
    /// number of entries held afterwards.
    pub async fn load(&self) -> usize {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state);
        state.entries.len()
    }

    fn ensure_loaded(&self, state: &mut RegistryState) {
        if state.loaded {
            return;
        }
        state.loaded = true;

        let Some(path) = &self.path else {
            return;
        };
        match read_cache(path) {
            Ok(Some(entries)) => {
                info!(path = %path.display(), entries = entries.len(), "Driver registry loaded");
                // Entries merged before the load stay authoritative
                for (fragment, class_path) in entries {
                    let fragment = fragment.trim();
                    if fragment.is_empty() {
                        warn!(path = %path.display(), %class_path, "Ignoring blank registry fragment");
                        continue;
                    }
                    state.entries.entry(fragment.to_string()).or_insert(class_path);
                }
            }
            Ok(None) => {
                debug!(path = %path.display(), "No registry cache, starting empty");
            }
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable driver registry");
            }
        }
    }

    /// Find the driver for a raw identity string
    pub async fn lookup(&self, identity: &str) -> Option<RegistryMatch> {
        self.candidates(identity).await.into_iter().next()
    }

    /// Every entry whose fragment occurs in `identity`, in precedence order
    pub async fn candidates(&self, identity: &str) -> Vec<RegistryMatch> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state);
        state.candidates(identity)
    }

    /// Add fragments not yet present; existing mappings are never replaced.
    ///
    /// Returns the number of entries added. Nothing is written to disk.
    pub async fn merge(&self, descriptors: &[DriverDescriptor]) -> usize {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state);
        state.merge(descriptors)
    }

    /// Write the full mapping to the cache file
    pub async fn persist(&self) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state);
        self.write(&state.entries)
    }

    /// Merge and, when anything was added, persist, under one lock
    pub async fn merge_and_persist(&self, descriptors: &[DriverDescriptor]) -> Result<usize, RegistryError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state);
        let added = state.merge(descriptors);
        if added > 0 {
            self.write(&state.entries)?;
        }
        Ok(added)
    }

    /// Snapshot of every entry
    pub async fn entries(&self) -> BTreeMap<String, String> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state);
        state.entries.clone()
    }

    /// Number of entries
    pub async fn len(&self) -> usize {
        self.load().await
    }

    /// Whether the registry has no entries
    pub async fn is_empty(&self) -> bool {
        self.load().await == 0
    }

    fn write(&self, entries: &BTreeMap<String, String>) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| RegistryError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| RegistryError::Serialization(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;

        info!(path = %path.display(), entries = entries.len(), "Driver registry persisted");
        Ok(())
    }
}

fn read_cache(path: &Path) -> Result<Option<BTreeMap<String, String>>, RegistryError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(RegistryError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| RegistryError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// A shared driver registry that can be cloned
#[derive(Debug, Clone)]
pub struct SharedDriverRegistry(Arc<DriverRegistry>);

impl SharedDriverRegistry {
    /// Share a registry
    pub fn new(registry: DriverRegistry) -> Self {
        Self(Arc::new(registry))
    }

    /// Get a reference to the driver registry
    pub fn registry(&self) -> &DriverRegistry {
        &self.0
    }
}

impl From<DriverRegistry> for SharedDriverRegistry {
    fn from(registry: DriverRegistry) -> Self {
        Self::new(registry)
    }
}

impl AsRef<DriverRegistry> for SharedDriverRegistry {
    fn as_ref(&self) -> &DriverRegistry {
        self.registry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn descriptor(class_path: &str, markers: &[&str]) -> DriverDescriptor {
        DriverDescriptor {
            identity_markers: markers.iter().map(|m| m.to_string()).collect(),
            class_path: class_path.to_string(),
            capability_tags: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn test_substring_lookup() {
        let registry = DriverRegistry::in_memory();
        registry.merge(&[descriptor("smu::K2400", &["2400"])]).await;

        let hit = registry
            .lookup("KEITHLEY INSTRUMENTS INC.,MODEL 2400,1234")
            .await
            .unwrap();
        assert_eq!(hit.fragment, "2400");
        assert_eq!(hit.class_path, "smu::K2400");
        assert!(registry.lookup("MODEL 2000").await.is_none());
    }

    #[tokio::test]
    async fn test_longest_fragment_wins() {
        let registry = DriverRegistry::in_memory();
        registry
            .merge(&[
                descriptor("generic::Keithley", &["KEITHLEY"]),
                descriptor("smu::K2400", &["MODEL 2400"]),
                descriptor("smu::K24xx", &["MODEL 24"]),
                descriptor("a::Tie", &["ABCD"]),
                descriptor("b::Tie", &["ABCE"]),
            ])
            .await;

        let hit = registry.lookup("KEITHLEY MODEL 2400").await.unwrap();
        assert_eq!(hit.class_path, "smu::K2400");

        let tie = registry.lookup("xxABCDABCExx").await.unwrap();
        assert_eq!(tie.fragment, "ABCD");
    }

    #[tokio::test]
    async fn test_merge_never_overwrites() {
        let registry = DriverRegistry::in_memory();
        assert_eq!(registry.merge(&[descriptor("first::Driver", &["SR830", " "])]).await, 1);
        assert_eq!(registry.merge(&[descriptor("second::Driver", &["SR830", "SR844"])]).await, 1);

        let entries = registry.entries().await;
        assert_eq!(entries.get("SR830").map(String::as_str), Some("first::Driver"));
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_persist_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache").join("registry_cache.json");

        let registry = DriverRegistry::new(&path);
        let added = registry
            .merge_and_persist(&[
                descriptor("lockin::Sr830", &["SR830"]),
                descriptor("awg::K81150a", &["81150A", "81160A"]),
            ])
            .await
            .unwrap();
        assert_eq!(added, 3);

        let reloaded = DriverRegistry::new(&path);
        assert_eq!(reloaded.load().await, 3);
        assert_eq!(reloaded.entries().await, registry.entries().await);
    }

    #[tokio::test]
    async fn test_no_write_when_nothing_added() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry_cache.json");
        let registry = DriverRegistry::new(&path);

        assert_eq!(registry.merge_and_persist(&[descriptor("x::Y", &[])]).await.unwrap(), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry_cache.json");
        fs::write(&path, "{\"2400\": [1, 2").unwrap();

        let registry = DriverRegistry::new(&path);
        assert_eq!(registry.load().await, 0);
        assert!(registry.lookup("MODEL 2400").await.is_none());
    }

    #[tokio::test]
    async fn test_blank_fragment_in_cache_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry_cache.json");
        fs::write(&path, r#"{"": "catch::All", "  ": "catch::Spaces", "2400": "smu::K2400"}"#).unwrap();

        let registry = DriverRegistry::new(&path);
        assert_eq!(registry.load().await, 1);
        assert!(registry.lookup("UNKNOWN-XYZ").await.is_none());
        assert_eq!(
            registry.lookup("MODEL 2400").await.unwrap().class_path,
            "smu::K2400"
        );
    }

    #[tokio::test]
    async fn test_candidates_in_precedence_order() {
        let registry = DriverRegistry::in_memory();
        registry
            .merge(&[
                descriptor("lockin::Sr830", &["SR830"]),
                descriptor("gone::Driver", &["SR830,s/n"]),
                descriptor("lockin::Generic", &["SR8"]),
            ])
            .await;

        let fragments: Vec<String> = registry
            .candidates("Stanford_Research_Systems,SR830,s/n48212,ver1.07")
            .await
            .into_iter()
            .map(|hit| hit.fragment)
            .collect();
        assert_eq!(fragments, vec!["SR830,s/n", "SR830", "SR8"]);
        assert!(registry.candidates("MODEL 2400").await.is_empty());
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry_cache.json");
        fs::write(&path, r#"{"2400": "smu::K2400"}"#).unwrap();

        let registry = DriverRegistry::new(&path);
        assert_eq!(registry.load().await, 1);
        fs::write(&path, r#"{"2400": "smu::K2400", "SR830": "lockin::Sr830"}"#).unwrap();
        assert_eq!(registry.load().await, 1);
    }

    #[test]
    fn test_shared_registry() {
        let shared = SharedDriverRegistry::new(DriverRegistry::in_memory());
        let clone = shared.clone();
        tokio_test::block_on(async {
            clone.registry().merge(&[descriptor("x::Y", &["XY"])]).await;
            assert_eq!(shared.as_ref().len().await, 1);
        });
    }
}
