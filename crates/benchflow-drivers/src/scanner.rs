/*!
 * On-demand driver discovery.
 *
 * The scanner inspects every registered [`DriverSource`], collects the
 * identity markers of each loadable driver and merges them into the
 * registry. It is only run when a registry lookup misses.
 *
 * A scan never aborts on a bad entry. Excluded locations, entries that
 * fail to load and drivers without markers are counted and skipped.
 */
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use benchflow_core::config::ScannerConfig;

use crate::catalog::builtin_source;
use crate::driver::{DriverDescriptor, DriverFactory};
use crate::registry::{DriverRegistry, RegistryError};
use crate::sources::{DriverSource, ManifestDriverSource, SourceError, SourceLocation};

/// Outcome of one scan
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// Descriptors of every marked driver found
    pub discovered: Vec<DriverDescriptor>,
    /// Registry entries the scan added
    pub added: usize,
    /// Locations skipped by the exclusion list
    pub skipped_excluded: usize,
    /// Entries that failed to load
    pub skipped_failed: usize,
    /// Drivers without identity markers
    pub skipped_unmarked: usize,
    /// When the scan started
    pub started_at: DateTime<Utc>,
    /// When the scan finished
    pub finished_at: DateTime<Utc>,
}

impl ScanReport {
    /// Wall-clock duration of the scan
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Discovers drivers across a set of sources
#[derive(Debug)]
pub struct DriverScanner {
    sources: Vec<Arc<dyn DriverSource>>,
    exclusions: Vec<String>,
    scans: AtomicUsize,
}

impl DriverScanner {
    /// Create a scanner with no sources and the default exclusion list
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            exclusions: ScannerConfig::default().exclusions,
            scans: AtomicUsize::new(0),
        }
    }

    /// Scanner over the built-in catalog and the configured manifest directories
    pub fn from_config(config: &ScannerConfig) -> Self {
        let mut scanner = Self::new()
            .with_exclusions(config.exclusions.iter().cloned())
            .with_source(builtin_source());
        if !config.manifest_dirs.is_empty() {
            scanner.add_source(Arc::new(ManifestDriverSource::new(&config.manifest_dirs)));
        }
        scanner
    }

    /// Register a source
    pub fn add_source(&mut self, source: Arc<dyn DriverSource>) {
        self.sources.push(source);
    }

    /// Builder-style [`add_source`](Self::add_source)
    pub fn with_source<S: DriverSource + 'static>(mut self, source: S) -> Self {
        self.add_source(Arc::new(source));
        self
    }

    /// Replace the exclusion list
    pub fn with_exclusions<I, S>(mut self, exclusions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusions = exclusions.into_iter().map(Into::into).collect();
        self
    }

    /// Registered sources
    pub fn sources(&self) -> &[Arc<dyn DriverSource>] {
        &self.sources
    }

    /// Number of scans run so far
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Whether a location lies under an excluded path component
    pub fn is_excluded(&self, location: &SourceLocation) -> bool {
        location.components().any(|component| {
            self.exclusions
                .iter()
                .any(|excluded| component.eq_ignore_ascii_case(excluded))
        })
    }

    /// Load a driver by class path from whichever source provides it
    pub fn load_class(&self, class_path: &str) -> Result<Arc<dyn DriverFactory>, SourceError> {
        self.sources
            .iter()
            .find(|source| source.provides(class_path))
            .ok_or_else(|| SourceError::new(class_path, "no source provides this class path"))?
            .load(class_path)
    }

    /// Inspect every source and merge the discovered markers into `registry`.
    ///
    /// The registry is persisted only when new fragments were added.
    pub async fn scan(&self, registry: &DriverRegistry) -> Result<ScanReport, RegistryError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let started_at = Utc::now();
        let mut report = ScanReport {
            discovered: Vec::new(),
            added: 0,
            skipped_excluded: 0,
            skipped_failed: 0,
            skipped_unmarked: 0,
            started_at,
            finished_at: started_at,
        };

        for source in &self.sources {
            for location in source.locations() {
                if self.is_excluded(&location) {
                    debug!(source = source.name(), location = %location.location, "Excluded from scan");
                    report.skipped_excluded += 1;
                    continue;
                }

                let factory = match source.load(&location.class_path) {
                    Ok(factory) => factory,
                    Err(e) => {
                        warn!(source = source.name(), class_path = %location.class_path, error = %e, "Skipping driver that failed to load");
                        report.skipped_failed += 1;
                        continue;
                    }
                };

                let descriptor = factory.descriptor();
                if descriptor.identity_markers.is_empty() {
                    debug!(class_path = %descriptor.class_path, "Driver declares no identity markers");
                    report.skipped_unmarked += 1;
                    continue;
                }
                report.discovered.push(descriptor);
            }
        }

        report.added = registry.merge_and_persist(&report.discovered).await?;
        report.finished_at = Utc::now();
        info!(
            discovered = report.discovered.len(),
            added = report.added,
            excluded = report.skipped_excluded,
            failed = report.skipped_failed,
            unmarked = report.skipped_unmarked,
            "Driver scan complete"
        );
        Ok(report)
    }
}

impl Default for DriverScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;
    use test_log::test;

    use super::*;
    use crate::catalog::{GenericScpiFactory, Sr830Factory};
    use crate::sources::StaticDriverSource;

    #[test(tokio::test)]
    async fn test_builtin_scan_skips_unmarked_generic() {
        let scanner = DriverScanner::new().with_source(builtin_source());
        let registry = DriverRegistry::in_memory();

        let report = scanner.scan(&registry).await.unwrap();
        assert_eq!(report.skipped_unmarked, 1);
        assert_eq!(report.skipped_failed, 0);
        assert!(report.added >= report.discovered.len());
        assert!(report.finished_at >= report.started_at);

        let hit = registry.lookup("Stanford_Research_Systems,SR830,s/n12345,ver1.07").await.unwrap();
        assert_eq!(hit.class_path, Sr830Factory::CLASS_PATH);
        assert_eq!(scanner.scan_count(), 1);
    }

    #[test(tokio::test)]
    async fn test_failed_and_excluded_entries_do_not_abort() {
        let mut source = StaticDriverSource::new("vendor").with(Arc::new(Sr830Factory));
        source.register_unavailable("vendor::MccBoard", "vendor library not installed");
        source.register_unavailable("vendor::old::Sr810", "deprecated");

        let scanner = DriverScanner::new()
            .with_exclusions(["OLD"])
            .with_source(source);
        let registry = DriverRegistry::in_memory();
        let report = scanner.scan(&registry).await.unwrap();

        assert_eq!(report.discovered.len(), 1);
        assert_eq!(report.skipped_failed, 1);
        assert_eq!(report.skipped_excluded, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[test(tokio::test)]
    async fn test_manifest_directories_and_persistence() {
        let dir = tempdir().unwrap();
        let manifests = dir.path().join("drivers");
        fs::create_dir_all(manifests.join("example")).unwrap();
        fs::write(
            manifests.join("k2000.toml"),
            "[driver]\nname = \"Keithley 2000\"\nmarkers = \"MODEL 2000\"\ncapabilities = [\"dmm\"]\n",
        )
        .unwrap();
        fs::write(
            manifests.join("example").join("demo.toml"),
            "[driver]\nname = \"Demo\"\nmarkers = \"DEMO\"\n",
        )
        .unwrap();

        let config = ScannerConfig {
            manifest_dirs: vec![manifests.to_string_lossy().into_owned()],
            ..ScannerConfig::default()
        };
        let scanner = DriverScanner::from_config(&config);
        let cache = dir.path().join("registry_cache.json");
        let registry = DriverRegistry::new(&cache);

        let report = scanner.scan(&registry).await.unwrap();
        assert_eq!(report.skipped_excluded, 1);
        assert!(cache.exists());

        let hit = registry.lookup("KEITHLEY INSTRUMENTS INC.,MODEL 2000,1234,A02").await.unwrap();
        assert_eq!(hit.class_path, "manifest::k2000");
        assert!(scanner.load_class(&hit.class_path).is_ok());
        assert!(scanner.load_class(GenericScpiFactory::CLASS_PATH).is_ok());
        assert!(scanner.load_class("nowhere::Driver").is_err());

        // A second scan finds nothing new and leaves the file alone
        let before = fs::read_to_string(&cache).unwrap();
        let report = scanner.scan(&registry).await.unwrap();
        assert_eq!(report.added, 0);
        assert_eq!(fs::read_to_string(&cache).unwrap(), before);
        assert_eq!(scanner.scan_count(), 2);
    }
}
