/*!
 * TOML manifest drivers.
 *
 * Each `*.toml` file below a manifest root declares one driver:
 *
 * ```toml
 * [driver]
 * name = "Keithley 2000"
 * markers = ["MODEL 2000", "KEITHLEY 2000"]   # or a single string
 * capabilities = ["scpi", "dmm"]
 *
 * [contract.range]
 * kind = "enumeration"
 * members = [0.1, 1, 10, 100, 1000]
 *
 * [operations.set_range]
 * command = "SENS:VOLT:RANG {range}"
 *
 * [operations.read_voltage]
 * command = "READ?"
 * query = true
 * ```
 *
 * Command templates are rendered with `strfmt`; every `{name}` placeholder
 * must be supplied by the call.
 */
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use strfmt::strfmt;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use benchflow_core::types::Value;

use crate::contract::{CallArgs, CapabilityContract};
use crate::driver::{reply_value, Capability, Driver, DriverFactory, InstrumentCore};
use crate::error::{DriverError, Result};

use super::{DriverSource, SourceError, SourceLocation};

/// Class path prefix of manifest drivers
pub const MANIFEST_PREFIX: &str = "manifest";

/// Error reading a driver manifest
#[derive(Error, Debug)]
pub enum ManifestError {
    /// The file could not be read
    #[error("Cannot read manifest {path}: {source}")]
    Io {
        /// Manifest path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The file is not a valid manifest
    #[error("Invalid manifest {path}: {reason}")]
    Parse {
        /// Manifest path
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// No manifest root contains the class path
    #[error("No manifest for {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Markers {
    One(String),
    Many(Vec<String>),
}

impl Markers {
    fn into_vec(self) -> Vec<String> {
        match self {
            Markers::One(marker) => vec![marker],
            Markers::Many(markers) => markers,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DriverSection {
    name: Option<String>,
    markers: Option<Markers>,
    #[serde(default)]
    capabilities: Vec<String>,
}

/// One templated operation
#[derive(Debug, Clone, Deserialize)]
pub struct OperationSpec {
    /// Command template
    pub command: String,
    /// Whether a reply is read back
    #[serde(default)]
    pub query: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestFile {
    driver: DriverSection,
    #[serde(default)]
    contract: CapabilityContract,
    #[serde(default)]
    operations: BTreeMap<String, OperationSpec>,
}

/// A driver declared by a manifest file
#[derive(Debug, Clone)]
pub struct ManifestDriver {
    class_path: String,
    name: String,
    markers: Vec<String>,
    capabilities: BTreeSet<Capability>,
    contract: CapabilityContract,
    operations: Arc<BTreeMap<String, OperationSpec>>,
}

impl ManifestDriver {
    /// Parse a manifest file
    pub fn from_file<C: Into<String>>(class_path: C, path: &Path) -> std::result::Result<Self, ManifestError> {
        let content = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(class_path, &content).map_err(|reason| ManifestError::Parse {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn from_toml<C: Into<String>>(class_path: C, content: &str) -> std::result::Result<Self, String> {
        let file: ManifestFile = toml::from_str(content).map_err(|e| e.to_string())?;
        let class_path = class_path.into();
        Ok(Self {
            name: file.driver.name.unwrap_or_else(|| class_path.clone()),
            class_path,
            markers: file.driver.markers.map(Markers::into_vec).unwrap_or_default(),
            capabilities: file
                .driver
                .capabilities
                .iter()
                .map(|c| Capability::from(c.as_str()))
                .collect(),
            contract: file.contract,
            operations: Arc::new(file.operations),
        })
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl DriverFactory for ManifestDriver {
    fn class_path(&self) -> &str {
        &self.class_path
    }

    fn identity_markers(&self) -> Vec<String> {
        self.markers.clone()
    }

    fn capabilities(&self) -> BTreeSet<Capability> {
        self.capabilities.clone()
    }

    fn contract(&self) -> CapabilityContract {
        self.contract.clone()
    }

    fn build(&self, core: InstrumentCore) -> Result<Box<dyn Driver>> {
        Ok(Box::new(ManifestInstrument {
            core,
            operations: self.operations.clone(),
        }))
    }
}

#[derive(Debug)]
struct ManifestInstrument {
    core: InstrumentCore,
    operations: Arc<BTreeMap<String, OperationSpec>>,
}

#[async_trait]
impl Driver for ManifestInstrument {
    fn core(&self) -> &InstrumentCore {
        &self.core
    }

    fn operations(&self) -> Vec<&str> {
        self.operations.keys().map(String::as_str).collect()
    }

    async fn execute(&self, operation: &str, args: &CallArgs) -> Result<Value> {
        let spec = self
            .operations
            .get(operation)
            .ok_or_else(|| DriverError::UnsupportedOperation(operation.to_string()))?;

        let vars: HashMap<String, String> = args
            .specified()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect();
        let command = strfmt(&spec.command, &vars)
            .map_err(|e| DriverError::Format(format!("{}: {}", operation, e)))?;

        if spec.query {
            Ok(reply_value(self.core.query(&command).await?))
        } else {
            self.core.write(&command).await?;
            Ok(Value::Null)
        }
    }
}

/// Source walking directories of driver manifests
#[derive(Debug, Clone, Default)]
pub struct ManifestDriverSource {
    roots: Vec<PathBuf>,
}

impl ManifestDriverSource {
    /// Create a source over the given root directories
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            roots: roots.into_iter().map(|p| p.as_ref().to_path_buf()).collect(),
        }
    }

    fn class_path_for(relative: &Path) -> String {
        let mut parts = vec![MANIFEST_PREFIX.to_string()];
        parts.extend(
            relative
                .with_extension("")
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string()),
        );
        parts.join("::")
    }

    fn relative_path_for(class_path: &str) -> Option<PathBuf> {
        let rest = class_path.strip_prefix(MANIFEST_PREFIX)?.strip_prefix("::")?;
        let (dirs, stem) = match rest.rsplit_once("::") {
            Some((dirs, stem)) => (Some(dirs), stem),
            None => (None, rest),
        };
        if stem.is_empty() {
            return None;
        }
        // The stem may itself contain dots, so the extension is appended
        let mut path: PathBuf = dirs.into_iter().flat_map(|d| d.split("::")).collect();
        path.push(format!("{}.toml", stem));
        Some(path)
    }

    fn resolve(&self, class_path: &str) -> std::result::Result<ManifestDriver, ManifestError> {
        let relative =
            Self::relative_path_for(class_path).ok_or_else(|| ManifestError::NotFound(class_path.to_string()))?;
        let path = self
            .roots
            .iter()
            .map(|root| root.join(&relative))
            .find(|p| p.is_file())
            .ok_or_else(|| ManifestError::NotFound(class_path.to_string()))?;
        ManifestDriver::from_file(class_path, &path)
    }
}

impl DriverSource for ManifestDriverSource {
    fn name(&self) -> &str {
        "manifests"
    }

    fn locations(&self) -> Vec<SourceLocation> {
        let mut locations = Vec::new();
        for root in &self.roots {
            if !root.is_dir() {
                debug!(root = %root.display(), "Manifest directory does not exist");
                continue;
            }
            for entry in WalkDir::new(root).sort_by_file_name().into_iter() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(root = %root.display(), error = %e, "Skipping unreadable manifest entry");
                        continue;
                    }
                };
                let path = entry.path();
                if !entry.file_type().is_file() || path.extension().map_or(true, |ext| ext != "toml") {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(root) else {
                    continue;
                };
                locations.push(SourceLocation {
                    class_path: Self::class_path_for(relative),
                    location: relative.to_string_lossy().to_string(),
                });
            }
        }
        locations
    }

    fn provides(&self, class_path: &str) -> bool {
        Self::relative_path_for(class_path).is_some()
    }

    fn load(&self, class_path: &str) -> std::result::Result<Arc<dyn DriverFactory>, SourceError> {
        self.resolve(class_path)
            .map(|driver| Arc::new(driver) as Arc<dyn DriverFactory>)
            .map_err(|e| SourceError::new(class_path, e.to_string()))
    }
}
