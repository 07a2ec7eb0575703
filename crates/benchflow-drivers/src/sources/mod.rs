/*!
 * Driver sources.
 *
 * A driver source is anything the scanner can inspect for driver
 * implementations: the compiled-in catalog, or directories of TOML driver
 * manifests. Sources list their entries cheaply and load each one on
 * demand, so a single broken entry never prevents the others from loading.
 */
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;

use crate::driver::DriverFactory;

pub mod manifest;

pub use manifest::{ManifestDriverSource, ManifestError};

/// Failure to load one driver entry
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Failed to load {class_path}: {reason}")]
pub struct SourceError {
    /// Class path of the entry
    pub class_path: String,
    /// Why loading failed
    pub reason: String,
}

impl SourceError {
    /// Create a new source error
    pub fn new<C: Into<String>, R: Into<String>>(class_path: C, reason: R) -> Self {
        Self {
            class_path: class_path.into(),
            reason: reason.into(),
        }
    }
}

/// One inspectable entry of a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Class path the entry loads as
    pub class_path: String,
    /// Path-like location used for exclusion matching
    pub location: String,
}

impl SourceLocation {
    /// Path components of the location, split on `/`, `\` and `::`
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.location
            .split(|c: char| c == '/' || c == '\\')
            .flat_map(|part| part.split("::"))
            .filter(|part| !part.is_empty())
    }
}

/// A place driver implementations can be discovered in
pub trait DriverSource: Send + Sync + Debug {
    /// Source name for logging
    fn name(&self) -> &str;

    /// Entries available for inspection
    fn locations(&self) -> Vec<SourceLocation>;

    /// Whether `class_path` belongs to this source
    fn provides(&self, class_path: &str) -> bool;

    /// Load one entry
    fn load(&self, class_path: &str) -> Result<Arc<dyn DriverFactory>, SourceError>;
}

#[derive(Debug, Clone)]
enum StaticEntry {
    Available(Arc<dyn DriverFactory>),
    Unavailable(String),
}

/// A source of drivers compiled into the binary
#[derive(Debug, Clone, Default)]
pub struct StaticDriverSource {
    name: String,
    entries: BTreeMap<String, StaticEntry>,
}

impl StaticDriverSource {
    /// Create an empty static source
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Add a driver
    pub fn register(&mut self, factory: Arc<dyn DriverFactory>) {
        self.entries
            .insert(factory.class_path().to_string(), StaticEntry::Available(factory));
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, factory: Arc<dyn DriverFactory>) -> Self {
        self.register(factory);
        self
    }

    /// Declare a driver that exists but cannot be loaded in this build
    pub fn register_unavailable<C: Into<String>, R: Into<String>>(&mut self, class_path: C, reason: R) {
        self.entries
            .insert(class_path.into(), StaticEntry::Unavailable(reason.into()));
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the source is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DriverSource for StaticDriverSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn locations(&self) -> Vec<SourceLocation> {
        self.entries
            .keys()
            .map(|class_path| SourceLocation {
                class_path: class_path.clone(),
                location: class_path.clone(),
            })
            .collect()
    }

    fn provides(&self, class_path: &str) -> bool {
        self.entries.contains_key(class_path)
    }

    fn load(&self, class_path: &str) -> Result<Arc<dyn DriverFactory>, SourceError> {
        match self.entries.get(class_path) {
            Some(StaticEntry::Available(factory)) => Ok(factory.clone()),
            Some(StaticEntry::Unavailable(reason)) => Err(SourceError::new(class_path, reason.clone())),
            None => Err(SourceError::new(class_path, "not part of this source")),
        }
    }
}
