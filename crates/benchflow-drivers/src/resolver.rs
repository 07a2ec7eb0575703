/*!
 * Driver resolution.
 *
 * Turns a connection address, or a required capability, into a
 * [`ResolvedInstance`]:
 *
 * ```text
 * Start -> Probe -> Probed | ProbeFailed
 * Probed -> RegistryLookup -> Matched | Unmatched
 * Unmatched -> Scan (once) -> Matched | UnmatchedFinal
 * Matched -> CapabilityCheck -> Accept | Reject
 * Accept -> Instantiate -> Done
 * ```
 *
 * `Reject`, `UnmatchedFinal` and `ProbeFailed` fall back to the generic
 * driver when the transport supports it and no capability was required;
 * otherwise they end in [`Resolution::NotFound`]. Every path that does not
 * hand an instance to the caller closes the transport it opened.
 */
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn, Instrument};

use benchflow_core::config::{Config, ProbeConfig, ResolverConfig};
use benchflow_core::logging::operation_span;

use crate::catalog::generic_factory;
use crate::driver::{Capability, DriverFactory, ResolvedInstance};
use crate::enumerator::ResourceEnumerator;
use crate::error::ResolveError;
use crate::probe::{IdentityProbe, ProbeProfile};
use crate::registry::{DriverRegistry, SharedDriverRegistry};
use crate::scanner::DriverScanner;
use crate::transport::{ConnectorHub, SharedTransport};

/// What to resolve
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A concrete connection address
    Address(String),
    /// Any reachable device providing a capability
    Capability(Capability),
}

impl From<&str> for Target {
    fn from(address: &str) -> Self {
        Target::Address(address.to_string())
    }
}

impl From<String> for Target {
    fn from(address: String) -> Self {
        Target::Address(address)
    }
}

impl From<Capability> for Target {
    fn from(capability: Capability) -> Self {
        Target::Capability(capability)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Address(address) => f.write_str(address),
            Target::Capability(capability) => write!(f, "capability {}", capability),
        }
    }
}

/// States a resolution passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveState {
    /// Resolution started
    Start,
    /// Probing for an identity
    Probe,
    /// An identity was obtained
    Probed,
    /// No identity was obtainable
    ProbeFailed,
    /// Looking the identity up in the registry
    RegistryLookup,
    /// A driver matched the identity
    Matched,
    /// The registry had no match
    Unmatched,
    /// Scanning driver sources
    Scan,
    /// Still no match after scanning
    UnmatchedFinal,
    /// Checking the required capability
    CapabilityCheck,
    /// The matched driver was accepted
    Accept,
    /// The matched driver lacks the required capability
    Reject,
    /// Falling back to the generic driver
    Fallback,
    /// Instantiating the driver
    Instantiate,
    /// An instance was produced
    Done,
}

/// Why nothing was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    /// The device answered but could not be identified
    Unidentified,
    /// The identity matched no driver, even after a scan
    Unmatched,
    /// The matched driver lacks the required capability
    Rejected,
    /// No enumerated address yielded an acceptable driver
    NoCandidates,
}

impl fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NotFoundReason::Unidentified => "device present but unidentified",
            NotFoundReason::Unmatched => "no driver matches the identity",
            NotFoundReason::Rejected => "driver lacks the required capability",
            NotFoundReason::NoCandidates => "no reachable device provides the capability",
        };
        f.write_str(text)
    }
}

/// Result of a resolution
#[derive(Debug)]
pub enum Resolution {
    /// A driver instance, now owned by the caller
    Resolved {
        /// The instance
        instance: ResolvedInstance,
        /// States passed through
        trail: Vec<ResolveState>,
    },
    /// No driver found; not an error
    NotFound {
        /// What was being resolved
        target: String,
        /// Why nothing was found
        reason: NotFoundReason,
        /// Identity obtained from the device, if any
        identity: Option<String>,
        /// States passed through
        trail: Vec<ResolveState>,
    },
}

impl Resolution {
    /// Whether an instance was produced
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved { .. })
    }

    /// The instance, if one was produced
    pub fn instance(&self) -> Option<&ResolvedInstance> {
        match self {
            Resolution::Resolved { instance, .. } => Some(instance),
            Resolution::NotFound { .. } => None,
        }
    }

    /// Take the instance, if one was produced
    pub fn into_instance(self) -> Option<ResolvedInstance> {
        match self {
            Resolution::Resolved { instance, .. } => Some(instance),
            Resolution::NotFound { .. } => None,
        }
    }

    /// States passed through
    pub fn trail(&self) -> &[ResolveState] {
        match self {
            Resolution::Resolved { trail, .. } | Resolution::NotFound { trail, .. } => trail,
        }
    }
}

/// Per-call resolution options
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Capability the resolved driver must provide
    pub required: Option<Capability>,
    /// Whether the generic driver may be used as a fallback
    pub allow_generic: bool,
    /// Override of the probe step timeout
    pub step_timeout: Option<Duration>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            required: None,
            allow_generic: true,
            step_timeout: None,
        }
    }
}

impl ResolveOptions {
    /// Require a capability
    pub fn require(mut self, capability: Capability) -> Self {
        self.required = Some(capability);
        self
    }

    /// Forbid the generic fallback
    pub fn without_generic(mut self) -> Self {
        self.allow_generic = false;
        self
    }

    /// Override the probe step timeout
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }
}

/// Orchestrates probe, registry lookup, scan and instantiation
#[derive(Debug)]
pub struct Resolver {
    hub: ConnectorHub,
    registry: SharedDriverRegistry,
    scanner: Arc<DriverScanner>,
    probe: ProbeConfig,
    settings: ResolverConfig,
    generic: Option<Arc<dyn DriverFactory>>,
}

impl Resolver {
    /// Create a resolver with default probe and resolver settings
    pub fn new(hub: ConnectorHub, registry: SharedDriverRegistry, scanner: Arc<DriverScanner>) -> Self {
        Self {
            hub,
            registry,
            scanner,
            probe: ProbeConfig::default(),
            settings: ResolverConfig::default(),
            generic: Some(generic_factory()),
        }
    }

    /// Create a resolver wired from configuration
    pub fn from_config(config: &Config, hub: ConnectorHub) -> Self {
        let registry = SharedDriverRegistry::new(DriverRegistry::new(config.registry_cache_path()));
        let scanner = Arc::new(DriverScanner::from_config(&config.scanner));
        Self::new(hub, registry, scanner)
            .with_probe_config(config.probe.clone())
            .with_settings(config.resolver.clone())
    }

    /// Replace the probe configuration
    pub fn with_probe_config(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    /// Replace the resolver settings
    pub fn with_settings(mut self, settings: ResolverConfig) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the generic fallback driver; `None` disables the fallback
    pub fn with_generic_driver(mut self, generic: Option<Arc<dyn DriverFactory>>) -> Self {
        self.generic = generic;
        self
    }

    /// The driver registry
    pub fn registry(&self) -> &DriverRegistry {
        self.registry.registry()
    }

    /// The driver scanner
    pub fn scanner(&self) -> &DriverScanner {
        &self.scanner
    }

    /// The connector hub
    pub fn hub(&self) -> &ConnectorHub {
        &self.hub
    }

    /// An enumerator over this resolver's connectors
    pub fn enumerator(&self) -> ResourceEnumerator {
        ResourceEnumerator::new(self.hub.clone())
    }

    /// Resolve an address or a capability.
    ///
    /// `Ok(Resolution::NotFound)` covers unidentified and unmatched devices;
    /// `Err` is reserved for transport failures and unusable addresses.
    pub async fn resolve<T: Into<Target>>(
        &self,
        target: T,
        options: &ResolveOptions,
    ) -> Result<Resolution, ResolveError> {
        let target = target.into();
        let span = operation_span("resolve", "resolver");
        async move {
            match target {
                Target::Address(address) => self.resolve_address(&address, options).await,
                Target::Capability(capability) => self.find(&capability, options).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Resolve one address
    pub async fn resolve_address(
        &self,
        address: &str,
        options: &ResolveOptions,
    ) -> Result<Resolution, ResolveError> {
        let mut trail = vec![ResolveState::Start];
        let address = self.complete_address(address).await;

        let connector = self
            .hub
            .connector_for(&address)
            .ok_or_else(|| ResolveError::UnsupportedAddress(address.clone()))?;
        let transport = connector
            .open(&address)
            .await
            .map_err(|e| ResolveError::transport(&address, e))?;

        trail.push(ResolveState::Probe);
        let mut profile = ProbeProfile::from(&self.probe.for_profile(connector.name()));
        if let Some(timeout) = options.step_timeout {
            profile = profile.with_step_timeout(timeout);
        }
        let probed = match IdentityProbe::new(profile).probe(transport.clone()).await {
            Ok(probed) => probed,
            Err(e) => {
                close(&transport).await;
                return Err(ResolveError::transport(&address, e));
            }
        };

        let identity = match probed {
            Some(result) => result.identity,
            None => {
                trail.push(ResolveState::ProbeFailed);
                return self
                    .fallback(&address, None, transport, NotFoundReason::Unidentified, options, trail)
                    .await;
            }
        };
        trail.push(ResolveState::Probed);

        trail.push(ResolveState::RegistryLookup);
        self.registry().load().await;
        let factory = match self.lookup(&identity).await {
            Some(factory) => factory,
            None => {
                trail.push(ResolveState::Unmatched);
                trail.push(ResolveState::Scan);
                if let Err(e) = self.scanner.scan(self.registry()).await {
                    warn!(address = %address, error = %e, "Failed to persist scan results");
                }
                match self.lookup(&identity).await {
                    Some(factory) => factory,
                    None => {
                        trail.push(ResolveState::UnmatchedFinal);
                        return self
                            .fallback(&address, Some(identity), transport, NotFoundReason::Unmatched, options, trail)
                            .await;
                    }
                }
            }
        };
        trail.push(ResolveState::Matched);

        trail.push(ResolveState::CapabilityCheck);
        if let Some(required) = &options.required {
            if !factory.satisfies(required) {
                debug!(address = %address, class_path = factory.class_path(), %required, "Driver rejected");
                trail.push(ResolveState::Reject);
                return self
                    .fallback(&address, Some(identity), transport, NotFoundReason::Rejected, options, trail)
                    .await;
            }
        }
        trail.push(ResolveState::Accept);

        self.instantiate(&factory, &address, Some(identity), transport, trail)
            .await
    }

    /// Type-directed search across every enumerated address.
    ///
    /// Candidates are resolved one by one and the first whose driver
    /// provides `capability` is returned. Rejected instances are released
    /// before moving on; remaining addresses are never opened.
    pub async fn find(
        &self,
        capability: &Capability,
        options: &ResolveOptions,
    ) -> Result<Resolution, ResolveError> {
        let per_address = ResolveOptions {
            required: None,
            ..options.clone()
        };
        let mut trail = vec![ResolveState::Start];

        for resource in self.enumerator().list().await {
            let resolution = match self.resolve_address(&resource.address, &per_address).await {
                Ok(resolution) => resolution,
                Err(e) => {
                    warn!(address = %resource.address, error = %e, "Skipping candidate");
                    continue;
                }
            };

            match resolution {
                Resolution::Resolved { instance, trail: candidate } => {
                    trail.extend(candidate);
                    trail.push(ResolveState::CapabilityCheck);
                    if instance.satisfies(capability) {
                        trail.push(ResolveState::Accept);
                        info!(address = instance.address(), class_path = instance.class_path(), %capability, "Capability found");
                        return Ok(Resolution::Resolved { instance, trail });
                    }
                    trail.push(ResolveState::Reject);
                    debug!(address = instance.address(), class_path = instance.class_path(), %capability, "Candidate rejected");
                    if let Err(e) = instance.release().await {
                        warn!(address = %resource.address, error = %e, "Failed to release rejected candidate");
                    }
                }
                Resolution::NotFound { trail: candidate, .. } => trail.extend(candidate),
            }
        }

        info!(%capability, "No device provides the capability");
        Ok(Resolution::NotFound {
            target: Target::Capability(capability.clone()).to_string(),
            reason: NotFoundReason::NoCandidates,
            identity: None,
            trail,
        })
    }

    async fn complete_address(&self, address: &str) -> String {
        if !self.settings.expand_partial_addresses || self.hub.connector_for(address).is_some() {
            return address.to_string();
        }
        match self.enumerator().complete(address).await {
            Some(resource) => {
                debug!(partial = address, address = %resource.address, "Completed partial address");
                resource.address
            }
            None => address.to_string(),
        }
    }

    /// First registry candidate whose class still loads; stale entries are skipped
    async fn lookup(&self, identity: &str) -> Option<Arc<dyn DriverFactory>> {
        for hit in self.registry().candidates(identity).await {
            match self.scanner.load_class(&hit.class_path) {
                Ok(factory) => {
                    debug!(identity, fragment = %hit.fragment, class_path = %hit.class_path, "Registry match");
                    return Some(factory);
                }
                Err(e) => {
                    warn!(identity, fragment = %hit.fragment, class_path = %hit.class_path, error = %e, "Registry entry cannot be loaded");
                }
            }
        }
        None
    }

    async fn fallback(
        &self,
        address: &str,
        identity: Option<String>,
        transport: SharedTransport,
        reason: NotFoundReason,
        options: &ResolveOptions,
        mut trail: Vec<ResolveState>,
    ) -> Result<Resolution, ResolveError> {
        let allowed = options.required.is_none()
            && options.allow_generic
            && self.settings.generic_fallback
            && transport.supports_generic_driver();

        if let (true, Some(generic)) = (allowed, &self.generic) {
            debug!(address, %reason, class_path = generic.class_path(), "Falling back to generic driver");
            trail.push(ResolveState::Fallback);
            return self.instantiate(generic, address, identity, transport, trail).await;
        }

        close(&transport).await;
        info!(address, %reason, "No driver found");
        Ok(Resolution::NotFound {
            target: address.to_string(),
            reason,
            identity,
            trail,
        })
    }

    async fn instantiate(
        &self,
        factory: &Arc<dyn DriverFactory>,
        address: &str,
        identity: Option<String>,
        transport: SharedTransport,
        mut trail: Vec<ResolveState>,
    ) -> Result<Resolution, ResolveError> {
        trail.push(ResolveState::Instantiate);
        match ResolvedInstance::instantiate(factory, address, identity, transport.clone()) {
            Ok(instance) => {
                trail.push(ResolveState::Done);
                info!(address, class_path = instance.class_path(), "Driver resolved");
                Ok(Resolution::Resolved { instance, trail })
            }
            Err(source) => {
                close(&transport).await;
                Err(ResolveError::Instantiation {
                    class_path: factory.class_path().to_string(),
                    source,
                })
            }
        }
    }
}

async fn close(transport: &SharedTransport) {
    if let Err(e) = transport.close().await {
        warn!(address = transport.address(), error = %e, "Failed to close transport");
    }
}
