/*!
 * Identity probing.
 *
 * [`IdentityProbe`] asks a device who it is through a bounded sequence of
 * identification commands. Echoed commands are discarded, degenerate replies
 * move on to the next candidate, and a generic status query is accepted as a
 * last resort when its reply carries a known status phrase. Bus transports
 * are identified from the local device list instead.
 *
 * Reply timeouts abandon the current step only. Any other transport failure
 * aborts the probe and is returned as an error, distinct from `Ok(None)`
 * ("reachable but not identifiable").
 */
use std::time::Duration;

use tracing::{debug, trace};

use benchflow_core::config::ProbeConfig;
use benchflow_core::utils::{millis_to_duration, within};

use crate::error::TransportError;
use crate::transport::{SharedTransport, TransportKind};

/// A reply pattern meaning "no answer"
#[derive(Debug, Clone, PartialEq)]
pub enum DegenerateReply {
    /// Empty or whitespace-only reply
    Empty,
    /// Any reply that parses to this number
    Numeric(f64),
    /// Exact text, compared case-insensitively
    Exact(String),
}

impl DegenerateReply {
    /// Parse a configured pattern
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            DegenerateReply::Empty
        } else if let Some(n) = pattern.parse::<f64>().ok().filter(|n| n.is_finite()) {
            DegenerateReply::Numeric(n)
        } else {
            DegenerateReply::Exact(pattern.to_string())
        }
    }

    /// Whether `reply` matches this pattern
    pub fn matches(&self, reply: &str) -> bool {
        let reply = reply.trim();
        match self {
            DegenerateReply::Empty => reply.is_empty(),
            DegenerateReply::Numeric(n) => reply.parse::<f64>().map_or(false, |r| r == *n),
            DegenerateReply::Exact(text) => reply.eq_ignore_ascii_case(text),
        }
    }
}

/// Probe settings for one transport profile
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeProfile {
    /// Identification commands, tried in order
    pub identity_commands: Vec<String>,
    /// Status query used after every identification command failed
    pub status_query: Option<String>,
    /// Phrases that make a status reply acceptable
    pub status_phrases: Vec<String>,
    /// Replies treated as "no answer"
    pub degenerate: Vec<DegenerateReply>,
    /// Bound on each probe step
    pub step_timeout: Duration,
}

impl ProbeProfile {
    /// Override the per-step timeout
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Replace the identification commands
    pub fn with_identity_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identity_commands = commands.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `reply` counts as no answer
    pub fn is_degenerate(&self, reply: &str) -> bool {
        self.degenerate.iter().any(|d| d.matches(reply))
    }

    fn has_status_phrase(&self, reply: &str) -> bool {
        let reply = reply.to_lowercase();
        self.status_phrases
            .iter()
            .any(|p| !p.is_empty() && reply.contains(&p.to_lowercase()))
    }
}

impl From<&ProbeConfig> for ProbeProfile {
    fn from(config: &ProbeConfig) -> Self {
        let status_query = config.status_query.trim();
        Self {
            identity_commands: config.identity_commands.clone(),
            status_query: (!status_query.is_empty()).then(|| status_query.to_string()),
            status_phrases: config.status_phrases.clone(),
            degenerate: config
                .degenerate_responses
                .iter()
                .map(|p| DegenerateReply::parse(p))
                .collect(),
            step_timeout: millis_to_duration(config.step_timeout_ms),
        }
    }
}

impl Default for ProbeProfile {
    fn default() -> Self {
        Self::from(&ProbeConfig::default())
    }
}

/// How an identity was obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    /// Reply to an identification command
    Command(String),
    /// Status query reply containing a known phrase
    StatusQuery(String),
    /// Product name of a local bus device
    Bus,
}

/// Successful probe outcome
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Raw identity string
    pub identity: String,
    /// How it was obtained
    pub source: IdentitySource,
    /// The transport that was probed
    pub transport: SharedTransport,
}

enum StepOutcome {
    Reply(String),
    Degenerate,
}

/// Drives identification attempts over one transport handle
#[derive(Debug, Clone, Default)]
pub struct IdentityProbe {
    profile: ProbeProfile,
}

impl IdentityProbe {
    /// Create a probe with the given profile
    pub fn new(profile: ProbeProfile) -> Self {
        Self { profile }
    }

    /// The profile in use
    pub fn profile(&self) -> &ProbeProfile {
        &self.profile
    }

    /// Probe `transport` for an identity.
    ///
    /// Returns `Ok(None)` when the device answered nothing usable.
    pub async fn probe(&self, transport: SharedTransport) -> Result<Option<ProbeResult>, TransportError> {
        if transport.kind() == TransportKind::Bus {
            return self.probe_bus(transport).await;
        }

        for command in &self.profile.identity_commands {
            match self.step(&transport, command).await? {
                Some(StepOutcome::Reply(identity)) => {
                    debug!(address = transport.address(), %command, %identity, "Device identified");
                    return Ok(Some(ProbeResult {
                        identity,
                        source: IdentitySource::Command(command.clone()),
                        transport,
                    }));
                }
                Some(StepOutcome::Degenerate) => {
                    trace!(address = transport.address(), %command, "Degenerate reply");
                }
                None => {
                    trace!(address = transport.address(), %command, "No reply within step timeout");
                }
            }
        }

        if let Some(query) = &self.profile.status_query {
            if let Some(StepOutcome::Reply(status)) = self.step(&transport, query).await? {
                if self.profile.has_status_phrase(&status) {
                    debug!(address = transport.address(), %status, "Device identified by status phrase");
                    return Ok(Some(ProbeResult {
                        identity: status,
                        source: IdentitySource::StatusQuery(query.clone()),
                        transport,
                    }));
                }
                trace!(address = transport.address(), %status, "Status reply carries no known phrase");
            }
        }

        debug!(address = transport.address(), "No identity obtainable");
        Ok(None)
    }

    /// One bounded send/receive exchange. `Ok(None)` means the step timed out.
    async fn step(
        &self,
        transport: &SharedTransport,
        command: &str,
    ) -> Result<Option<StepOutcome>, TransportError> {
        let timeout = self.profile.step_timeout;
        let exchange = async {
            transport.send(command).await?;
            let mut reply = transport.receive(timeout).await?;
            if reply.trim() == command.trim() {
                trace!(address = transport.address(), %command, "Discarding echoed command");
                reply = transport.receive(timeout).await?;
            }
            Ok::<_, TransportError>(reply)
        };

        match within(timeout, exchange).await {
            None => Ok(None),
            Some(Err(TransportError::Timeout(_))) => Ok(None),
            Some(Err(e)) => Err(e),
            Some(Ok(reply)) if self.profile.is_degenerate(&reply) => Ok(Some(StepOutcome::Degenerate)),
            Some(Ok(reply)) => Ok(Some(StepOutcome::Reply(reply.trim().to_string()))),
        }
    }

    async fn probe_bus(&self, transport: SharedTransport) -> Result<Option<ProbeResult>, TransportError> {
        let devices = within(self.profile.step_timeout, transport.list_local_devices())
            .await
            .unwrap_or(Err(TransportError::Timeout(self.profile.step_timeout)))?;

        let found = devices
            .into_iter()
            .find(|d| d.matches_address(transport.address()));

        match found {
            Some(device) => {
                debug!(
                    address = transport.address(),
                    product = %device.product_name,
                    "Bus device identified"
                );
                Ok(Some(ProbeResult {
                    identity: device.product_name,
                    source: IdentitySource::Bus,
                    transport,
                }))
            }
            None => {
                debug!(address = transport.address(), "Bus device not listed");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{SimulatedConnector, SimulatedDevice};
    use crate::transport::Connector;

    async fn open(device: SimulatedDevice) -> (SimulatedConnector, SharedTransport) {
        let connector = SimulatedConnector::new().with_device("DEV", device);
        let transport = connector.open("DEV").await.unwrap();
        (connector, transport)
    }

    fn fast_probe() -> IdentityProbe {
        IdentityProbe::new(ProbeProfile::default().with_step_timeout(Duration::from_millis(50)))
    }

    #[test]
    fn test_degenerate_patterns() {
        let profile = ProbeProfile::default();
        assert!(profile.is_degenerate(""));
        assert!(profile.is_degenerate("  \r\n"));
        assert!(profile.is_degenerate("0"));
        assert!(profile.is_degenerate("+0.0"));
        assert!(!profile.is_degenerate("MODEL 2400"));
        assert!(!profile.is_degenerate("10"));
        assert!(DegenerateReply::parse("ERR").matches("err"));
    }

    #[tokio::test]
    async fn test_first_candidate_wins() {
        let (connector, transport) = open(
            SimulatedDevice::stream()
                .respond("*IDN?", "KEITHLEY INSTRUMENTS INC.,MODEL 2400,1234,C30\n")
                .respond("ID?", "should not be asked"),
        )
        .await;

        let result = fast_probe().probe(transport).await.unwrap().unwrap();
        assert_eq!(result.identity, "KEITHLEY INSTRUMENTS INC.,MODEL 2400,1234,C30");
        assert_eq!(result.source, IdentitySource::Command("*IDN?".into()));
        assert_eq!(connector.sent("DEV"), vec!["*IDN?"]);
    }

    #[tokio::test]
    async fn test_echo_is_never_the_identity() {
        let (_, transport) = open(
            SimulatedDevice::stream()
                .respond("*IDN?", "Agilent Technologies,81150A,MY1234,2.0")
                .with_echo(),
        )
        .await;

        let result = fast_probe().probe(transport).await.unwrap().unwrap();
        assert_ne!(result.identity, "*IDN?");
        assert!(result.identity.contains("81150A"));
    }

    #[tokio::test]
    async fn test_degenerate_reply_advances() {
        let (connector, transport) = open(
            SimulatedDevice::stream()
                .respond("*IDN?", "0")
                .respond("ID?", "EDC 522"),
        )
        .await;

        let result = fast_probe().probe(transport).await.unwrap().unwrap();
        assert_eq!(result.identity, "EDC 522");
        assert_eq!(result.source, IdentitySource::Command("ID?".into()));
        assert_eq!(connector.sent("DEV"), vec!["*IDN?", "ID?"]);
    }

    #[tokio::test]
    async fn test_status_phrase_fallback() {
        let (_, transport) = open(SimulatedDevice::stream().respond("U0X", "193A NDCV+1.2345E+0")).await;
        let result = fast_probe().probe(transport).await.unwrap().unwrap();
        assert_eq!(result.source, IdentitySource::StatusQuery("U0X".into()));
        assert!(result.identity.contains("NDCV"));
    }

    #[tokio::test]
    async fn test_status_without_phrase_is_inconclusive() {
        let (connector, transport) = open(SimulatedDevice::stream().respond("U0X", "READY")).await;
        assert!(fast_probe().probe(transport).await.unwrap().is_none());
        assert_eq!(connector.sent("DEV"), vec!["*IDN?", "ID?", "U0X"]);
    }

    #[tokio::test]
    async fn test_hanging_device_times_out_per_step() {
        let (connector, transport) = open(SimulatedDevice::stream().hanging()).await;
        let probe = IdentityProbe::new(ProbeProfile::default().with_step_timeout(Duration::from_millis(10)));
        assert!(probe.probe(transport).await.unwrap().is_none());
        assert_eq!(connector.sent("DEV").len(), 3);
    }

    #[tokio::test]
    async fn test_transport_failure_aborts() {
        let (_, transport) = open(SimulatedDevice::stream().respond("*IDN?", "x")).await;
        transport.close().await.unwrap();
        let err = fast_probe().probe(transport).await.unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }

    #[tokio::test]
    async fn test_bus_identity() {
        let connector = SimulatedConnector::new()
            .with_device("USB::01D3F5A2", SimulatedDevice::bus("USB-231", "01D3F5A2"))
            .with_device("USB::00AA", SimulatedDevice::bus("USB-1208FS", "00AA"));
        let transport = connector.open("USB::01D3F5A2").await.unwrap();

        let result = fast_probe().probe(transport).await.unwrap().unwrap();
        assert_eq!(result.identity, "USB-231");
        assert_eq!(result.source, IdentitySource::Bus);
    }

    #[test]
    fn test_profile_from_config() {
        let mut config = ProbeConfig::default();
        config.status_query = String::new();
        config.degenerate_responses = vec!["NaN".into(), "".into()];
        let profile = ProbeProfile::from(&config);
        assert!(profile.status_query.is_none());
        assert_eq!(profile.step_timeout, Duration::from_secs(2));
        assert!(profile.is_degenerate("nan"));
    }
}
