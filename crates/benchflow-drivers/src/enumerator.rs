/*!
 * Reachable-address enumeration across every registered connector.
 */
use std::collections::BTreeSet;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::transport::{ConnectorHub, ResourceAddress};

/// Lists reachable addresses for type-directed search
#[derive(Debug, Clone)]
pub struct ResourceEnumerator {
    hub: ConnectorHub,
}

impl ResourceEnumerator {
    /// Create an enumerator over the connectors of `hub`
    pub fn new(hub: ConnectorHub) -> Self {
        Self { hub }
    }

    /// Every reachable address, in connector registration order.
    ///
    /// A physical device visible through several connectors is listed once,
    /// under the first connector that reported it. Connectors that fail to
    /// enumerate are logged and skipped.
    pub async fn list(&self) -> Vec<ResourceAddress> {
        let listings = join_all(self.hub.connectors().iter().map(|c| c.list_resources())).await;

        let mut seen = BTreeSet::new();
        let mut resources = Vec::new();
        for (connector, listing) in self.hub.connectors().iter().zip(listings) {
            let listing = match listing {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(connector = connector.name(), error = %e, "Failed to enumerate resources");
                    continue;
                }
            };
            for resource in listing {
                let key = match &resource.physical_id {
                    Some(id) => format!("id:{}", id),
                    None => format!("address:{}", resource.address),
                };
                if seen.insert(key) {
                    resources.push(resource);
                } else {
                    debug!(address = %resource.address, connector = connector.name(), "Duplicate resource skipped");
                }
            }
        }
        resources
    }

    /// Complete a partial address to the single resource containing it
    pub async fn complete(&self, partial: &str) -> Option<ResourceAddress> {
        let mut matches = self
            .list()
            .await
            .into_iter()
            .filter(|r| r.address.contains(partial));
        let first = matches.next()?;
        if matches.next().is_some() {
            debug!(partial, "Partial address is ambiguous");
            return None;
        }
        Some(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{SimulatedConnector, SimulatedDevice};

    fn hub() -> ConnectorHub {
        let gpib = SimulatedConnector::named("gpib")
            .with_device("GPIB0::8::INSTR", SimulatedDevice::stream().with_physical_id("sr830-1"))
            .with_device("GPIB0::24::INSTR", SimulatedDevice::stream());
        let lan = SimulatedConnector::named("lan")
            .with_device("TCPIP0::10.0.0.8::INSTR", SimulatedDevice::stream().with_physical_id("sr830-1"));
        ConnectorHub::new().with(gpib).with(lan)
    }

    #[tokio::test]
    async fn test_dedup_by_physical_id() {
        let resources = ResourceEnumerator::new(hub()).list().await;
        let addresses: Vec<&str> = resources.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec!["GPIB0::24::INSTR", "GPIB0::8::INSTR"]);
        assert!(resources.iter().all(|r| r.connector == "gpib"));
    }

    #[tokio::test]
    async fn test_complete_partial_address() {
        let enumerator = ResourceEnumerator::new(hub());
        assert_eq!(
            enumerator.complete("::24::").await.map(|r| r.address),
            Some("GPIB0::24::INSTR".to_string())
        );
        assert!(enumerator.complete("GPIB0").await.is_none());
        assert!(enumerator.complete("ASRL").await.is_none());
    }
}
