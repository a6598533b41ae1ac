//! Access to the on-chain registry.
//!
//! The synchronizer only ever talks to the registry through the
//! [`RegistryClient`] and [`EventSource`] traits; [`ContractRegistry`]
//! implements both over the ledger's JSON-RPC interface.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use log::debug;

use crate::config::Config;
use crate::error::RegistryError;
use crate::types::{
    CollectionKind, Count, HostId, ImageDetail, ImageName, MemberDetail, RegistryHandle,
    ReplicaArg, TxRef,
};

pub mod abi;
pub mod contract;
#[cfg(test)]
pub mod memory;
pub mod rpc;

pub use contract::ContractRegistry;
use rpc::RpcClient;

/// Typed read/write access to the registry's collections.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn members_count(&self) -> Result<Count, RegistryError>;
    async fn member_key(&self, index: u64) -> Result<HostId, RegistryError>;
    async fn member_detail(&self, host: &str) -> Result<MemberDetail, RegistryError>;
    /// Images currently assigned to `host`.
    async fn member_images(&self, host: &str) -> Result<Vec<ImageName>, RegistryError>;

    async fn images_count(&self) -> Result<Count, RegistryError>;
    async fn image_key(&self, index: u64) -> Result<ImageName, RegistryError>;
    async fn image_detail(&self, name: &str) -> Result<ImageDetail, RegistryError>;

    /// Submits `addImage` and waits for the transaction to be confirmed.
    async fn add_image(&self, name: &str, replicas: ReplicaArg) -> Result<TxRef, RegistryError>;
    /// Submits `removeImage` and waits for the transaction to be confirmed.
    async fn remove_image(&self, name: &str) -> Result<TxRef, RegistryError>;
}

/// Raw notification as delivered by the registry, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub topics: Vec<String>,
}

/// Source of change notifications for one registry.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Starts delivering notifications relevant to `collection`.
    ///
    /// The stream never yields errors; transport failures are retried
    /// internally.  It ends only when the source shuts down.
    async fn subscribe(
        &self,
        collection: CollectionKind,
    ) -> Result<BoxStream<'static, RawEvent>, RegistryError>;
}

/// A resolved registry: its handle plus the services bound to it.
#[derive(Clone)]
pub struct RegistryLink {
    pub handle: RegistryHandle,
    pub client: Arc<dyn RegistryClient>,
    pub events: Arc<dyn EventSource>,
}

impl RegistryLink {
    pub fn from_contract(contract: Arc<ContractRegistry>) -> Self {
        Self {
            handle: contract.handle().clone(),
            client: contract.clone(),
            events: contract,
        }
    }
}

impl std::fmt::Debug for RegistryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryLink")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Outcome of probing the ledger for the configured registry.
#[derive(Debug)]
pub struct Resolution {
    /// Whether the node answered at all.
    pub connected: bool,
    pub handle: Option<RegistryHandle>,
}

/// Resolves the registry handle for the network the node is on.
///
/// Returns an unresolved handle, rather than an error, when the node is
/// unreachable, no address is configured, or the node is on a network
/// other than the configured one.
pub async fn resolve_handle(config: &Config, rpc: &RpcClient) -> Resolution {
    let chain_id = match rpc.chain_id().await {
        Ok(id) => id,
        Err(e) => {
            debug!("Cannot reach ledger at {}: {}", rpc.url(), e);
            return Resolution {
                connected: false,
                handle: None,
            };
        }
    };

    let handle = match (&config.contract_address, config.chain_id) {
        (None, _) => {
            debug!("No contract_address configured; registry unavailable");
            None
        }
        (Some(_), Some(expected)) if expected != chain_id => {
            debug!(
                "Ledger is on chain {} but registry is deployed on chain {}",
                chain_id, expected
            );
            None
        }
        (Some(address), _) => {
            debug!("Resolved registry {} on chain {}", address, chain_id);
            Some(RegistryHandle {
                address: address.clone(),
                chain_id,
                interface: config.events.clone(),
            })
        }
    };

    Resolution {
        connected: true,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_ledger_resolves_to_nothing() {
        let config = Config {
            contract_address: Some("0x00000000000000000000000000000000000000aa".into()),
            ..Config::default()
        };
        let rpc = RpcClient::local("http://127.0.0.1:1");
        let resolution = resolve_handle(&config, &rpc).await;
        assert!(!resolution.connected);
        assert!(resolution.handle.is_none());
    }
}
