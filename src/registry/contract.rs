//! Registry client backed by the deployed contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::OnceCell;
use tokio::time::{sleep, timeout};

use super::abi::{self, Decoder, Token};
use super::rpc::RpcClient;
use super::{EventSource, RawEvent, RegistryClient};
use crate::error::RegistryError;
use crate::types::{
    CollectionKind, Count, HostId, ImageDetail, ImageName, MemberDetail, RegistryHandle,
    ReplicaArg, TxRef,
};

pub struct ContractRegistry {
    rpc: Arc<RpcClient>,
    handle: RegistryHandle,
    from: OnceCell<String>,
    poll_interval: Duration,
    receipt_timeout: Duration,
}

impl ContractRegistry {
    pub fn new(
        rpc: Arc<RpcClient>,
        handle: RegistryHandle,
        from_account: Option<String>,
        poll_interval: Duration,
        receipt_timeout: Duration,
    ) -> Self {
        Self {
            rpc,
            handle,
            from: OnceCell::new_with(from_account),
            poll_interval,
            receipt_timeout,
        }
    }

    pub fn handle(&self) -> &RegistryHandle {
        &self.handle
    }

    async fn call(&self, selector: [u8; 4], args: &[Token]) -> Result<Vec<u8>, RegistryError> {
        self.rpc
            .call(&self.handle.address, &abi::encode_call(selector, args))
            .await
    }

    async fn count(&self, selector: [u8; 4]) -> Result<Count, RegistryError> {
        let data = self.call(selector, &[]).await?;
        let dec = Decoder::new(&data);
        if dec.is_empty() {
            // No code at the address yet.
            return Ok(Count::Unknown);
        }
        Ok(Count::Known(dec.uint(0)?))
    }

    /// Sending account; the first node-managed account when none is configured.
    async fn sender(&self) -> Result<&str, RegistryError> {
        let account = self
            .from
            .get_or_try_init(|| async {
                let accounts = self.rpc.accounts().await?;
                let first = accounts.into_iter().next().ok_or_else(|| {
                    RegistryError::Transport("node manages no accounts to send from".into())
                })?;
                info!("Using node-managed account {}", first);
                Ok::<_, RegistryError>(first)
            })
            .await?;
        Ok(account.as_str())
    }

    async fn transact(&self, data: Vec<u8>) -> Result<TxRef, RegistryError> {
        let from = self.sender().await?;
        let tx_hash = self
            .rpc
            .send_transaction(from, &self.handle.address, &data)
            .await?;
        debug!("Transaction sent: {}", tx_hash);

        let receipt = timeout(self.receipt_timeout, async {
            loop {
                if let Some(receipt) = self.rpc.receipt(&tx_hash).await? {
                    return Ok::<_, RegistryError>(receipt);
                }
                sleep(self.poll_interval).await;
            }
        })
        .await
        .map_err(|_| RegistryError::Timeout)??;

        if receipt.succeeded() {
            Ok(TxRef(receipt.transaction_hash))
        } else {
            Err(RegistryError::Reverted(format!(
                "transaction {} failed",
                receipt.transaction_hash
            )))
        }
    }
}

#[async_trait]
impl RegistryClient for ContractRegistry {
    async fn members_count(&self) -> Result<Count, RegistryError> {
        self.count(abi::GET_MEMBERS_COUNT).await
    }

    async fn member_key(&self, index: u64) -> Result<HostId, RegistryError> {
        let data = self.call(abi::MEMBERS, &[Token::Uint(index)]).await?;
        Decoder::new(&data).string(0)
    }

    async fn member_detail(&self, host: &str) -> Result<MemberDetail, RegistryError> {
        let data = self
            .call(abi::GET_MEMBER_DETAILS, &[Token::String(host.into())])
            .await?;
        let dec = Decoder::new(&data);
        Ok(MemberDetail {
            image_name: dec.string(0)?,
            active: dec.boolean(1)?,
            encrypted_memory: dec.bytes(2)?,
        })
    }

    async fn member_images(&self, host: &str) -> Result<Vec<ImageName>, RegistryError> {
        let data = self
            .call(abi::GET_MEMBER_IMAGES, &[Token::String(host.into())])
            .await?;
        Decoder::new(&data).string_array(0)
    }

    async fn images_count(&self) -> Result<Count, RegistryError> {
        self.count(abi::GET_IMAGES_COUNT).await
    }

    async fn image_key(&self, index: u64) -> Result<ImageName, RegistryError> {
        let data = self.call(abi::IMAGES, &[Token::Uint(index)]).await?;
        Decoder::new(&data).string(0)
    }

    async fn image_detail(&self, name: &str) -> Result<ImageDetail, RegistryError> {
        let data = self
            .call(abi::GET_IMAGE_DETAILS, &[Token::String(name.into())])
            .await?;
        let dec = Decoder::new(&data);
        Ok(ImageDetail {
            replicas: dec.uint(0)?,
            deployed: dec.uint(1)?,
            active: dec.boolean(2)?,
        })
    }

    async fn add_image(&self, name: &str, replicas: ReplicaArg) -> Result<TxRef, RegistryError> {
        let data = match replicas {
            ReplicaArg::Plain(n) => {
                abi::encode_call(abi::ADD_IMAGE, &[Token::String(name.into()), Token::Uint(n)])
            }
            ReplicaArg::Sealed(ciphertext) => abi::encode_call(
                abi::ADD_IMAGE_SEALED,
                &[Token::String(name.into()), Token::Bytes(ciphertext)],
            ),
        };
        self.transact(data).await
    }

    async fn remove_image(&self, name: &str) -> Result<TxRef, RegistryError> {
        self.transact(abi::encode_call(abi::REMOVE_IMAGE, &[Token::String(name.into())]))
            .await
    }
}

struct LogCursor {
    rpc: Arc<RpcClient>,
    address: String,
    topics: Vec<String>,
    next_block: u64,
    interval: Duration,
}

impl LogCursor {
    /// Waits one interval and returns the logs mined since the last poll.
    async fn poll(&mut self) -> Vec<RawEvent> {
        sleep(self.interval).await;
        let head = match self.rpc.block_number().await {
            Ok(head) => head,
            Err(e) => {
                warn!("Event poll for {} failed: {}", self.address, e);
                return Vec::new();
            }
        };
        if head < self.next_block {
            return Vec::new();
        }
        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        match self.rpc.logs(&self.address, self.next_block, head, &topics).await {
            Ok(logs) => {
                self.next_block = head + 1;
                debug!("{} registry logs up to block {}", logs.len(), head);
                logs.into_iter()
                    .map(|log| RawEvent { topics: log.topics })
                    .collect()
            }
            Err(e) => {
                warn!("Fetching logs for {} failed: {}", self.address, e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl EventSource for ContractRegistry {
    async fn subscribe(
        &self,
        collection: CollectionKind,
    ) -> Result<BoxStream<'static, RawEvent>, RegistryError> {
        // Only changes after subscription are of interest; the initial
        // state comes from the mount refresh.
        let head = self.rpc.block_number().await?;
        let cursor = LogCursor {
            rpc: Arc::clone(&self.rpc),
            address: self.handle.address.clone(),
            topics: self
                .handle
                .interface
                .topics_for(collection)
                .iter()
                .map(|t| t.to_string())
                .collect(),
            next_block: head + 1,
            interval: self.poll_interval,
        };
        info!(
            "Subscribed to {} events of {} from block {}",
            collection,
            self.handle.address,
            head + 1
        );
        let batches = stream::unfold(cursor, |mut cursor| async move {
            let batch = cursor.poll().await;
            Some((batch, cursor))
        });
        Ok(batches.flat_map(stream::iter).boxed())
    }
}
