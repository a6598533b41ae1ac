//! Single-slot mutation orchestration.
//!
//! At most one add/remove request is in flight.  The slot is claimed
//! synchronously on submission, so a concurrent submission sees it
//! taken and is rejected before any write is attempted.  The slot is
//! released on every exit path, including cancellation of the caller.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::watch;

use crate::error::MutationError;
use crate::refresh::{RefreshCoordinator, RefreshTrigger};
use crate::registry::RegistryLink;
use crate::status::StatusLine;
use crate::types::{MutationRequest, ReplicaArg, TxRef};

const GENERIC_FAILURE: &str = "Transaction failed";

/// Seals numeric values before they are submitted to the registry.
pub trait Encryptor: Send + Sync {
    fn seal(&self, value: u64) -> Result<Vec<u8>, String>;
}

/// Emits the value as a big-endian 32-byte word, unencrypted.
///
/// For registries that take the bytes-typed entry point on networks
/// without an encryption service.
pub struct PlaintextSealer;

impl Encryptor for PlaintextSealer {
    fn seal(&self, value: u64) -> Result<Vec<u8>, String> {
        Ok(crate::registry::abi::uint_word(value).to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Pending,
}

/// Result of the most recently finished request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded(TxRef),
    Failed(MutationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationState {
    pub phase: Phase,
    /// The request in flight.
    pub request: Option<MutationRequest>,
    pub last_outcome: Option<Outcome>,
}

impl Default for MutationState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            request: None,
            last_outcome: None,
        }
    }
}

impl MutationState {
    pub fn is_processing(&self) -> bool {
        self.phase == Phase::Pending
    }
}

enum WriteCall {
    Add { name: String, replicas: ReplicaArg },
    Remove { name: String },
}

/// A claimed slot.  Dropping it without [`finish`](Self::finish)
/// returns the slot to `Idle`.
struct SlotGuard<'a> {
    state: &'a watch::Sender<MutationState>,
    armed: bool,
}

impl SlotGuard<'_> {
    /// Records `outcome` and releases the slot in a single update.
    fn finish(mut self, outcome: Outcome) {
        self.armed = false;
        self.state.send_modify(|s| {
            s.phase = Phase::Idle;
            s.request = None;
            s.last_outcome = Some(outcome);
        });
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Mutation abandoned before completion");
        self.state.send_modify(|s| {
            s.phase = Phase::Idle;
            s.request = None;
        });
    }
}

pub struct MutationOrchestrator {
    state: watch::Sender<MutationState>,
    registry: watch::Receiver<Option<RegistryLink>>,
    refresh: Arc<RefreshCoordinator>,
    status: StatusLine,
    encryptor: Option<Arc<dyn Encryptor>>,
}

impl MutationOrchestrator {
    pub fn new(
        registry: watch::Receiver<Option<RegistryLink>>,
        refresh: Arc<RefreshCoordinator>,
        status: StatusLine,
        encryptor: Option<Arc<dyn Encryptor>>,
    ) -> Self {
        let (state, _) = watch::channel(MutationState::default());
        Self {
            state,
            registry,
            refresh,
            status,
            encryptor,
        }
    }

    pub fn state(&self) -> MutationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MutationState> {
        self.state.subscribe()
    }

    pub fn is_processing(&self) -> bool {
        self.state.borrow().is_processing()
    }

    /// Submits `request` and waits for its confirmation.
    pub async fn submit(&self, request: MutationRequest) -> Result<TxRef, MutationError> {
        let Some(slot) = self.claim(&request) else {
            warn!("Rejecting {:?}: another transaction is in progress", request);
            return Err(MutationError::AlreadyPending);
        };

        let client = self
            .registry
            .borrow()
            .as_ref()
            .map(|link| Arc::clone(&link.client));
        let Some(client) = client else {
            slot.finish(Outcome::Failed(MutationError::RegistryUnavailable));
            self.status.set("Registry not available on this network");
            return Err(MutationError::RegistryUnavailable);
        };

        let result = match self.prepare(&request) {
            Ok(call) => {
                let message = in_progress_message(&request);
                info!("{}", message);
                self.status.set(message);
                match call {
                    WriteCall::Add { name, replicas } => client.add_image(&name, replicas).await,
                    WriteCall::Remove { name } => client.remove_image(&name).await,
                }
                .map_err(MutationError::from)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(tx) => {
                let message = success_message(&request, &tx);
                info!("{} [{}]", message, tx);
                self.status.set(message);
                slot.finish(Outcome::Succeeded(tx.clone()));
                self.refresh.bump(RefreshTrigger::Mutation);
                Ok(tx)
            }
            Err(e) => {
                let message = failure_message(&e);
                error!("{:?} failed: {}", request, message);
                self.status.set(message);
                slot.finish(Outcome::Failed(e.clone()));
                Err(e)
            }
        }
    }

    /// Validates the request and turns it into a registry write.
    fn prepare(&self, request: &MutationRequest) -> Result<WriteCall, MutationError> {
        let name = request.target().trim();
        if name.is_empty() {
            return Err(MutationError::InvalidRequest("image name must not be empty".into()));
        }
        let name = name.to_string();
        match request {
            MutationRequest::Add { replicas: 0, .. } => Err(MutationError::InvalidRequest(
                "replica count must be positive".into(),
            )),
            MutationRequest::Add { replicas, .. } => {
                let replicas = match &self.encryptor {
                    Some(encryptor) => ReplicaArg::Sealed(
                        encryptor.seal(*replicas).map_err(MutationError::Encryption)?,
                    ),
                    None => ReplicaArg::Plain(*replicas),
                };
                Ok(WriteCall::Add { name, replicas })
            }
            MutationRequest::Remove { .. } => Ok(WriteCall::Remove { name }),
        }
    }

    /// Takes the slot unless a request is already pending.
    fn claim(&self, request: &MutationRequest) -> Option<SlotGuard<'_>> {
        let claimed = self.state.send_if_modified(|s| {
            if s.phase == Phase::Pending {
                return false;
            }
            s.phase = Phase::Pending;
            s.request = Some(request.clone());
            true
        });
        claimed.then(|| SlotGuard {
            state: &self.state,
            armed: true,
        })
    }
}

fn in_progress_message(request: &MutationRequest) -> String {
    match request {
        MutationRequest::Add { name, replicas } => {
            format!("Adding image {} with {} replicas...", name.trim(), replicas)
        }
        MutationRequest::Remove { name } => format!("Removing image {}...", name.trim()),
    }
}

fn success_message(request: &MutationRequest, tx: &TxRef) -> String {
    match request {
        MutationRequest::Add { name, .. } => {
            format!("Image {} added (tx: {}...)", name.trim(), tx.short())
        }
        MutationRequest::Remove { name } => {
            format!("Image {} removed (tx: {}...)", name.trim(), tx.short())
        }
    }
}

fn failure_message(error: &MutationError) -> String {
    let text = error.to_string();
    if text.trim().is_empty() {
        GENERIC_FAILURE.to_string()
    } else {
        text
    }
}
