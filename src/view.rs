//! Read-only projection consumed by the presentation layer.

use serde::Serialize;

use crate::mutation::MutationState;
use crate::reconciler::Snapshot;
use crate::types::{HostId, Image, Member, RegistryHandle};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncView {
    pub message: String,
    pub is_processing: bool,
    pub is_connected: bool,
    pub members: Vec<HostId>,
    pub images: Vec<Image>,
    pub members_count: usize,
    pub images_count: usize,
    pub contract_address: Option<String>,
}

/// Derives the view from the current snapshots.  Counts are those of
/// the filtered lists, never the raw registry counts.
pub fn project(
    members: &Snapshot<Member>,
    images: &Snapshot<Image>,
    mutation: &MutationState,
    message: &str,
    connected: bool,
    handle: Option<&RegistryHandle>,
) -> SyncView {
    SyncView {
        message: message.to_string(),
        is_processing: mutation.is_processing(),
        is_connected: connected,
        members: members.entries.iter().map(|m| m.host.clone()).collect(),
        images: images.entries.as_ref().clone(),
        members_count: members.entries.len(),
        images_count: images.entries.len(),
        contract_address: handle.map(|h| h.address.clone()),
    }
}
