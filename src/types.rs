//! Data structures shared by the synchronization layer.
//!
//! These types mirror the records held by the on-chain registry:
//! cluster members (hosts that run containers) and the images the
//! cluster has been asked to deploy.  Both collections are
//! append-only on the ledger; removal only flips the `active` flag,
//! so every consumer filters on it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Host/peer identifier under which a member registered itself.
pub type HostId = String;

/// Container image reference, e.g. `nginx:latest`.
pub type ImageName = String;

/// A registered cluster member as stored by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub host: HostId,
    /// Image the member was last assigned, empty when none.
    pub image_name: ImageName,
    pub active: bool,
    /// Ciphertext of the member's available memory.  Opaque to this crate.
    #[serde(with = "hex_bytes")]
    pub encrypted_memory: Vec<u8>,
}

/// A deployable image and its replica bookkeeping.
///
/// `deployed` is reported by the registry and may exceed `replicas`;
/// nothing here enforces an ordering between the two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: ImageName,
    pub replicas: u64,
    pub deployed: u64,
    pub active: bool,
}

/// Member detail tuple as returned by `getMemberDetails`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDetail {
    pub image_name: ImageName,
    pub active: bool,
    pub encrypted_memory: Vec<u8>,
}

/// Image detail tuple as returned by `getImageDetails`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDetail {
    pub replicas: u64,
    pub deployed: u64,
    pub active: bool,
}

/// Number of entries the registry reports for a collection.
///
/// `Unknown` means the registry could not answer (empty return data,
/// contract not deployed yet).  It is kept distinct from `Known(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    Unknown,
    Known(u64),
}

/// Which of the two registry collections an operation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionKind {
    Members,
    Images,
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionKind::Members => f.write_str("members"),
            CollectionKind::Images => f.write_str("images"),
        }
    }
}

/// A change notification emitted by the registry.
///
/// Only the kind matters to the synchronizer; payloads are never
/// trusted, the collections are always re-read from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    MemberAdded,
    MemberRemoved,
    ImageAdded,
    ImageRemoved,
}

impl RegistryEvent {
    pub fn collection(self) -> CollectionKind {
        match self {
            RegistryEvent::MemberAdded | RegistryEvent::MemberRemoved => CollectionKind::Members,
            RegistryEvent::ImageAdded | RegistryEvent::ImageRemoved => CollectionKind::Images,
        }
    }
}

/// Identifies the registry instance a session talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryHandle {
    /// `0x`-prefixed contract address, lowercase.
    pub address: String,
    pub chain_id: u64,
    pub interface: InterfaceDescriptor,
}

/// Entry points and event topics of the registry contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub member_added_topic: String,
    pub member_removed_topic: String,
    pub image_added_topic: String,
    pub image_removed_topic: String,
}

impl InterfaceDescriptor {
    /// Classifies a log's first topic.  Unknown topics yield `None`.
    pub fn classify(&self, topic: &str) -> Option<RegistryEvent> {
        let topic = topic.to_ascii_lowercase();
        if topic == self.member_added_topic {
            Some(RegistryEvent::MemberAdded)
        } else if topic == self.member_removed_topic {
            Some(RegistryEvent::MemberRemoved)
        } else if topic == self.image_added_topic {
            Some(RegistryEvent::ImageAdded)
        } else if topic == self.image_removed_topic {
            Some(RegistryEvent::ImageRemoved)
        } else {
            None
        }
    }

    pub fn topics_for(&self, collection: CollectionKind) -> [&str; 2] {
        match collection {
            CollectionKind::Members => [&self.member_added_topic, &self.member_removed_topic],
            CollectionKind::Images => [&self.image_added_topic, &self.image_removed_topic],
        }
    }
}

impl Default for InterfaceDescriptor {
    fn default() -> Self {
        // keccak256 of MemberAdded(string), MemberRemoved(string),
        // ImageAdded(string,uint256) and ImageRemoved(string).
        Self {
            member_added_topic:
                "0xdfaa3c24567cbffbf024ddfd8dfca7a224b307e94b0df5437facad0f2fea2f9b".into(),
            member_removed_topic:
                "0xaf06374d1ead7db2bdd32332c45b0de89005db86e48393e9652d9af261ace2e8".into(),
            image_added_topic:
                "0xa085e33b22b418606ff5e10dd7746aaee811e2863299769805f0e443d682ff11".into(),
            image_removed_topic:
                "0x9f8d7fef841efa3822d3cefec122a5d2678ebaeb8609a4b2db28d774f55a4f03".into(),
        }
    }
}

/// Hash of a confirmed ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRef(pub String);

impl TxRef {
    /// First ten characters of the hash, as shown in status messages.
    pub fn short(&self) -> &str {
        self.0.get(..10).unwrap_or(&self.0)
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A state-changing request against the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationRequest {
    /// Ask the cluster to deploy `replicas` copies of `name`.
    Add { name: ImageName, replicas: u64 },
    /// Deactivate `name`.
    Remove { name: ImageName },
}

impl MutationRequest {
    pub fn target(&self) -> &str {
        match self {
            MutationRequest::Add { name, .. } | MutationRequest::Remove { name } => name,
        }
    }
}

/// Replica count as handed to the write entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaArg {
    /// Ledger-native unsigned integer.
    Plain(u64),
    /// Ciphertext produced by the encryption collaborator.
    Sealed(Vec<u8>),
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}
