//! One-shot registry status report.

use std::fmt;

use log::warn;

use crate::engine::SyncEngine;
use crate::types::{Image, ImageName, Member};

pub struct MemberReport {
    pub member: Member,
    /// Images assigned to the member, or the error fetching them.
    pub assigned: Result<Vec<ImageName>, String>,
}

pub struct Report {
    pub contract_address: Option<String>,
    pub chain_id: Option<u64>,
    pub members_registered: Option<u64>,
    pub members: Vec<MemberReport>,
    pub images_registered: Option<u64>,
    pub images: Vec<Image>,
}

impl Report {
    /// Reconciles both collections and collects per-member assignments.
    pub async fn gather(engine: &SyncEngine) -> Self {
        engine.reconcile_now().await;
        let link = engine.registry();
        let members_snapshot = engine.member_snapshot();
        let images_snapshot = engine.image_snapshot();

        let mut members = Vec::with_capacity(members_snapshot.entries.len());
        for member in members_snapshot.entries.iter() {
            let assigned = match &link {
                Some(link) => link
                    .client
                    .member_images(&member.host)
                    .await
                    .map_err(|e| {
                        warn!("Failed to load images assigned to {}: {}", member.host, e);
                        e.to_string()
                    }),
                None => Ok(Vec::new()),
            };
            members.push(MemberReport {
                member: member.clone(),
                assigned,
            });
        }

        Self {
            contract_address: link.as_ref().map(|l| l.handle.address.clone()),
            chain_id: link.as_ref().map(|l| l.handle.chain_id),
            members_registered: members_snapshot.registered,
            members,
            images_registered: images_snapshot.registered,
            images: images_snapshot.entries.as_ref().clone(),
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "-".repeat(60);
        let Some(address) = &self.contract_address else {
            return writeln!(f, "Registry not available on this network");
        };
        writeln!(f, "Contract Address: {}", address)?;
        if let Some(chain_id) = self.chain_id {
            writeln!(f, "Chain ID: {}", chain_id)?;
        }

        writeln!(f, "{rule}\nREGISTERED MEMBERS:\n{rule}")?;
        match self.members_registered {
            None => writeln!(f, "Member count unavailable.")?,
            Some(0) => writeln!(f, "No members registered yet.")?,
            Some(total) => {
                for (idx, report) in self.members.iter().enumerate() {
                    let member = &report.member;
                    writeln!(f, "{}. Host/Peer ID: {}", idx + 1, member.host)?;
                    match &report.assigned {
                        Ok(images) if images.is_empty() => writeln!(f, "   Assigned Images: None")?,
                        Ok(images) => {
                            writeln!(f, "   Assigned Images ({}):", images.len())?;
                            for image in images {
                                writeln!(f, "     - {}", image)?;
                            }
                        }
                        Err(e) => writeln!(f, "   Assigned Images: unavailable ({})", e)?,
                    }
                    let prefix = hex::encode(&member.encrypted_memory);
                    writeln!(
                        f,
                        "   Encrypted Memory: 0x{}... ({} bytes)",
                        prefix.get(..8).unwrap_or(&prefix),
                        member.encrypted_memory.len()
                    )?;
                }
                if self.members.is_empty() {
                    writeln!(f, "All members have been removed (0 active members)")?;
                } else {
                    writeln!(
                        f,
                        "Total Active Members: {} out of {} registered",
                        self.members.len(),
                        total
                    )?;
                }
            }
        }

        writeln!(f, "{rule}\nIMAGE DEPLOYMENTS:\n{rule}")?;
        match self.images_registered {
            None => writeln!(f, "Image count unavailable.")?,
            Some(0) => writeln!(f, "No images deployed yet.")?,
            Some(_) if self.images.is_empty() => writeln!(f, "No active images deployed.")?,
            Some(_) => {
                for (idx, image) in self.images.iter().enumerate() {
                    writeln!(f, "{}. {}", idx + 1, image.name)?;
                    writeln!(f, "   Requested Replicas: {}", image.replicas)?;
                    writeln!(f, "   Deployed: {}", image.deployed)?;
                }
            }
        }
        Ok(())
    }
}
