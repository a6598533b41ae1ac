use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::InterfaceDescriptor;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub provider_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_account: Option<String>,
    pub poll_interval_ms: u64,
    pub receipt_timeout_ms: u64,
    pub encrypt_replicas: bool,
    pub events: InterfaceDescriptor,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider_url: "http://localhost:8545".into(),
            contract_address: None,
            chain_id: None,
            from_account: None,
            poll_interval_ms: 1000,
            receipt_timeout_ms: 60_000,
            encrypt_replicas: false,
            events: InterfaceDescriptor::default(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("canteen.toml"))
                .merge(Json::file("canteen.json"))
                .merge(Env::prefixed("CANTEEN_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support address files written by the deploy scripts
        if let Ok(address_file) = std::env::var("CANTEEN_CONTRACT_ADDRESS_FILE") {
            config.contract_address = Some(std::fs::read_to_string(address_file)?.trim().to_string());
        }

        if let Some(ref address) = config.contract_address {
            if !is_address(address) {
                anyhow::bail!("Invalid contract_address: {}", address);
            }
            config.contract_address = Some(address.to_ascii_lowercase());
        }

        config.events = InterfaceDescriptor {
            member_added_topic: config.events.member_added_topic.to_ascii_lowercase(),
            member_removed_topic: config.events.member_removed_topic.to_ascii_lowercase(),
            image_added_topic: config.events.image_added_topic.to_ascii_lowercase(),
            image_removed_topic: config.events.image_removed_topic.to_ascii_lowercase(),
        };

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_ms)
    }
}

fn is_address(s: &str) -> bool {
    s.strip_prefix("0x")
        .map(|h| h.len() == 40 && h.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}
