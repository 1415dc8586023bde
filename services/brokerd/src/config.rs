//! Broker daemon configuration.
//!
//! Loaded from TOML (or JSON, matching the other services). Every field
//! except the CID has a default, so a minimal config is just a CID and
//! optionally a static UID.

use serde_derive::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

use filament::broker::core::{BrokerSettings, BrokerUidConfig, DnsAttributes};
use lumen::{BrokerError, BrokerResult, Cid, Uid};

pub const DEFAULT_LISTEN_PORT: u16 = 5569;

#[derive(Serialize, Deserialize)]
pub struct UidConfig {
    /// "static" or "dynamic".
    #[serde(rename = "type", default = "default_uid_type")]
    pub uid_type: String,
    pub manufacturer: u16,
    #[serde(default)]
    pub device: u32,
}

fn default_uid_type() -> String {
    "dynamic".to_string()
}

#[derive(Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_manufacturer")]
    pub manufacturer: String,
    #[serde(default = "default_dns_model")]
    pub model: String,
    #[serde(default = "default_service_instance_name")]
    pub service_instance_name: String,
    #[serde(default)]
    pub additional_txt_items: Vec<TxtItem>,
}

#[derive(Serialize, Deserialize)]
pub struct TxtItem {
    pub key: String,
    pub value: String,
}

fn default_dns_manufacturer() -> String {
    "Filament Works".to_string()
}

fn default_dns_model() -> String {
    "RDMnet Broker".to_string()
}

fn default_service_instance_name() -> String {
    "RDMnet Broker".to_string()
}

impl Default for DnsConfig {
    fn default() -> DnsConfig {
        DnsConfig {
            manufacturer: default_dns_manufacturer(),
            model: default_dns_model(),
            service_instance_name: default_service_instance_name(),
            additional_txt_items: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct BrokerConfig {
    pub cid: String,
    pub uid: UidConfig,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub listen_addrs: Vec<String>,
    #[serde(default)]
    pub listen_macs: Vec<String>,
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default)]
    pub max_controllers: usize,
    #[serde(default)]
    pub max_devices: usize,
    #[serde(default = "default_max_reject_connections")]
    pub max_reject_connections: usize,
    #[serde(default = "default_max_messages")]
    pub max_controller_messages: usize,
    #[serde(default = "default_max_messages")]
    pub max_device_messages: usize,
    #[serde(default)]
    pub max_uid_capacity: usize,
    #[serde(default)]
    pub dns: DnsConfig,
}

fn default_scope() -> String {
    lumen::DEFAULT_SCOPE.to_string()
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_max_reject_connections() -> usize {
    5
}

fn default_max_messages() -> usize {
    500
}

impl BrokerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> BrokerResult<BrokerConfig> {
        let path = path.as_ref();
        if path.extension().map_or(false, |ext| ext == "json") {
            let file = std::fs::File::open(path)?;
            serde_json::from_reader(file)
                .map_err(|err| BrokerError::InvalidConfig(err.to_string()))
        } else {
            serdeconv::from_toml_file(path)
                .map_err(|err| BrokerError::InvalidConfig(err.to_string()))
        }
    }

    pub fn into_settings(self) -> BrokerResult<BrokerSettings> {
        let cid: Cid = self
            .cid
            .parse()
            .map_err(|_| BrokerError::InvalidConfig(format!("unparseable cid {:?}", self.cid)))?;

        let uid = match self.uid.uid_type.as_str() {
            "static" => BrokerUidConfig::Static(Uid::new(self.uid.manufacturer, self.uid.device)),
            "dynamic" => BrokerUidConfig::Dynamic { manu: self.uid.manufacturer },
            other => {
                return Err(BrokerError::InvalidConfig(format!(
                    "uid type must be \"static\" or \"dynamic\", got {:?}",
                    other
                )));
            }
        };

        let mut listen_addrs = Vec::with_capacity(self.listen_addrs.len());
        for addr in &self.listen_addrs {
            let parsed: IpAddr = addr.parse()?;
            listen_addrs.push(parsed);
        }

        Ok(BrokerSettings {
            cid,
            uid,
            scope: self.scope,
            listen_port: self.listen_port,
            listen_addrs,
            listen_macs: self.listen_macs,
            max_connections: self.max_connections,
            max_controllers: self.max_controllers,
            max_devices: self.max_devices,
            max_reject_connections: self.max_reject_connections,
            max_controller_messages: self.max_controller_messages,
            max_device_messages: self.max_device_messages,
            max_uid_capacity: self.max_uid_capacity,
            dns: DnsAttributes {
                manufacturer: self.dns.manufacturer,
                model: self.dns.model,
                service_instance_name: self.dns.service_instance_name,
                additional_txt_items: self
                    .dns
                    .additional_txt_items
                    .into_iter()
                    .map(|item| (item.key, item.value.into_bytes()))
                    .collect(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config: BrokerConfig = serdeconv::from_toml_str(
            r#"
cid = "00000000-0000-0000-0000-000000000001"

[uid]
type = "static"
manufacturer = 25972
device = 1
"#,
        )
        .unwrap();

        let settings = config.into_settings().unwrap();
        assert_eq!(settings.scope, "default");
        assert_eq!(settings.listen_port, DEFAULT_LISTEN_PORT);
        match settings.uid {
            BrokerUidConfig::Static(uid) => assert_eq!(uid, Uid::new(0x6574, 1)),
            other => panic!("expected a static uid, got {:?}", other),
        }
    }

    #[test]
    fn test_full_config() {
        let config: BrokerConfig = serdeconv::from_toml_str(
            r#"
cid = "12345678-9abc-def0-1234-56789abcdef0"
scope = "stage-left"
listen_port = 9000
listen_addrs = ["127.0.0.1", "::1"]
max_connections = 100
max_controllers = 10
max_devices = 90
max_controller_messages = 200

[uid]
type = "dynamic"
manufacturer = 25972

[dns]
manufacturer = "Example Co"
model = "Example Broker"
service_instance_name = "Stage Left Broker"

[[dns.additional_txt_items]]
key = "release"
value = "beta"
"#,
        )
        .unwrap();

        let settings = config.into_settings().unwrap();
        assert_eq!(settings.scope, "stage-left");
        assert_eq!(settings.listen_addrs.len(), 2);
        assert_eq!(settings.max_connections, 100);
        assert_eq!(settings.max_controller_messages, 200);
        assert_eq!(settings.max_device_messages, 500);
        assert_eq!(settings.dns.additional_txt_items.len(), 1);
        assert_eq!(settings.dns.additional_txt_items[0].0, "release");
    }

    #[test]
    fn test_bad_uid_type_is_rejected() {
        let config: BrokerConfig = serdeconv::from_toml_str(
            r#"
cid = "00000000-0000-0000-0000-000000000001"

[uid]
type = "ephemeral"
manufacturer = 25972
"#,
        )
        .unwrap();

        assert!(config.into_settings().is_err());
    }
}
