use alloc::{string::String, vec::Vec};

use serde::Deserialize;

use crate::ServerAddr;

/// The `INFO` document the server sends when a connection is established
///
/// Later `INFO` frames on the same connection carry updates (cluster
/// topology changes, lame duck mode) and replace the previous snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct ServerInfo {
    #[serde(rename = "server_id")]
    pub id: String,
    #[serde(default, rename = "server_name")]
    pub name: Option<String>,
    pub version: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub auth_required: bool,
    // Old servers used to call this `ssl_required`
    #[serde(default, alias = "ssl_required")]
    pub tls_required: bool,
    #[serde(default = "default_max_payload")]
    pub max_payload: u64,
    #[serde(default, rename = "proto")]
    pub protocol_version: u32,
    #[serde(default)]
    pub client_id: Option<u64>,
    #[serde(default, rename = "headers")]
    pub supports_headers: bool,
    #[serde(default)]
    pub connect_urls: Vec<ServerAddr>,
    #[serde(default, rename = "ldm")]
    pub lame_duck_mode: bool,
}

const fn default_max_payload() -> u64 {
    1024 * 1024
}

#[cfg(test)]
mod tests {
    use claims::assert_ok;

    use super::ServerInfo;

    #[test]
    fn deserializes_minimal_document() {
        let info: ServerInfo = assert_ok!(serde_json::from_str(
            r#"{"server_id":"abc","version":"2.10.0"}"#
        ));
        assert_eq!("abc", info.id);
        assert!(!info.auth_required);
        assert!(!info.tls_required);
        assert_eq!(1024 * 1024, info.max_payload);
    }

    #[test]
    fn accepts_legacy_ssl_required_alias() {
        let info: ServerInfo = assert_ok!(serde_json::from_str(
            r#"{"server_id":"abc","version":"0.6.8","ssl_required":true}"#
        ));
        assert!(info.tls_required);
    }

    #[test]
    fn reads_full_document() {
        let info: ServerInfo = assert_ok!(serde_json::from_str(
            r#"{
                "server_id": "NDYZ",
                "server_name": "east-1",
                "version": "2.10.17",
                "go": "go1.22.5",
                "host": "0.0.0.0",
                "port": 4222,
                "headers": true,
                "auth_required": true,
                "tls_required": true,
                "max_payload": 8388608,
                "proto": 1,
                "client_id": 5,
                "connect_urls": ["nats://10.0.0.4:4222"],
                "ldm": true
            }"#
        ));
        assert_eq!(Some("east-1".into()), info.name);
        assert!(info.auth_required);
        assert!(info.tls_required);
        assert!(info.supports_headers);
        assert!(info.lame_duck_mode);
        assert_eq!(8 * 1024 * 1024, info.max_payload);
        assert_eq!(1, info.connect_urls.len());
    }
}
