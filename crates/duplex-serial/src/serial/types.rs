//! Serial data types shared by the transport, connector and port modules.

use duplex_core::{HandleId, ParserConfig, ReceiveErrorPolicy};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport-level records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A device as the platform enumerates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub path: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub display_name: Option<String>,
}

impl DeviceInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            vendor_id: None,
            product_id: None,
            display_name: None,
        }
    }

    pub fn usb(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self.product_id = Some(product_id);
        self
    }

    pub fn named(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// Parameters of a single connect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOptions {
    pub bitrate: u32,
    /// Name recorded with the connection; used to find stale handles.
    pub name: String,
}

/// An open connection as the transport records it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: HandleId,
    pub name: String,
    pub path: String,
    pub bitrate: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Consumer-facing types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Discoverable serial endpoint, as returned by [`crate::serial::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub com_name: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub manufacturer: Option<String>,
}

impl From<DeviceInfo> for DeviceDescriptor {
    fn from(info: DeviceInfo) -> Self {
        Self {
            com_name: info.path,
            vendor_id: info.vendor_id,
            product_id: info.product_id,
            manufacturer: info.display_name,
        }
    }
}

/// Serializable part of the options for opening a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SerialSettings {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    pub parser: ParserConfig,
    pub receive_errors: ReceiveErrorPolicy,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            parser: ParserConfig::default(),
            receive_errors: ReceiveErrorPolicy::default(),
        }
    }
}
