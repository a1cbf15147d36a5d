use serde::{Deserialize, Serialize};

use crate::{error::Error, message::Message};

/// QMP greeting message.
///
/// QMP sends this as the very first JSON object after the socket is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    /// QMP meta information.
    #[serde(rename = "QMP")]
    pub qmp: QmpInfo,
}

impl Greeting {
    /// Whether the server advertises `capability`.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.qmp.capabilities.iter().any(|c| c == capability)
    }
}

impl TryFrom<&Message> for Greeting {
    type Error = Error;

    fn try_from(msg: &Message) -> Result<Self, Self::Error> {
        super::decode_message(msg, "greeting")
    }
}

/// `QMP` section in the greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpInfo {
    /// Server version.
    pub version: QmpVersion,

    /// Supported capabilities.
    pub capabilities: Vec<String>,
}

/// QEMU version information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpVersion {
    /// QEMU package version.
    pub qemu: QmpVersionNumber,

    /// Package string (when available).
    #[serde(default)]
    pub package: String,
}

/// Numeric version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpVersionNumber {
    /// Major version.
    pub major: u64,
    /// Minor version.
    pub minor: u64,
    /// Micro version.
    pub micro: u64,
}
