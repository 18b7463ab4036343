//! PID request templates

use serde::{Deserialize, Serialize};

use crate::io::ObdQuery;

/// 11-bit OBD-II functional broadcast header
pub const OBD_FUNCTIONAL_11BIT: u32 = 0x7DF;
/// 29-bit OBD-II functional broadcast header
pub const OBD_FUNCTIONAL_29BIT: u32 = 0x18DB33F1;

/// Headers at or above this value are treated as 29-bit identifiers
const EXTENDED_HEADER_THRESHOLD: u32 = 0xFFF;

/// One periodic query from the PID template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidRequest {
    /// Signal name the decoded value is published under
    pub name: String,
    /// Request header (CAN id)
    pub header: u32,
    /// OBD/UDS service
    pub mode: u32,
    /// Parameter id
    pub pid: u32,
    /// Seconds between executions; 0 means once at boot only
    #[serde(default, alias = "intervalSeconds")]
    pub interval_seconds: u32,
    /// Tagged formula text (`dbc: ...` or `python: ...`)
    #[serde(default)]
    pub formula: String,
    /// Hardware protocol id override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// `"<request>,<response>"` hex pair for ISO-TP flow control
    #[serde(default, alias = "canFlowControlIdPair", skip_serializing_if = "Option::is_none")]
    pub can_flow_control_id_pair: Option<String>,
    /// Clear flow control before issuing the request
    #[serde(default, alias = "canFlowControlClear")]
    pub can_flow_control_clear: bool,
}

impl PidRequest {
    /// The header the vehicle answers on.
    ///
    /// An explicit flow-control pair wins. Otherwise 11-bit requests answer on
    /// `header + 8` (functional `0x7DF` answers on `0x7E8`) and 29-bit requests
    /// answer on `0x18DA<source><target>`.
    pub fn response_header(&self) -> u32 {
        if let Some(response) = self
            .can_flow_control_id_pair
            .as_deref()
            .and_then(parse_flow_control_response)
        {
            return response;
        }
        response_header_for(self.header)
    }

    /// PID as lowercase hex, as it appears inside raw responses
    pub fn pid_hex(&self) -> String {
        if self.pid > 0xFF {
            format!("{:04x}", self.pid)
        } else {
            format!("{:02x}", self.pid)
        }
    }

    /// The request as a raw-frame query, on `default_protocol` unless the
    /// request names its own
    pub fn raw_query(&self, default_protocol: &str) -> ObdQuery {
        ObdQuery {
            name: self.name.clone(),
            header: self.header,
            mode: self.mode,
            pid: self.pid,
            protocol: self
                .protocol
                .clone()
                .unwrap_or_else(|| default_protocol.to_string()),
            formula: None,
            flow_control_id_pair: self.can_flow_control_id_pair.clone(),
            flow_control_clear: self.can_flow_control_clear,
        }
    }

    /// Whether this request runs only once per boot
    pub fn is_boot_only(&self) -> bool {
        self.interval_seconds == 0
    }
}

/// Response header for a request header with no explicit override
pub fn response_header_for(header: u32) -> u32 {
    if header < EXTENDED_HEADER_THRESHOLD {
        if header == OBD_FUNCTIONAL_11BIT {
            0x7E8
        } else {
            header + 8
        }
    } else if header == OBD_FUNCTIONAL_29BIT {
        0x18DAF133
    } else {
        let target = (header >> 8) & 0xFF;
        let source = header & 0xFF;
        0x18DA_0000 | (source << 8) | target
    }
}

fn parse_flow_control_response(pair: &str) -> Option<u32> {
    let (_, response) = pair.split_once(',')?;
    let response = response.trim();
    let response = response
        .strip_prefix("0x")
        .or_else(|| response.strip_prefix("0X"))
        .unwrap_or(response);
    u32::from_str_radix(response, 16).ok()
}

/// Versioned bundle of PID requests served by the template service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePids {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub template_name: String,
    #[serde(default)]
    pub requests: Vec<PidRequest>,
}

/// Where the configuration for one vehicle lives
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateUrls {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub pid_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_settings_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbc_url: Option<String>,
}

impl TemplateUrls {
    /// Two URL records describe the same template when version and PID url match
    pub fn same_template(&self, other: &TemplateUrls) -> bool {
        self.version == other.version && self.pid_url == other.pid_url
    }
}
