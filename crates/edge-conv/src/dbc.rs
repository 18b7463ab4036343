//! Signal database text
//!
//! Only message (`BO_`) and signal (`SG_`) records are read; every other
//! record kind is skipped.
//!
//! ```text
//! BO_ 2024 OBD2: 8 Vector__XXX
//!  SG_ VehicleSpeed : 31|8@0+ (1,0) [0|255] "km/h" Vector__XXX
//! ```

use std::collections::HashMap;

use serde::Serialize;

use crate::decode::{decode_frame_signal, Decoded};
use crate::error::{ConvError, ConvResult};
use crate::formula::SignalFormula;

/// Bit 31 of a `BO_` id marks a 29-bit identifier
const EXTENDED_ID_FLAG: u32 = 0x8000_0000;
const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DbcSignal {
    pub name: String,
    pub formula: SignalFormula,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DbcMessage {
    pub id: u32,
    pub extended: bool,
    pub name: String,
    pub dlc: u8,
    pub signals: Vec<DbcSignal>,
}

impl DbcMessage {
    /// Decode every signal of this message from one frame payload.
    ///
    /// Signals that fail to decode are returned as errors so the caller can
    /// count them without losing the rest of the frame.
    pub fn decode<'a>(&'a self, data: &[u8]) -> Vec<(&'a str, ConvResult<Decoded>)> {
        self.signals
            .iter()
            .map(|s| (s.name.as_str(), decode_frame_signal(data, &s.formula)))
            .collect()
    }
}

/// Messages keyed by CAN id
#[derive(Debug, Clone, Default)]
pub struct SignalDatabase {
    messages: HashMap<u32, DbcMessage>,
}

impl SignalDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse database text
    pub fn parse(text: &str) -> ConvResult<Self> {
        let mut messages: Vec<DbcMessage> = Vec::new();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();

            if let Some(rest) = line.strip_prefix("BO_ ") {
                messages.push(parse_message(rest, line_no)?);
            } else if let Some(rest) = line.strip_prefix("SG_ ") {
                let signal = parse_signal(rest, line_no)?;
                let message = messages.last_mut().ok_or_else(|| ConvError::InvalidDatabase {
                    line: line_no,
                    reason: "signal outside of a message".to_string(),
                })?;
                message.signals.push(signal);
            }
        }

        Ok(Self {
            messages: messages.into_iter().map(|m| (m.id, m)).collect(),
        })
    }

    pub fn message(&self, id: u32) -> Option<&DbcMessage> {
        self.messages.get(&id)
    }

    pub fn messages(&self) -> impl Iterator<Item = &DbcMessage> {
        self.messages.values()
    }

    /// Ids worth filtering on at the socket
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.messages.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

fn parse_message(rest: &str, line: usize) -> ConvResult<DbcMessage> {
    let invalid = |reason: &str| ConvError::InvalidDatabase {
        line,
        reason: reason.to_string(),
    };

    let mut parts = rest.split_whitespace();
    let raw_id: u32 = parts
        .next()
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| invalid("invalid message id"))?;
    let name = parts
        .next()
        .map(|n| n.trim_end_matches(':').to_string())
        .ok_or_else(|| invalid("missing message name"))?;
    let dlc: u8 = parts
        .find(|p| *p != ":")
        .and_then(|d| d.parse().ok())
        .ok_or_else(|| invalid("invalid message length"))?;

    let extended = raw_id & EXTENDED_ID_FLAG != 0 || raw_id > 0x7FF;
    Ok(DbcMessage {
        id: raw_id & CAN_EFF_MASK,
        extended,
        name,
        dlc,
        signals: Vec::new(),
    })
}

fn parse_signal(rest: &str, line: usize) -> ConvResult<DbcSignal> {
    let (head, layout) = rest.split_once(':').ok_or_else(|| ConvError::InvalidDatabase {
        line,
        reason: "missing ':' after signal name".to_string(),
    })?;
    // Multiplexer indicator may follow the name
    let name = head
        .split_whitespace()
        .next()
        .ok_or_else(|| ConvError::InvalidDatabase {
            line,
            reason: "missing signal name".to_string(),
        })?
        .to_string();

    let formula = layout.trim().parse().map_err(|e: ConvError| ConvError::InvalidDatabase {
        line,
        reason: e.to_string(),
    })?;

    Ok(DbcSignal { name, formula })
}
