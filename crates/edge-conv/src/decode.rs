//! Decoding raw responses to physical values
//!
//! Two entry points share the same scaling and range rules:
//! [`decode_obd_response`] locates the PID inside a hex response line, and
//! [`decode_payload`] reads the leading bytes of a frame payload.
//! [`extract_bits`] is the bit-accurate extraction used for database frames.

use serde::Serialize;

use crate::error::{ConvError, ConvResult};
use crate::formula::{ByteOrder, SignalFormula};
use crate::precision::round_for_scale;

/// Hex chars of a 29-bit response header (`18DAF110`)
const EXTENDED_HEADER_CHARS: usize = 8;
/// Hex chars of an 11-bit response header (`7E8`)
const STANDARD_HEADER_CHARS: usize = 3;
/// Length byte plus response mode byte
const FRAMING_CHARS: usize = 4;

/// Decoded physical value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decoded {
    pub value: f64,
    pub unit: String,
}

/// Decode one OBD response line.
///
/// The header and framing window is skipped, then `pid_hex` is located and
/// the signal bytes that follow it are read big-endian.
pub fn decode_obd_response(hex_line: &str, pid_hex: &str, formula: &SignalFormula) -> ConvResult<Decoded> {
    let line: String = hex_line
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    if !line.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ConvError::InvalidHex(line));
    }
    let pid = pid_hex.trim().to_ascii_lowercase();

    let header_chars = if line.starts_with("18da") {
        EXTENDED_HEADER_CHARS
    } else {
        STANDARD_HEADER_CHARS
    };
    let window = header_chars + FRAMING_CHARS;
    let body = line.get(window..).ok_or_else(|| ConvError::DataTooShort {
        expected: window / 2,
        actual: line.len() / 2,
    })?;

    let after_pid = if pid.is_empty() {
        body
    } else {
        let idx = body.find(&pid).ok_or_else(|| ConvError::PidNotFound {
            pid: pid.clone(),
            response: line.clone(),
        })?;
        &body[idx + pid.len()..]
    };

    let wanted = formula.byte_len() * 2;
    if after_pid.len() < wanted {
        return Err(ConvError::DataTooShort {
            expected: formula.byte_len(),
            actual: after_pid.len() / 2,
        });
    }
    let bytes = hex::decode(&after_pid[..wanted]).map_err(|e| ConvError::InvalidHex(format!("{}: {}", line, e)))?;

    decode_payload(&bytes, formula)
}

/// Decode the leading `ceil(length / 8)` bytes of a payload, big-endian.
pub fn decode_payload(data: &[u8], formula: &SignalFormula) -> ConvResult<Decoded> {
    let needed = formula.byte_len();
    if data.len() < needed {
        return Err(ConvError::DataTooShort {
            expected: needed,
            actual: data.len(),
        });
    }

    let mut raw = data[..needed]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | *b as u64);
    if formula.length < 64 {
        raw &= (1u64 << formula.length) - 1;
    }

    physical(raw, formula, true)
}

/// Decode a signal at its exact bit position within a frame.
///
/// Database files write `[0|0]` for signals without a range; only those
/// skip the range check.
pub fn decode_frame_signal(data: &[u8], formula: &SignalFormula) -> ConvResult<Decoded> {
    let raw = extract_bits(data, formula)?;
    physical(raw, formula, formula.is_bounded())
}

/// Pull `length` bits out of `data` following database bit numbering.
///
/// Intel signals start at their least significant bit; Motorola signals
/// start at their most significant bit and walk the sawtooth layout.
pub fn extract_bits(data: &[u8], formula: &SignalFormula) -> ConvResult<u64> {
    let total_bits = data.len() * 8;
    let bit_at = |pos: usize| -> ConvResult<u64> {
        if pos >= total_bits {
            return Err(ConvError::DataTooShort {
                expected: pos / 8 + 1,
                actual: data.len(),
            });
        }
        Ok(((data[pos / 8] >> (pos % 8)) & 1) as u64)
    };

    let start = formula.start_bit as usize;
    let mut raw = 0u64;
    match formula.byte_order {
        ByteOrder::Intel => {
            for i in 0..formula.length as usize {
                raw |= bit_at(start + i)? << i;
            }
        }
        ByteOrder::Motorola => {
            let mut pos = start;
            for i in 0..formula.length as usize {
                raw = (raw << 1) | bit_at(pos)?;
                if i + 1 == formula.length as usize {
                    break;
                }
                pos = if pos % 8 == 0 {
                    pos + 15
                } else {
                    pos - 1
                };
            }
        }
    }
    Ok(raw)
}

/// Apply sign, scale, offset and, when `check_range`, the range to a raw value
fn physical(raw: u64, formula: &SignalFormula, check_range: bool) -> ConvResult<Decoded> {
    let raw = if formula.signed {
        sign_extend(raw, formula.length) as f64
    } else {
        raw as f64
    };

    let value = round_for_scale(raw * formula.scale + formula.offset, formula.scale);
    if check_range && (value < formula.min || value > formula.max) {
        return Err(ConvError::ValueOutOfRange {
            value,
            min: formula.min,
            max: formula.max,
        });
    }

    Ok(Decoded {
        value,
        unit: formula.unit.clone(),
    })
}

fn sign_extend(raw: u64, bits: u16) -> i64 {
    if bits >= 64 {
        return raw as i64;
    }
    let shift = 64 - bits as u32;
    ((raw << shift) as i64) >> shift
}
