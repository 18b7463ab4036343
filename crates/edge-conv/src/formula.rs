//! Formula grammar
//!
//! A PID request carries a tagged formula string:
//!
//! ```text
//! dbc:31|32@0+ (0.1,0) [1|4294967295] "km"
//! python:int(A)*256+B
//! ```
//!
//! Signal-database formulas are parsed once into a [`SignalFormula`]; script
//! formulas stay opaque and are evaluated by the hardware.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{ConvError, ConvResult};

const DBC_PREFIX: &str = "dbc:";
const SCRIPT_PREFIX: &str = "python:";

/// Longest signal the decoder can hold in a `u64`
pub const MAX_SIGNAL_BITS: u16 = 64;

/// Bit layout of a signal inside its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// `@0`, most significant byte first
    Motorola,
    /// `@1`, least significant byte first
    Intel,
}

/// Parsed `startBit|length@order± (scale,offset) [min|max] "unit"`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalFormula {
    pub start_bit: u16,
    pub length: u16,
    pub byte_order: ByteOrder,
    pub signed: bool,
    pub scale: f64,
    pub offset: f64,
    pub min: f64,
    pub max: f64,
    pub unit: String,
}

impl SignalFormula {
    /// Bytes needed to hold `length` bits
    pub fn byte_len(&self) -> usize {
        (self.length as usize).div_ceil(8)
    }

    /// `[0|0]` is the database convention for "no range"
    pub fn is_bounded(&self) -> bool {
        !(self.min == 0.0 && self.max == 0.0)
    }
}

impl FromStr for SignalFormula {
    type Err = ConvError;

    fn from_str(s: &str) -> ConvResult<Self> {
        let text = s.trim();

        let (bits, rest) = text
            .split_once('@')
            .ok_or_else(|| ConvError::formula(text, "missing '@'"))?;
        let (start, length) = bits
            .trim()
            .split_once('|')
            .ok_or_else(|| ConvError::formula(text, "missing 'start|length'"))?;
        let start_bit: u16 = parse_number(text, start, "start bit")?;
        let length: u16 = parse_number(text, length, "length")?;
        if length == 0 || length > MAX_SIGNAL_BITS {
            return Err(ConvError::formula(
                text,
                format!("length must be 1..={}", MAX_SIGNAL_BITS),
            ));
        }

        let mut chars = rest.chars();
        let byte_order = match chars.next() {
            Some('0') => ByteOrder::Motorola,
            Some('1') => ByteOrder::Intel,
            _ => return Err(ConvError::formula(text, "byte order must be 0 or 1")),
        };
        let signed = match chars.next() {
            Some('+') => false,
            Some('-') => true,
            _ => return Err(ConvError::formula(text, "sign must be '+' or '-'")),
        };
        let rest = chars.as_str();

        let factors = between(rest, '(', ')').ok_or_else(|| ConvError::formula(text, "missing (scale,offset)"))?;
        let (scale, offset) = factors
            .split_once(',')
            .ok_or_else(|| ConvError::formula(text, "missing ',' in (scale,offset)"))?;
        let scale: f64 = parse_number(text, scale, "scale")?;
        let offset: f64 = parse_number(text, offset, "offset")?;

        let range = between(rest, '[', ']').ok_or_else(|| ConvError::formula(text, "missing [min|max]"))?;
        let (min, max) = range
            .split_once('|')
            .ok_or_else(|| ConvError::formula(text, "missing '|' in [min|max]"))?;
        let min: f64 = parse_number(text, min, "min")?;
        let max: f64 = parse_number(text, max, "max")?;

        let unit = match (rest.find('"'), rest.rfind('"')) {
            (Some(open), Some(close)) if close > open => rest[open + 1..close].to_string(),
            _ => String::new(),
        };

        Ok(Self {
            start_bit,
            length,
            byte_order,
            signed,
            scale,
            offset,
            min,
            max,
            unit,
        })
    }
}

impl fmt::Display for SignalFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = match self.byte_order {
            ByteOrder::Motorola => 0,
            ByteOrder::Intel => 1,
        };
        let sign = if self.signed { '-' } else { '+' };
        write!(
            f,
            "{}|{}@{}{} ({},{}) [{}|{}] \"{}\"",
            self.start_bit, self.length, order, sign, self.scale, self.offset, self.min, self.max, self.unit
        )
    }
}

/// Tagged formula attached to a PID request
#[derive(Debug, Clone, PartialEq)]
pub enum Formula {
    /// Decoded locally from the response bytes
    SignalDatabase(SignalFormula),
    /// Evaluated by the hardware; the raw text is forwarded untouched
    Script { raw: String },
}

impl Formula {
    pub fn is_script(&self) -> bool {
        matches!(self, Formula::Script { .. })
    }

    pub fn signal(&self) -> Option<&SignalFormula> {
        match self {
            Formula::SignalDatabase(signal) => Some(signal),
            Formula::Script { .. } => None,
        }
    }
}

impl FromStr for Formula {
    type Err = ConvError;

    fn from_str(s: &str) -> ConvResult<Self> {
        let text = s.trim();
        if let Some(body) = strip_prefix_ignore_case(text, DBC_PREFIX) {
            Ok(Formula::SignalDatabase(body.parse()?))
        } else if let Some(body) = strip_prefix_ignore_case(text, SCRIPT_PREFIX) {
            Ok(Formula::Script {
                raw: body.trim().to_string(),
            })
        } else {
            Err(ConvError::formula(text, "expected 'dbc:' or 'python:' prefix"))
        }
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

fn between(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)? + open.len_utf8();
    let end = start + text[start..].find(close)?;
    Some(&text[start..end])
}

fn parse_number<T: FromStr>(formula: &str, value: &str, what: &str) -> ConvResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConvError::formula(formula, format!("invalid {}: '{}'", what, value.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_odometer_formula() {
        let formula: SignalFormula = r#"31|32@0+ (0.1,0) [1|4294967295] "km""#.parse().unwrap();
        assert_eq!(formula.start_bit, 31);
        assert_eq!(formula.length, 32);
        assert_eq!(formula.byte_order, ByteOrder::Motorola);
        assert!(!formula.signed);
        assert_eq!(formula.scale, 0.1);
        assert_eq!(formula.offset, 0.0);
        assert_eq!(formula.min, 1.0);
        assert_eq!(formula.max, 4294967295.0);
        assert_eq!(formula.unit, "km");
        assert_eq!(formula.byte_len(), 4);
    }

    #[test]
    fn test_parse_signed_intel_without_unit() {
        let formula: SignalFormula = "12|12@1- (0.5,-40) [-100|100]".parse().unwrap();
        assert_eq!(formula.byte_order, ByteOrder::Intel);
        assert!(formula.signed);
        assert_eq!(formula.offset, -40.0);
        assert_eq!(formula.unit, "");
        assert_eq!(formula.byte_len(), 2);
    }

    #[test]
    fn test_tagged_formula() {
        let dbc: Formula = r#"dbc:7|8@0+ (1,-40) [-40|215] "degC""#.parse().unwrap();
        assert!(!dbc.is_script());
        assert_eq!(dbc.signal().map(|s| s.offset), Some(-40.0));

        let script: Formula = "python: int(A)*256+B".parse().unwrap();
        assert_eq!(
            script,
            Formula::Script {
                raw: "int(A)*256+B".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_formulas() {
        assert!("7|8@2+ (1,0) [0|255] \"\"".parse::<SignalFormula>().is_err());
        assert!("7|0@0+ (1,0) [0|255] \"\"".parse::<SignalFormula>().is_err());
        assert!("7|65@0+ (1,0) [0|255] \"\"".parse::<SignalFormula>().is_err());
        assert!("7|8@0+ [0|255]".parse::<SignalFormula>().is_err());
        assert!("lua:foo".parse::<Formula>().is_err());
    }

    #[test]
    fn test_display_reparses() {
        let formula: SignalFormula = r#"31|32@0+ (0.1,0) [1|4294967295] "km""#.parse().unwrap();
        let again: SignalFormula = formula.to_string().parse().unwrap();
        assert_eq!(formula, again);
    }
}
