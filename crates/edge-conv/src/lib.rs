//! edge-conv - Signal formula decoding for OBD responses and CAN frames
//!
//! PID requests carry a formula tagged `dbc:` (decoded here) or `python:`
//! (evaluated by the hardware). Passive CAN traffic is decoded from signal
//! database text with the same scaling and range rules.
//!
//! # Quick Start
//!
//! ```rust
//! use edge_conv::{decode_obd_response, Formula};
//!
//! let formula: Formula = r#"dbc:31|32@0+ (0.1,0) [1|4294967295] "km""#.parse().unwrap();
//! let signal = formula.signal().unwrap();
//!
//! // 7E8 06 41 A6 0008B242 → 569922 * 0.1 km
//! let decoded = decode_obd_response("7e80641a60008b24200", "a6", signal).unwrap();
//! assert_eq!(decoded.value, 56992.2);
//! assert_eq!(decoded.unit, "km");
//! ```
//!
//! # Formula grammar
//!
//! | Part | Meaning |
//! |------|---------|
//! | `31\|32` | start bit and length in bits |
//! | `@0` / `@1` | Motorola (big-endian) / Intel (little-endian) |
//! | `+` / `-` | unsigned / two's complement |
//! | `(0.1,0)` | scale and offset |
//! | `[1\|4294967295]` | accepted physical range, `[0\|0]` for none |
//! | `"km"` | unit |

pub mod dbc;
pub mod decode;
pub mod error;
pub mod formula;
pub mod precision;

pub use dbc::{DbcMessage, DbcSignal, SignalDatabase};
pub use decode::{decode_frame_signal, decode_obd_response, decode_payload, extract_bits, Decoded};
pub use error::{ConvError, ConvResult};
pub use formula::{ByteOrder, Formula, SignalFormula};
pub use precision::round_for_scale;
