//! VIN query table and multi-frame VIN extraction

use edge_core::{ObdQuery, Vin, VinQuery, VIN_LENGTH};

use crate::error::FingerprintError;

/// Bump when the query table changes; resets the cached winner and the
/// failed-boot counter
pub const FINGERPRINT_VERSION: u32 = 2;

/// Name of the passive CAN scan sentinel
pub const PASSIVE_QUERY_NAME: &str = "passive_can";

/// Lines shorter than this carry no VIN bytes
const MIN_LINE_CHARS: usize = 6;

const fn query(name: &'static str, protocol: &'static str, header: u32, mode: u32, pid: u32) -> VinQuery {
    VinQuery {
        name,
        protocol,
        header,
        mode,
        pid,
        response_header: None,
    }
}

/// Ordered VIN queries, most common first. Protocol ids are the hardware's:
/// 6 = ISO 15765-4 11-bit 500k, 7 = 29-bit 500k, 8 = 11-bit 250k, 9 = 29-bit 250k.
pub const VIN_QUERIES: &[VinQuery] = &[
    query("vin_7DF_09_02", "6", 0x7DF, 0x09, 0x02),
    query("vin_7E0_22_F190", "6", 0x7E0, 0x22, 0xF190),
    query("vin_18DB33F1_09_02", "7", 0x18DB33F1, 0x09, 0x02),
    query("vin_18DA10F1_22_F190", "7", 0x18DA10F1, 0x22, 0xF190),
    query("vin_7DF_09_02_250k", "8", 0x7DF, 0x09, 0x02),
    query("vin_18DB33F1_09_02_250k", "9", 0x18DB33F1, 0x09, 0x02),
    VinQuery {
        name: "vin_7E0_22_F190_7E8",
        protocol: "6",
        header: 0x7E0,
        mode: 0x22,
        pid: 0xF190,
        response_header: Some(0x7E8),
    },
    query(PASSIVE_QUERY_NAME, "", 0, 0, 0),
];

/// Raw hardware request for one VIN query
pub fn vin_obd_query(query: &VinQuery) -> ObdQuery {
    ObdQuery {
        name: query.name.to_string(),
        header: query.header,
        mode: query.mode,
        pid: query.pid,
        protocol: query.protocol.to_string(),
        formula: None,
        flow_control_id_pair: query
            .response_header
            .map(|response| format!("{:x},{:x}", query.header, response)),
        flow_control_clear: false,
    }
}

/// Queries in the order they should be tried: a cached winner first, then
/// the rest of the table
pub fn ordered_queries(cached_name: Option<&str>) -> Vec<VinQuery> {
    let mut queries = VIN_QUERIES.to_vec();
    if let Some(name) = cached_name {
        if let Some(pos) = queries.iter().position(|q| q.name == name) {
            let winner = queries.remove(pos);
            queries.insert(0, winner);
        }
    }
    queries
}

/// A VIN and where its bytes started in each response line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedVin {
    pub vin: Vin,
    /// Hex chars dropped from the front of every line
    pub start_position: usize,
}

/// Recover a VIN from the hex lines of a multi-frame response.
///
/// The frame header width is not assumed: it is the longest prefix shared by
/// every line, which covers 11-bit and 29-bit headers alike.
pub fn extract_vin<S: AsRef<str>>(lines: &[S]) -> Result<ExtractedVin, FingerprintError> {
    let lines: Vec<String> = lines
        .iter()
        .map(|l| l.as_ref().trim().to_ascii_lowercase())
        .filter(|l| l.len() >= MIN_LINE_CHARS && l.bytes().all(|b| b.is_ascii_hexdigit()))
        .collect();
    if lines.is_empty() {
        return Err(FingerprintError::Extract("no usable response lines".to_string()));
    }

    let start_position = common_prefix_len(&lines);

    let mut chars = String::new();
    for line in &lines {
        let mut payload = &line[start_position..];
        if payload.len() % 2 == 1 {
            payload = &payload[1..];
        }
        let bytes = hex::decode(payload)
            .map_err(|e| FingerprintError::Extract(format!("{}: {}", line, e)))?;

        chars.extend(
            bytes
                .iter()
                .skip_while(|b| !(b.is_ascii_uppercase() || b.is_ascii_digit()))
                .filter(|b| b.is_ascii_alphanumeric())
                .map(|b| *b as char),
        );
    }

    if chars.len() > VIN_LENGTH {
        chars = chars.split_off(chars.len() - VIN_LENGTH);
    }

    let vin = Vin::parse(&chars).map_err(|e| FingerprintError::Extract(e.to_string()))?;
    Ok(ExtractedVin { vin, start_position })
}

/// Length of the prefix shared by all lines. A single line has nothing to
/// compare against, so its header width is inferred from its shape.
fn common_prefix_len(lines: &[String]) -> usize {
    if lines.len() == 1 {
        return if lines[0].starts_with("18da") { 8 } else { 3 };
    }

    let shortest = lines.iter().map(String::len).min().unwrap_or(0);
    let first = lines[0].as_bytes();
    (0..shortest)
        .find(|&i| lines.iter().any(|l| l.as_bytes()[i] != first[i]))
        .unwrap_or(shortest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_6_multi_frame() {
        let lines = [
            "7e8101b62f190314654",
            "7e8214557314350334e",
            "7e8224b453638353933",
            "7e82300000000000000",
        ];
        let extracted = extract_vin(&lines).unwrap();
        assert_eq!(extracted.vin.as_str(), "1FTEW1CP3NKE68593");
        assert_eq!(extracted.start_position, 3);
    }

    #[test]
    fn test_29bit_multi_frame() {
        let lines = [
            "18daf1101014490201354a36",
            "18daf110215257324838394b",
            "18daf110224c303132333032",
        ];
        let extracted = extract_vin(&lines).unwrap();
        assert_eq!(extracted.vin.as_str(), "5J6RW2H89KL012302");
        assert_eq!(extracted.start_position, 8);
    }

    #[test]
    fn test_short_lines_are_ignored() {
        let lines = [
            "7e8101b62f190314654",
            "7e8",
            "7e8214557314350334e",
            "7e8224b453638353933",
        ];
        assert_eq!(extract_vin(&lines).unwrap().vin.as_str(), "1FTEW1CP3NKE68593");
    }

    #[test]
    fn test_invalid_responses() {
        assert!(extract_vin::<&str>(&[]).is_err());
        assert!(extract_vin(&["NO DATA"]).is_err());
        // Only two frames: 10 chars, not a VIN
        assert!(extract_vin(&["7e8101b62f190314654", "7e8214557314350334e"]).is_err());
    }

    #[test]
    fn test_non_hex_lines_are_skipped() {
        assert!(extract_vin(&["ab€123456"]).is_err());

        let lines = [
            "7e8101b62f190314654",
            "7e8 BUS ERROR €",
            "7e8214557314350334e",
            "7e8224b453638353933",
        ];
        assert_eq!(extract_vin(&lines).unwrap().vin.as_str(), "1FTEW1CP3NKE68593");
    }

    #[test]
    fn test_round_trip_through_frames() {
        // Lay a VIN out the way a 11-bit ISO-TP response arrives
        let vin = "WDD2050461F123456";
        let mut payload = vec![0x49, 0x02, 0x01];
        payload.extend_from_slice(vin.as_bytes());
        let mut lines = vec![format!("7e81014{}", hex::encode(&payload[..6]))];
        for (i, chunk) in payload[6..].chunks(7).enumerate() {
            let mut frame = chunk.to_vec();
            frame.resize(7, 0);
            lines.push(format!("7e82{}{}", i + 1, hex::encode(frame)));
        }

        assert_eq!(extract_vin(&lines).unwrap().vin.as_str(), vin);
    }

    #[test]
    fn test_cached_query_goes_first() {
        let ordered = ordered_queries(Some("vin_18DB33F1_09_02"));
        assert_eq!(ordered[0].name, "vin_18DB33F1_09_02");
        assert_eq!(ordered.len(), VIN_QUERIES.len());

        let default = ordered_queries(Some("unknown"));
        assert_eq!(default[0].name, "vin_7DF_09_02");
        assert!(default.last().unwrap().is_passive());
    }

    #[test]
    fn test_flow_control_pair_for_directed_query() {
        let directed = VIN_QUERIES.iter().find(|q| q.name == "vin_7E0_22_F190_7E8").unwrap();
        let request = vin_obd_query(directed);
        assert_eq!(request.flow_control_id_pair.as_deref(), Some("7e0,7e8"));
        assert_eq!(request.protocol, "6");
        assert!(request.formula.is_none());

        assert!(vin_obd_query(&VIN_QUERIES[0]).flow_control_id_pair.is_none());
    }
}
