use pnet::util::MacAddr;

use crate::error::ParseError;

pub const BROADCAST_MAC: [u8; 6] = [ 0xff, 0xff, 0xff, 0xff, 0xff, 0xff ];

/// Sync stream plus 16 copies of the address. Anything past this is a SecureOn suffix.
pub const WOL_PACKET_LEN: usize = 6 + 16 * 6;

/// Parses `00:11:22:33:44:55` or `00-11-22-33-44-55` into a MAC address.
///
/// Hyphens are rewritten to colons first, so mixed separators pass as long as
/// the result is six two-digit hex octets.
pub fn normalize_and_parse(text: &str) -> Result<MacAddr, ParseError> {
    let normalized = text.replace('-', ":");
    let octets: Vec<&str> = normalized.split(':').collect();
    if octets.len() != 6 {
        return Err(ParseError::OctetCount(octets.len()));
    }

    let mut bytes = [0u8; 6];
    for (byte, octet) in bytes.iter_mut().zip(&octets) {
        if octet.len() != 2 || !octet.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseError::InvalidOctet(octet.to_string()));
        }
        *byte = u8::from_str_radix(octet, 16)
            .map_err(|_| ParseError::InvalidOctet(octet.to_string()))?;
    }

    let [a, b, c, d, e, f] = bytes;
    Ok(MacAddr::new(a, b, c, d, e, f))
}

/// Checks whether `payload` is a magic packet for `target`.
///
/// Only the first 102 bytes are looked at; shorter payloads never match.
pub fn check_wol_payload(payload: &[u8], target: &MacAddr) -> bool {
    if payload.len() < WOL_PACKET_LEN { return false; }

    let target = target.octets();
    let mut blocks = payload[..WOL_PACKET_LEN].chunks_exact(6);
    if blocks.next() != Some(&BROADCAST_MAC[..]) {
        return false;
    }

    blocks.all(|block| block == target)
}
