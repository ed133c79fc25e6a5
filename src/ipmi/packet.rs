//! RMCP / RMCP+ framing, session-setup payloads and IPMI LAN messages.

use crate::error::ControllerError;
use crate::ipmi::crypto::{SessionKeys, INTEGRITY_LEN};

pub const RMCP_HEADER: [u8; 4] = [0x06, 0x00, 0xff, 0x07];
const AUTH_TYPE_RMCP_PLUS: u8 = 0x06;
const NEXT_HEADER: u8 = 0x07;

const PAYLOAD_ENCRYPTED: u8 = 0x80;
const PAYLOAD_AUTHENTICATED: u8 = 0x40;
const PAYLOAD_TYPE_MASK: u8 = 0x3f;

/// RMCP header plus the IPMI v2.0 session header.
const HEADER_LEN: usize = 4 + 12;

pub mod payload_type {
    pub const IPMI: u8 = 0x00;
    pub const OPEN_SESSION_REQUEST: u8 = 0x10;
    pub const OPEN_SESSION_RESPONSE: u8 = 0x11;
    pub const RAKP_1: u8 = 0x12;
    pub const RAKP_2: u8 = 0x13;
    pub const RAKP_3: u8 = 0x14;
    pub const RAKP_4: u8 = 0x15;
}

pub mod algorithm {
    pub const NONE: u8 = 0x00;
    pub const AUTH_RAKP_HMAC_SHA1: u8 = 0x01;
    pub const INTEGRITY_HMAC_SHA1_96: u8 = 0x01;
    pub const CONFIDENTIALITY_AES_CBC_128: u8 = 0x01;
}

pub const BMC_ADDR: u8 = 0x20;
pub const CONSOLE_ADDR: u8 = 0x81;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    pub auth: u8,
    pub integrity: u8,
    pub confidentiality: u8,
}

/// Suites proposed in order: 3, 2, 1.
pub const CIPHER_SUITES: [CipherSuite; 3] = [
    CipherSuite {
        auth: algorithm::AUTH_RAKP_HMAC_SHA1,
        integrity: algorithm::INTEGRITY_HMAC_SHA1_96,
        confidentiality: algorithm::CONFIDENTIALITY_AES_CBC_128,
    },
    CipherSuite {
        auth: algorithm::AUTH_RAKP_HMAC_SHA1,
        integrity: algorithm::INTEGRITY_HMAC_SHA1_96,
        confidentiality: algorithm::NONE,
    },
    CipherSuite {
        auth: algorithm::AUTH_RAKP_HMAC_SHA1,
        integrity: algorithm::NONE,
        confidentiality: algorithm::NONE,
    },
];

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_16(bytes: &[u8], at: usize) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes[at..at + 16]);
    out
}

/// Two's complement checksum: the covered bytes plus the checksum sum to zero.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)).wrapping_neg()
}

#[derive(Debug)]
pub struct SessionPacket {
    pub payload_type: u8,
    pub session_id: u32,
    pub session_seq: u32,
    pub payload: Vec<u8>,
}

/// Wraps `payload` in RMCP + IPMI v2.0 session headers.
///
/// With `keys`, the payload is encrypted and/or followed by the integrity
/// trailer according to what the session negotiated.
pub fn encode_session_packet(
    payload_type: u8,
    session_id: u32,
    session_seq: u32,
    payload: &[u8],
    keys: Option<&SessionKeys>,
) -> Result<Vec<u8>, ControllerError> {
    let integrity = keys.is_some_and(|k| k.integrity);
    let mut type_byte = payload_type & PAYLOAD_TYPE_MASK;

    let body = match keys {
        Some(k) if k.confidentiality => {
            type_byte |= PAYLOAD_ENCRYPTED;
            k.encrypt(payload)?
        }
        _ => payload.to_vec(),
    };
    if integrity {
        type_byte |= PAYLOAD_AUTHENTICATED;
    }
    let body_len = u16::try_from(body.len()).map_err(|_| ControllerError::Protocol("payload too large"))?;

    let mut pkt = Vec::with_capacity(HEADER_LEN + body.len() + 4 + INTEGRITY_LEN);
    pkt.extend_from_slice(&RMCP_HEADER);
    pkt.push(AUTH_TYPE_RMCP_PLUS);
    pkt.push(type_byte);
    pkt.extend_from_slice(&session_id.to_le_bytes());
    pkt.extend_from_slice(&session_seq.to_le_bytes());
    pkt.extend_from_slice(&body_len.to_le_bytes());
    pkt.extend_from_slice(&body);

    if let Some(k) = keys.filter(|k| k.integrity) {
        // auth type .. next header must be a multiple of 4
        let span = pkt.len() - RMCP_HEADER.len() + 2;
        let pad = (4 - span % 4) % 4;
        pkt.extend(std::iter::repeat(0xff).take(pad));
        pkt.push(pad as u8);
        pkt.push(NEXT_HEADER);
        let code = k.integrity_code(&pkt[RMCP_HEADER.len()..])?;
        pkt.extend_from_slice(&code);
    }

    Ok(pkt)
}

pub fn decode_session_packet(bytes: &[u8], keys: Option<&SessionKeys>) -> Result<SessionPacket, ControllerError> {
    if bytes.len() < HEADER_LEN {
        return Err(ControllerError::Protocol("packet too short"));
    }
    if bytes[0] != RMCP_HEADER[0] || bytes[3] != RMCP_HEADER[3] {
        return Err(ControllerError::Protocol("not an RMCP IPMI packet"));
    }
    if bytes[4] != AUTH_TYPE_RMCP_PLUS {
        return Err(ControllerError::Protocol("not an RMCP+ session packet"));
    }

    let type_byte = bytes[5];
    let session_id = read_u32(bytes, 6);
    let session_seq = read_u32(bytes, 10);
    let len = u16::from_le_bytes([bytes[14], bytes[15]]) as usize;
    let body = bytes
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or(ControllerError::Protocol("payload length exceeds packet"))?;

    if type_byte & PAYLOAD_AUTHENTICATED != 0 {
        let k = keys
            .filter(|k| k.integrity)
            .ok_or(ControllerError::Protocol("unexpected authenticated packet"))?;
        if bytes.len() < HEADER_LEN + len + 2 + INTEGRITY_LEN {
            return Err(ControllerError::Protocol("integrity trailer truncated"));
        }
        let (signed, code) = bytes.split_at(bytes.len() - INTEGRITY_LEN);
        k.verify_integrity(&signed[RMCP_HEADER.len()..], code)?;
    } else if keys.is_some_and(|k| k.integrity) {
        return Err(ControllerError::Protocol("session packet lacks integrity data"));
    }

    let payload = if type_byte & PAYLOAD_ENCRYPTED != 0 {
        keys.filter(|k| k.confidentiality)
            .ok_or(ControllerError::Protocol("unexpected encrypted packet"))?
            .decrypt(body)?
    } else {
        body.to_vec()
    };

    Ok(SessionPacket {
        payload_type: type_byte & PAYLOAD_TYPE_MASK,
        session_id,
        session_seq,
        payload,
    })
}

pub fn open_session_request(tag: u8, privilege: u8, remote_session_id: u32, suite: CipherSuite) -> Vec<u8> {
    let mut payload = vec![tag, privilege, 0, 0];
    payload.extend_from_slice(&remote_session_id.to_le_bytes());
    for (kind, algo) in [(0x00, suite.auth), (0x01, suite.integrity), (0x02, suite.confidentiality)] {
        payload.extend_from_slice(&[kind, 0, 0, 0x08, algo, 0, 0, 0]);
    }
    payload
}

#[derive(Debug)]
pub struct OpenSessionResponse {
    pub tag: u8,
    pub status: u8,
    pub remote_session_id: u32,
    pub managed_session_id: u32,
    pub suite: CipherSuite,
}

/// On a non-zero status the BMC may truncate the body, so only tag and status are read.
pub fn parse_open_session_response(p: &[u8]) -> Result<OpenSessionResponse, ControllerError> {
    if p.len() < 2 {
        return Err(ControllerError::Protocol("Open Session response too short"));
    }
    let (tag, status) = (p[0], p[1]);
    if status != 0 {
        return Ok(OpenSessionResponse {
            tag,
            status,
            remote_session_id: 0,
            managed_session_id: 0,
            suite: CipherSuite { auth: 0, integrity: 0, confidentiality: 0 },
        });
    }
    if p.len() < 36 {
        return Err(ControllerError::Protocol("Open Session response too short"));
    }
    Ok(OpenSessionResponse {
        tag,
        status,
        remote_session_id: read_u32(p, 4),
        managed_session_id: read_u32(p, 8),
        suite: CipherSuite {
            auth: p[16] & 0x3f,
            integrity: p[24] & 0x3f,
            confidentiality: p[32] & 0x3f,
        },
    })
}

pub fn rakp_message_1(tag: u8, managed_session_id: u32, console_random: &[u8; 16], role: u8, username: &[u8]) -> Vec<u8> {
    let mut payload = vec![tag, 0, 0, 0];
    payload.extend_from_slice(&managed_session_id.to_le_bytes());
    payload.extend_from_slice(console_random);
    payload.extend_from_slice(&[role, 0, 0, username.len() as u8]);
    payload.extend_from_slice(username);
    payload
}

#[derive(Debug)]
pub struct RakpMessage2 {
    pub tag: u8,
    pub remote_session_id: u32,
    pub bmc_random: [u8; 16],
    pub bmc_guid: [u8; 16],
    pub auth_code: Vec<u8>,
}

pub fn parse_rakp_message_2(p: &[u8]) -> Result<RakpMessage2, ControllerError> {
    if p.len() < 2 {
        return Err(ControllerError::Protocol("RAKP message 2 too short"));
    }
    if p[1] != 0 {
        return Err(ControllerError::SessionRejected(p[1]));
    }
    if p.len() < 40 {
        return Err(ControllerError::Protocol("RAKP message 2 too short"));
    }
    Ok(RakpMessage2 {
        tag: p[0],
        remote_session_id: read_u32(p, 4),
        bmc_random: read_16(p, 8),
        bmc_guid: read_16(p, 24),
        auth_code: p[40..].to_vec(),
    })
}

pub fn rakp_message_3(tag: u8, managed_session_id: u32, auth_code: &[u8]) -> Vec<u8> {
    let mut payload = vec![tag, 0, 0, 0];
    payload.extend_from_slice(&managed_session_id.to_le_bytes());
    payload.extend_from_slice(auth_code);
    payload
}

#[derive(Debug)]
pub struct RakpMessage4 {
    pub tag: u8,
    pub remote_session_id: u32,
    pub icv: Vec<u8>,
}

pub fn parse_rakp_message_4(p: &[u8]) -> Result<RakpMessage4, ControllerError> {
    if p.len() < 2 {
        return Err(ControllerError::Protocol("RAKP message 4 too short"));
    }
    if p[1] != 0 {
        return Err(ControllerError::SessionRejected(p[1]));
    }
    if p.len() < 8 {
        return Err(ControllerError::Protocol("RAKP message 4 too short"));
    }
    Ok(RakpMessage4 {
        tag: p[0],
        remote_session_id: read_u32(p, 4),
        icv: p[8..].to_vec(),
    })
}

/// IPMI LAN request: `rsAddr netFn/LUN chk1 rqAddr rqSeq/LUN cmd data.. chk2`.
pub fn encode_lan_request(netfn: u8, cmd: u8, rq_seq: u8, data: &[u8]) -> Vec<u8> {
    let mut msg = vec![BMC_ADDR, netfn << 2];
    msg.push(checksum(&msg));
    let body = msg.len();
    msg.extend_from_slice(&[CONSOLE_ADDR, rq_seq << 2, cmd]);
    msg.extend_from_slice(data);
    msg.push(checksum(&msg[body..]));
    msg
}

#[derive(Debug, PartialEq, Eq)]
pub struct LanResponse {
    pub completion_code: u8,
    pub data: Vec<u8>,
}

/// Whether `msg` answers the request identified by `netfn`, `cmd` and `rq_seq`.
pub fn lan_response_matches(netfn: u8, cmd: u8, rq_seq: u8, msg: &[u8]) -> bool {
    msg.len() >= 8 &&
        msg[1] >> 2 == netfn | 0x01 &&
        msg[4] >> 2 == rq_seq &&
        msg[5] == cmd
}

pub fn decode_lan_response(netfn: u8, cmd: u8, rq_seq: u8, msg: &[u8]) -> Result<LanResponse, ControllerError> {
    if msg.len() < 8 {
        return Err(ControllerError::Protocol("IPMI response too short"));
    }
    if checksum(&msg[..3]) != 0 || checksum(&msg[3..]) != 0 {
        return Err(ControllerError::Protocol("IPMI response checksum mismatch"));
    }
    if msg[0] != CONSOLE_ADDR || msg[1] >> 2 != netfn | 0x01 {
        return Err(ControllerError::Protocol("IPMI response for another requester"));
    }
    if msg[4] >> 2 != rq_seq || msg[5] != cmd {
        return Err(ControllerError::Protocol("IPMI response does not match request"));
    }
    Ok(LanResponse {
        completion_code: msg[6],
        data: msg[7..msg.len() - 1].to_vec(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// What a BMC would answer to a LAN request.
    pub(crate) fn lan_response(request: &[u8], completion_code: u8, data: &[u8]) -> Vec<u8> {
        let netfn = (request[1] >> 2) | 0x01;
        let mut msg = vec![CONSOLE_ADDR, netfn << 2];
        msg.push(checksum(&msg));
        let body = msg.len();
        msg.extend_from_slice(&[BMC_ADDR, request[4], request[5], completion_code]);
        msg.extend_from_slice(data);
        msg.push(checksum(&msg[body..]));
        msg
    }

    #[test]
    fn checksum_zeroes_the_sum() {
        assert_eq!(checksum(&[0x20, 0x00]), 0xe0);
        assert_eq!(checksum(&[]), 0x00);
        let c = checksum(&[0x81, 0x04, 0x01]);
        assert_eq!(0x81u8.wrapping_add(0x04).wrapping_add(0x01).wrapping_add(c), 0);
    }

    #[test]
    fn get_chassis_status_request_layout() {
        let msg = encode_lan_request(0x00, 0x01, 1, &[]);
        assert_eq!(msg, vec![0x20, 0x00, 0xe0, 0x81, 0x04, 0x01, 0x7a]);
    }

    #[test]
    fn response_to_earlier_request_does_not_match() {
        let first = encode_lan_request(0x00, 0x01, 3, &[]);
        let second = encode_lan_request(0x00, 0x02, 4, &[0x01]);
        let stale = lan_response(&first, 0x00, &[0x01, 0, 0, 0]);

        assert!(lan_response_matches(0x00, 0x01, 3, &stale));
        assert!(!lan_response_matches(0x00, 0x02, 4, &stale));
        assert!(lan_response_matches(0x00, 0x02, 4, &lan_response(&second, 0x00, &[])));
        assert!(!lan_response_matches(0x00, 0x01, 3, &stale[..5]));
    }

    #[test]
    fn lan_response_is_matched_against_request() {
        let request = encode_lan_request(0x00, 0x01, 5, &[]);
        let reply = lan_response(&request, 0x00, &[0x41, 0x00, 0x00, 0x00]);

        let decoded = decode_lan_response(0x00, 0x01, 5, &reply).unwrap();
        assert_eq!(decoded, LanResponse { completion_code: 0, data: vec![0x41, 0x00, 0x00, 0x00] });

        assert!(decode_lan_response(0x00, 0x01, 6, &reply).is_err());
        assert!(decode_lan_response(0x00, 0x02, 5, &reply).is_err());

        let mut corrupted = reply.clone();
        corrupted[7] ^= 0x01;
        assert!(decode_lan_response(0x00, 0x01, 5, &corrupted).is_err());
    }

    #[test]
    fn plain_session_packet_layout() {
        let payload = open_session_request(0x2a, 0x03, 0xdead_beef, CIPHER_SUITES[0]);
        assert_eq!(payload.len(), 32);

        let pkt = encode_session_packet(payload_type::OPEN_SESSION_REQUEST, 0, 0, &payload, None).unwrap();
        assert_eq!(&pkt[..6], &[0x06, 0x00, 0xff, 0x07, 0x06, 0x10]);
        assert_eq!(&pkt[14..16], &[32, 0]);
        assert_eq!(pkt.len(), HEADER_LEN + 32);
        assert_eq!(&pkt[HEADER_LEN + 4..HEADER_LEN + 8], &0xdead_beefu32.to_le_bytes());

        let decoded = decode_session_packet(&pkt, None).unwrap();
        assert_eq!(decoded.payload_type, payload_type::OPEN_SESSION_REQUEST);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn authenticated_span_is_padded_to_four() {
        let keys = SessionKeys::derive(&[7; 20], true, false).unwrap();
        for len in 0..8 {
            let payload = vec![0x11; len];
            let pkt = encode_session_packet(payload_type::IPMI, 9, 1, &payload, Some(&keys)).unwrap();
            assert_eq!(pkt[5], PAYLOAD_AUTHENTICATED);
            let span = pkt.len() - RMCP_HEADER.len() - INTEGRITY_LEN;
            assert_eq!(span % 4, 0, "payload len {len}");
            assert_eq!(pkt[pkt.len() - INTEGRITY_LEN - 1], NEXT_HEADER);

            let decoded = decode_session_packet(&pkt, Some(&keys)).unwrap();
            assert_eq!(decoded.payload, payload);
            assert_eq!(decoded.session_id, 9);
            assert_eq!(decoded.session_seq, 1);
        }
    }

    #[test]
    fn encrypted_packet_decodes_and_rejects_tampering() {
        let keys = SessionKeys::derive(&[9; 20], true, true).unwrap();
        let request = encode_lan_request(0x00, 0x02, 3, &[0x01]);
        let mut pkt = encode_session_packet(payload_type::IPMI, 0x1234, 2, &request, Some(&keys)).unwrap();
        assert_eq!(pkt[5], PAYLOAD_ENCRYPTED | PAYLOAD_AUTHENTICATED);

        let decoded = decode_session_packet(&pkt, Some(&keys)).unwrap();
        assert_eq!(decoded.payload, request);

        pkt[HEADER_LEN + 20] ^= 0x80;
        assert!(decode_session_packet(&pkt, Some(&keys)).is_err());
    }

    #[test]
    fn unauthenticated_packet_rejected_inside_integrity_session() {
        let keys = SessionKeys::derive(&[9; 20], true, false).unwrap();
        let pkt = encode_session_packet(payload_type::IPMI, 1, 1, &[0x00], None).unwrap();
        assert!(decode_session_packet(&pkt, Some(&keys)).is_err());
    }

    #[test]
    fn open_session_rejection_is_read_from_short_body() {
        let resp = parse_open_session_response(&[0x2a, 0x11, 0x00, 0x00, 1, 2, 3, 4]).unwrap();
        assert_eq!(resp.tag, 0x2a);
        assert_eq!(resp.status, 0x11);
        assert!(parse_open_session_response(&[0x2a, 0x00, 0x04]).is_err());
    }

    #[test]
    fn rakp2_rejection_surfaces_status() {
        assert!(matches!(
            parse_rakp_message_2(&[0x01, 0x0d, 0, 0]),
            Err(ControllerError::SessionRejected(0x0d))
        ));
    }
}
