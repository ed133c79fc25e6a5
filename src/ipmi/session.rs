use async_trait::async_trait;

use crate::error::ControllerError;
use crate::ipmi::crypto::{self, Exchange, SessionKeys};
use crate::ipmi::packet::{
    self, algorithm, payload_type, CipherSuite, OpenSessionResponse, CIPHER_SUITES,
};
use crate::ipmi::transport::UdpTransport;
use crate::ipmi::PrivilegeLevel;
use crate::power::ControllerSession;

const NETFN_CHASSIS: u8 = 0x00;
const NETFN_APP: u8 = 0x06;
const CMD_GET_CHASSIS_STATUS: u8 = 0x01;
const CMD_CHASSIS_CONTROL: u8 = 0x02;
const CMD_CLOSE_SESSION: u8 = 0x3c;
const CHASSIS_POWER_UP: u8 = 0x01;

/// Look the user up by name only, the way ipmitool does.
const NAME_ONLY_LOOKUP: u8 = 0x10;

const MAX_USERNAME_LEN: usize = 16;

/// Open Session status codes that mean "try a weaker cipher suite".
fn cipher_rejected(status: u8) -> bool {
    matches!(status, 0x05 | 0x07 | 0x10 | 0x11 | 0x12)
}

/// An active RMCP+ session.
pub struct IpmiSession {
    transport: UdpTransport,
    remote_session_id: u32,
    managed_session_id: u32,
    keys: SessionKeys,
    next_seq: u32,
    rq_seq: u8,
    active: bool,
}

impl IpmiSession {
    /// Runs Open Session and the four RAKP messages.
    pub async fn open(
        transport: UdpTransport,
        username: &[u8],
        password: &[u8],
        privilege: PrivilegeLevel,
    ) -> Result<Self, ControllerError> {
        if username.len() > MAX_USERNAME_LEN {
            return Err(ControllerError::Auth("username longer than 16 bytes"));
        }
        let kuid = crypto::user_key(password)?;

        let remote_session_id = rand::random::<u32>().max(1);
        let (open, suite) = open_session(&transport, remote_session_id, privilege).await?;
        let managed_session_id = open.managed_session_id;

        let console_random: [u8; 16] = rand::random();
        let role = NAME_ONLY_LOOKUP | privilege.as_u8();

        let tag: u8 = rand::random();
        let rakp1 = packet::rakp_message_1(tag, managed_session_id, &console_random, role, username);
        let reply = exchange(&transport, payload_type::RAKP_1, &rakp1, payload_type::RAKP_2).await?;
        let rakp2 = packet::parse_rakp_message_2(&reply)?;
        if rakp2.tag != tag || rakp2.remote_session_id != remote_session_id {
            return Err(ControllerError::Protocol("RAKP message 2 does not match request"));
        }

        let ex = Exchange {
            remote_session_id,
            managed_session_id,
            console_random,
            bmc_random: rakp2.bmc_random,
            bmc_guid: rakp2.bmc_guid,
            role,
            username,
        };
        ex.verify_rakp2(&kuid, &rakp2.auth_code)?;
        let sik = ex.session_integrity_key(&kuid)?;

        let tag: u8 = rand::random();
        let rakp3 = packet::rakp_message_3(tag, managed_session_id, &ex.rakp3_code(&kuid)?);
        let reply = exchange(&transport, payload_type::RAKP_3, &rakp3, payload_type::RAKP_4).await?;
        let rakp4 = packet::parse_rakp_message_4(&reply)?;
        if rakp4.tag != tag || rakp4.remote_session_id != remote_session_id {
            return Err(ControllerError::Protocol("RAKP message 4 does not match request"));
        }
        ex.verify_rakp4(&sik, &rakp4.icv)?;

        let keys = SessionKeys::derive(
            &sik,
            suite.integrity != algorithm::NONE,
            suite.confidentiality != algorithm::NONE,
        )?;
        log::trace!(
            "[ipmi] session {managed_session_id:#010x} up (integrity: {}, confidentiality: {})",
            keys.integrity,
            keys.confidentiality,
        );

        Ok(Self {
            transport,
            remote_session_id,
            managed_session_id,
            keys,
            next_seq: 1,
            rq_seq: 0,
            active: true,
        })
    }

    /// Sends one IPMI command and returns the response data after the completion code.
    async fn command(&mut self, netfn: u8, cmd: u8, data: &[u8]) -> Result<Vec<u8>, ControllerError> {
        let rq_seq = self.rq_seq;
        self.rq_seq = (self.rq_seq + 1) & 0x3f;
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);

        let request = packet::encode_lan_request(netfn, cmd, rq_seq, data);
        let pkt = packet::encode_session_packet(
            payload_type::IPMI,
            self.managed_session_id,
            seq,
            &request,
            Some(&self.keys),
        )?;

        let keys = &self.keys;
        let (remote_id, managed_id) = (self.remote_session_id, self.managed_session_id);
        let response = self.transport.send_recv(&pkt, |raw| {
            let reply = match packet::decode_session_packet(raw, Some(keys)) {
                Ok(reply) => reply,
                Err(e) => {
                    log::debug!("[ipmi] dropping undecodable reply: {e}");
                    return Ok(None);
                }
            };
            // BMCs disagree on which session id goes into responses
            if reply.payload_type != payload_type::IPMI
                || (reply.session_id != remote_id && reply.session_id != managed_id)
                || !packet::lan_response_matches(netfn, cmd, rq_seq, &reply.payload)
            {
                return Ok(None);
            }
            log::trace!("[ipmi] reply seq {} to {netfn:#04x}/{cmd:#04x}", reply.session_seq);
            packet::decode_lan_response(netfn, cmd, rq_seq, &reply.payload).map(Some)
        }).await?;
        if response.completion_code != 0x00 {
            return Err(ControllerError::Completion(response.completion_code));
        }
        Ok(response.data)
    }
}

/// One session setup round trip. Every setup message starts with its tag;
/// replies of another type or tag are dropped.
async fn exchange(
    transport: &UdpTransport,
    request_type: u8,
    payload: &[u8],
    response_type: u8,
) -> Result<Vec<u8>, ControllerError> {
    let tag = payload.first().copied();
    let pkt = packet::encode_session_packet(request_type, 0, 0, payload, None)?;
    transport.send_recv(&pkt, |raw| {
        let Ok(reply) = packet::decode_session_packet(raw, None) else {
            return Ok(None);
        };
        if reply.payload_type != response_type || reply.payload.first().copied() != tag {
            return Ok(None);
        }
        Ok(Some(reply.payload))
    }).await
}

async fn open_session(
    transport: &UdpTransport,
    remote_session_id: u32,
    privilege: PrivilegeLevel,
) -> Result<(OpenSessionResponse, CipherSuite), ControllerError> {
    for suite in CIPHER_SUITES {
        let tag: u8 = rand::random();
        let request = packet::open_session_request(tag, privilege.as_u8(), remote_session_id, suite);
        let reply = exchange(
            transport,
            payload_type::OPEN_SESSION_REQUEST,
            &request,
            payload_type::OPEN_SESSION_RESPONSE,
        ).await?;

        let response = packet::parse_open_session_response(&reply)?;
        if response.tag != tag {
            return Err(ControllerError::Protocol("Open Session response tag mismatch"));
        }
        match response.status {
            0x00 => {
                if response.remote_session_id != remote_session_id {
                    return Err(ControllerError::Protocol("Open Session remote session id mismatch"));
                }
                if response.suite != suite {
                    return Err(ControllerError::Protocol("BMC selected a cipher suite we did not offer"));
                }
                return Ok((response, suite));
            }
            status if cipher_rejected(status) => {
                log::debug!("[ipmi] cipher suite {suite:?} rejected (status {status:#04x})");
            }
            status => return Err(ControllerError::SessionRejected(status)),
        }
    }
    Err(ControllerError::Protocol("no cipher suite accepted by BMC"))
}

#[async_trait]
impl ControllerSession for IpmiSession {
    async fn is_powered_on(&mut self) -> Result<bool, ControllerError> {
        let data = self.command(NETFN_CHASSIS, CMD_GET_CHASSIS_STATUS, &[]).await?;
        data.first()
            .map(|current| current & 0x01 != 0)
            .ok_or(ControllerError::Protocol("Get Chassis Status response too short"))
    }

    async fn power_on(&mut self) -> Result<(), ControllerError> {
        self.command(NETFN_CHASSIS, CMD_CHASSIS_CONTROL, &[CHASSIS_POWER_UP]).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ControllerError> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        let id = self.managed_session_id.to_le_bytes();
        self.command(NETFN_APP, CMD_CLOSE_SESSION, &id).await?;
        Ok(())
    }
}
