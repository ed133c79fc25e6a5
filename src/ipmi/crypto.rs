//! RAKP-HMAC-SHA1 key exchange, HMAC-SHA1-96 integrity and AES-CBC-128
//! confidentiality (cipher suite 3).

use aes::Aes128;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use crate::error::ControllerError;

type HmacSha1 = Hmac<Sha1>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const KEY_LEN: usize = 20;
pub const INTEGRITY_LEN: usize = 12;
const AES_BLOCK: usize = 16;

fn mac_over(key: &[u8], parts: &[&[u8]]) -> Result<HmacSha1, ControllerError> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| ControllerError::Crypto("bad HMAC key"))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

fn digest(key: &[u8], parts: &[&[u8]]) -> Result<[u8; KEY_LEN], ControllerError> {
    let tag = mac_over(key, parts)?.finalize().into_bytes();
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// K_UID: the password zero-padded to 20 bytes.
pub fn user_key(password: &[u8]) -> Result<[u8; KEY_LEN], ControllerError> {
    if password.len() > KEY_LEN {
        return Err(ControllerError::Auth("password longer than 20 bytes"));
    }
    let mut key = [0u8; KEY_LEN];
    key[..password.len()].copy_from_slice(password);
    Ok(key)
}

/// Values both sides feed into every RAKP digest.
pub struct Exchange<'a> {
    pub remote_session_id: u32,
    pub managed_session_id: u32,
    pub console_random: [u8; 16],
    pub bmc_random: [u8; 16],
    pub bmc_guid: [u8; 16],
    pub role: u8,
    pub username: &'a [u8],
}

impl Exchange<'_> {
    fn ulen(&self) -> [u8; 1] {
        [self.username.len() as u8]
    }

    /// Auth code the BMC must present in RAKP message 2.
    pub fn verify_rakp2(&self, kuid: &[u8], code: &[u8]) -> Result<(), ControllerError> {
        mac_over(kuid, &[
            &self.remote_session_id.to_le_bytes(),
            &self.managed_session_id.to_le_bytes(),
            &self.console_random,
            &self.bmc_random,
            &self.bmc_guid,
            &[self.role],
            &self.ulen(),
            self.username,
        ])?
        .verify_slice(code)
        .map_err(|_| ControllerError::Auth("RAKP message 2 auth code mismatch"))
    }

    /// Auth code we present in RAKP message 3.
    pub fn rakp3_code(&self, kuid: &[u8]) -> Result<[u8; KEY_LEN], ControllerError> {
        digest(kuid, &[
            &self.bmc_random,
            &self.remote_session_id.to_le_bytes(),
            &[self.role],
            &self.ulen(),
            self.username,
        ])
    }

    pub fn session_integrity_key(&self, kg: &[u8]) -> Result<[u8; KEY_LEN], ControllerError> {
        digest(kg, &[
            &self.console_random,
            &self.bmc_random,
            &[self.role],
            &self.ulen(),
            self.username,
        ])
    }

    #[cfg(test)]
    pub fn rakp2_code(&self, kuid: &[u8]) -> Result<[u8; KEY_LEN], ControllerError> {
        digest(kuid, &[
            &self.remote_session_id.to_le_bytes(),
            &self.managed_session_id.to_le_bytes(),
            &self.console_random,
            &self.bmc_random,
            &self.bmc_guid,
            &[self.role],
            &self.ulen(),
            self.username,
        ])
    }

    #[cfg(test)]
    pub fn rakp4_icv(&self, sik: &[u8]) -> Result<[u8; INTEGRITY_LEN], ControllerError> {
        let full = digest(sik, &[
            &self.console_random,
            &self.managed_session_id.to_le_bytes(),
            &self.bmc_guid,
        ])?;
        let mut out = [0u8; INTEGRITY_LEN];
        out.copy_from_slice(&full[..INTEGRITY_LEN]);
        Ok(out)
    }

    /// Integrity check value the BMC must present in RAKP message 4.
    pub fn verify_rakp4(&self, sik: &[u8], icv: &[u8]) -> Result<(), ControllerError> {
        mac_over(sik, &[
            &self.console_random,
            &self.managed_session_id.to_le_bytes(),
            &self.bmc_guid,
        ])?
        .verify_truncated_left(icv)
        .map_err(|_| ControllerError::Auth("RAKP message 4 integrity check mismatch"))
    }
}

/// Keys derived from the SIK once the handshake completes.
#[derive(Clone)]
pub struct SessionKeys {
    k1: [u8; KEY_LEN],
    aes_key: [u8; AES_BLOCK],
    pub integrity: bool,
    pub confidentiality: bool,
}

impl SessionKeys {
    pub fn derive(sik: &[u8], integrity: bool, confidentiality: bool) -> Result<Self, ControllerError> {
        let k1 = digest(sik, &[&[0x01; KEY_LEN]])?;
        let k2 = digest(sik, &[&[0x02; KEY_LEN]])?;
        let mut aes_key = [0u8; AES_BLOCK];
        aes_key.copy_from_slice(&k2[..AES_BLOCK]);
        Ok(Self { k1, aes_key, integrity, confidentiality })
    }

    /// HMAC-SHA1-96 over the session header through the next-header byte.
    pub fn integrity_code(&self, data: &[u8]) -> Result<[u8; INTEGRITY_LEN], ControllerError> {
        let full = digest(&self.k1, &[data])?;
        let mut out = [0u8; INTEGRITY_LEN];
        out.copy_from_slice(&full[..INTEGRITY_LEN]);
        Ok(out)
    }

    pub fn verify_integrity(&self, data: &[u8], code: &[u8]) -> Result<(), ControllerError> {
        mac_over(&self.k1, &[data])?
            .verify_truncated_left(code)
            .map_err(|_| ControllerError::Protocol("integrity check failed"))
    }

    /// Returns `IV || AES-CBC(payload || 1, 2, .. n || n)`.
    pub fn encrypt(&self, payload: &[u8]) -> Result<Vec<u8>, ControllerError> {
        let pad_len = (AES_BLOCK - (payload.len() + 1) % AES_BLOCK) % AES_BLOCK;
        let mut plain = Vec::with_capacity(payload.len() + pad_len + 1);
        plain.extend_from_slice(payload);
        plain.extend((1..=pad_len).map(|i| i as u8));
        plain.push(pad_len as u8);

        let mut iv = [0u8; AES_BLOCK];
        rand::rng().fill_bytes(&mut iv);

        let cipher = Aes128CbcEnc::new_from_slices(&self.aes_key, &iv)
            .map_err(|_| ControllerError::Crypto("bad AES key"))?;
        let mut out = iv.to_vec();
        out.extend(cipher.encrypt_padded_vec_mut::<NoPadding>(&plain));
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ControllerError> {
        if data.len() < 2 * AES_BLOCK || data.len() % AES_BLOCK != 0 {
            return Err(ControllerError::Protocol("encrypted payload has bad length"));
        }
        let (iv, body) = data.split_at(AES_BLOCK);
        let cipher = Aes128CbcDec::new_from_slices(&self.aes_key, iv)
            .map_err(|_| ControllerError::Crypto("bad AES key"))?;
        let mut plain = cipher
            .decrypt_padded_vec_mut::<NoPadding>(body)
            .map_err(|_| ControllerError::Crypto("AES decryption failed"))?;

        let pad_len = plain.last().copied().unwrap_or(0) as usize;
        if pad_len >= AES_BLOCK || pad_len + 1 > plain.len() {
            return Err(ControllerError::Protocol("bad confidentiality trailer"));
        }
        let payload_len = plain.len() - pad_len - 1;
        let pad_ok = plain[payload_len..plain.len() - 1]
            .iter()
            .enumerate()
            .all(|(i, b)| *b as usize == i + 1);
        if !pad_ok {
            return Err(ControllerError::Protocol("bad confidentiality trailer"));
        }
        plain.truncate(payload_len);
        Ok(plain)
    }
}
