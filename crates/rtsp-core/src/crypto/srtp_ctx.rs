use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use srtp::context::Context;
use srtp::protection_profile::ProtectionProfile;

use crate::error::{Error, Result};

/// SRTP authentication tag overhead per RTP packet
/// (AES_CM_128_HMAC_SHA1_80).
pub const SRTP_OVERHEAD: usize = 10;

/// SRTCP overhead per packet: authentication tag plus the 4-byte index.
pub const SRTCP_OVERHEAD: usize = 14;

/// Master key and salt transported inside a MIKEY message.
#[derive(Clone, PartialEq, Eq)]
pub struct SrtpKeyingMaterial {
    pub master_key: [u8; 16],
    pub master_salt: [u8; 14],
}

impl SrtpKeyingMaterial {
    /// Generates fresh random material.
    pub fn generate() -> Self {
        let mut master_key = [0u8; 16];
        let mut master_salt = [0u8; 14];
        rand::thread_rng().fill_bytes(&mut master_key);
        rand::thread_rng().fill_bytes(&mut master_salt);
        Self {
            master_key,
            master_salt,
        }
    }
}

impl std::fmt::Debug for SrtpKeyingMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material must never reach logs.
        f.write_str("SrtpKeyingMaterial(..)")
    }
}

/// One SRTP context per direction per media.
///
/// Wraps the external transform context and tracks the SSRCs known to use
/// it, which the MIKEY answer advertises back to the peer.
pub struct SrtpContext {
    inner: Mutex<Context>,
    keying: SrtpKeyingMaterial,
    ssrcs: Mutex<Vec<u32>>,
}

impl SrtpContext {
    pub fn new(keying: SrtpKeyingMaterial) -> Result<Self> {
        let ctx = Context::new(
            &keying.master_key,
            &keying.master_salt,
            ProtectionProfile::Aes128CmHmacSha1_80,
            None,
            None,
        )
        .map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(Self {
            inner: Mutex::new(ctx),
            keying,
            ssrcs: Mutex::new(Vec::new()),
        })
    }

    /// Keying material this context was derived from.
    pub fn keying_material(&self) -> &SrtpKeyingMaterial {
        &self.keying
    }

    /// Records an SSRC protected by this context.
    pub fn add_ssrc(&self, ssrc: u32) {
        let mut ssrcs = self.ssrcs.lock();
        if !ssrcs.contains(&ssrc) {
            ssrcs.push(ssrc);
        }
    }

    /// SSRCs known to use this context.
    pub fn ssrcs(&self) -> Vec<u32> {
        self.ssrcs.lock().clone()
    }

    pub fn encrypt_rtp(&self, plaintext: &[u8]) -> Result<Bytes> {
        self.inner
            .lock()
            .encrypt_rtp(plaintext)
            .map_err(|e| Error::Crypto(e.to_string()))
    }

    pub fn decrypt_rtp(&self, encrypted: &[u8]) -> Result<Bytes> {
        self.inner
            .lock()
            .decrypt_rtp(encrypted)
            .map_err(|e| Error::Crypto(e.to_string()))
    }

    pub fn encrypt_rtcp(&self, plaintext: &[u8]) -> Result<Bytes> {
        self.inner
            .lock()
            .encrypt_rtcp(plaintext)
            .map_err(|e| Error::Crypto(e.to_string()))
    }

    pub fn decrypt_rtcp(&self, encrypted: &[u8]) -> Result<Bytes> {
        self.inner
            .lock()
            .decrypt_rtcp(encrypted)
            .map_err(|e| Error::Crypto(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp::packet::Packet;
    use util::marshal::Marshal;

    fn sample_rtp() -> Bytes {
        let mut p = Packet::default();
        p.header.version = 2;
        p.header.payload_type = 96;
        p.header.sequence_number = 100;
        p.header.timestamp = 90000;
        p.header.ssrc = 0x1234_5678;
        p.payload = Bytes::from_static(&[1, 2, 3, 4]);
        p.marshal().unwrap()
    }

    #[test]
    fn encrypt_decrypt_rtp() {
        let keying = SrtpKeyingMaterial::generate();
        let sender = SrtpContext::new(keying.clone()).unwrap();
        let receiver = SrtpContext::new(keying).unwrap();

        let plain = sample_rtp();
        let encrypted = sender.encrypt_rtp(&plain).unwrap();
        assert_eq!(encrypted.len(), plain.len() + SRTP_OVERHEAD);
        assert_ne!(&encrypted[12..plain.len()], &plain[12..]);

        let decrypted = receiver.decrypt_rtp(&encrypted).unwrap();
        assert_eq!(&decrypted[..], &plain[..]);
    }

    #[test]
    fn tampered_packet_rejected() {
        let keying = SrtpKeyingMaterial::generate();
        let sender = SrtpContext::new(keying.clone()).unwrap();
        let receiver = SrtpContext::new(keying).unwrap();

        let mut encrypted = sender.encrypt_rtp(&sample_rtp()).unwrap().to_vec();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xFF;
        assert!(receiver.decrypt_rtp(&encrypted).is_err());
    }

    #[test]
    fn ssrc_set_is_deduplicated() {
        let ctx = SrtpContext::new(SrtpKeyingMaterial::generate()).unwrap();
        ctx.add_ssrc(1);
        ctx.add_ssrc(2);
        ctx.add_ssrc(1);
        assert_eq!(ctx.ssrcs(), vec![1, 2]);
    }

    #[test]
    fn debug_does_not_leak_keys() {
        let keying = SrtpKeyingMaterial::generate();
        assert_eq!(format!("{keying:?}"), "SrtpKeyingMaterial(..)");
    }
}
