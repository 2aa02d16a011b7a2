//! Secure channel session state and crypto.
//!
//! All primitives are AES-128: ECB one block at a time for key derivation
//! and cryptograms, CBC for the rolling frame MAC and payload encryption.
//! Every input is block-aligned by construction (0x80 + zero padding), so
//! the CBC modes run without padding.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::Array as GenericArray;
use aes::cipher::{BlockCipherEncrypt, BlockModeDecrypt, BlockModeEncrypt, KeyInit, KeyIvInit};
use aes::Aes128;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::OsdpError;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Default secure channel base key, used while a PD is in install mode.
pub(crate) const SCBK_DEFAULT: [u8; 16] = [
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E,
    0x3F,
];

pub(crate) fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

fn ecb_encrypt(key: &[u8; 16], block: &mut [u8; 16]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<(), OsdpError> {
    let len = data.len();
    Aes128CbcEnc::new(key.into(), iv.into())
        .encrypt_padded::<NoPadding>(data, len)
        .map_err(|_| OsdpError::SecureChannel("unaligned CBC input"))?;
    Ok(())
}

fn cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<(), OsdpError> {
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded::<NoPadding>(data)
        .map_err(|_| OsdpError::SecureChannel("unaligned CBC input"))?;
    Ok(())
}

/// Per-PD secure channel block. Both sides of the link hold one; the CP's
/// copy mirrors the PD's once the CHLNG/SCRYPT handshake completes.
pub(crate) struct SecureChannel {
    pub(crate) active: bool,
    /// Session keys derive from SCBK-D instead of the provisioned SCBK.
    pub(crate) use_scbk_d: bool,
    pub(crate) scbk: Option<[u8; 16]>,
    pub(crate) cp_random: [u8; 8],
    pub(crate) pd_random: [u8; 8],
    pub(crate) cp_cryptogram: [u8; 16],
    pub(crate) pd_cryptogram: [u8; 16],
    pub(crate) client_uid: [u8; 8],
    s_enc: [u8; 16],
    s_mac1: [u8; 16],
    s_mac2: [u8; 16],
    /// Rolling MAC of the last reply (IV source for command MACs).
    pub(crate) r_mac: [u8; 16],
    /// Rolling MAC of the last command (IV source for reply MACs).
    pub(crate) c_mac: [u8; 16],
}

impl SecureChannel {
    pub(crate) fn new(scbk: Option<[u8; 16]>) -> Self {
        Self {
            active: false,
            use_scbk_d: false,
            scbk,
            cp_random: [0; 8],
            pd_random: [0; 8],
            cp_cryptogram: [0; 16],
            pd_cryptogram: [0; 16],
            client_uid: [0; 8],
            s_enc: [0; 16],
            s_mac1: [0; 16],
            s_mac2: [0; 16],
            r_mac: [0; 16],
            c_mac: [0; 16],
        }
    }

    /// Reset all volatile session state ahead of a CHLNG exchange. The base
    /// key survives.
    pub(crate) fn init_session(&mut self, client_uid: [u8; 8]) {
        self.active = false;
        self.cp_random = [0; 8];
        self.pd_random = [0; 8];
        self.cp_cryptogram = [0; 16];
        self.pd_cryptogram = [0; 16];
        self.s_enc = [0; 16];
        self.s_mac1 = [0; 16];
        self.s_mac2 = [0; 16];
        self.r_mac = [0; 16];
        self.c_mac = [0; 16];
        self.client_uid = client_uid;
    }

    pub(crate) fn deactivate(&mut self) {
        self.active = false;
    }

    fn base_key(&self) -> Result<[u8; 16], OsdpError> {
        if self.use_scbk_d {
            return Ok(SCBK_DEFAULT);
        }
        self.scbk
            .ok_or(OsdpError::SecureChannel("no SCBK provisioned"))
    }

    /// Derive S-ENC, S-MAC1 and S-MAC2 from the base key and the CP nonce.
    pub(crate) fn compute_session_keys(&mut self) -> Result<(), OsdpError> {
        let scbk = self.base_key()?;
        self.s_enc = derive_session_key(&scbk, 0x82, &self.cp_random);
        self.s_mac1 = derive_session_key(&scbk, 0x01, &self.cp_random);
        self.s_mac2 = derive_session_key(&scbk, 0x02, &self.cp_random);
        Ok(())
    }

    pub(crate) fn compute_pd_cryptogram(&self) -> [u8; 16] {
        let mut block = [0u8; 16];
        block[..8].copy_from_slice(&self.cp_random);
        block[8..].copy_from_slice(&self.pd_random);
        ecb_encrypt(&self.s_enc, &mut block);
        block
    }

    pub(crate) fn compute_cp_cryptogram(&self) -> [u8; 16] {
        let mut block = [0u8; 16];
        block[..8].copy_from_slice(&self.pd_random);
        block[8..].copy_from_slice(&self.cp_random);
        ecb_encrypt(&self.s_enc, &mut block);
        block
    }

    /// Initial reply MAC, seeded from the CP cryptogram after SCRYPT.
    pub(crate) fn compute_rmac_i(&self) -> [u8; 16] {
        let mut block = self.cp_cryptogram;
        ecb_encrypt(&self.s_mac1, &mut block);
        ecb_encrypt(&self.s_mac2, &mut block);
        block
    }

    /// Compute the 16-byte rolling MAC over one frame and advance the chain.
    ///
    /// Commands chain off the previous reply MAC and update the command MAC;
    /// replies do the opposite. The first 4 bytes go on the wire.
    pub(crate) fn compute_mac(&mut self, is_cmd: bool, data: &[u8]) -> Result<[u8; 16], OsdpError> {
        let mut buf = data.to_vec();
        if buf.len() % 16 != 0 {
            buf.push(0x80);
            while buf.len() % 16 != 0 {
                buf.push(0);
            }
        }
        let n = buf.len();
        let mut iv = if is_cmd { self.r_mac } else { self.c_mac };
        if n > 16 {
            cbc_encrypt(&self.s_mac1, &iv, &mut buf[..n - 16])?;
            iv.copy_from_slice(&buf[n - 32..n - 16]);
        }
        cbc_encrypt(&self.s_mac2, &iv, &mut buf[n - 16..])?;
        let mut mac = [0u8; 16];
        mac.copy_from_slice(&buf[n - 16..]);
        if is_cmd {
            self.c_mac = mac;
        } else {
            self.r_mac = mac;
        }
        Ok(mac)
    }

    fn payload_iv(&self, is_cmd: bool) -> [u8; 16] {
        let mut iv = if is_cmd { self.r_mac } else { self.c_mac };
        for b in iv.iter_mut() {
            *b = !*b;
        }
        iv
    }

    /// Pad and encrypt a data payload for an SCS_17/18 frame.
    pub(crate) fn encrypt_payload(&self, is_cmd: bool, data: &[u8]) -> Result<Vec<u8>, OsdpError> {
        let mut buf = data.to_vec();
        buf.push(0x80);
        while buf.len() % 16 != 0 {
            buf.push(0);
        }
        let iv = self.payload_iv(is_cmd);
        cbc_encrypt(&self.s_enc, &iv, &mut buf)?;
        Ok(buf)
    }

    /// Decrypt an SCS_17/18 payload in place; returns the plaintext length
    /// after stripping the 0x80 padding.
    pub(crate) fn decrypt_payload(&self, is_cmd: bool, data: &mut [u8]) -> Result<usize, OsdpError> {
        if data.is_empty() || data.len() % 16 != 0 {
            return Err(OsdpError::SecureChannel("bad ciphertext length"));
        }
        let iv = self.payload_iv(is_cmd);
        cbc_decrypt(&self.s_enc, &iv, data)?;
        let mut len = data.len();
        while len > 0 && data[len - 1] == 0 {
            len -= 1;
        }
        if len == 0 || data[len - 1] != 0x80 {
            return Err(OsdpError::SecureChannel("bad payload padding"));
        }
        Ok(len - 1)
    }
}

fn derive_session_key(scbk: &[u8; 16], tag: u8, cp_random: &[u8; 8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0] = 0x01;
    block[1] = tag;
    block[2..8].copy_from_slice(&cp_random[..6]);
    ecb_encrypt(scbk, &mut block);
    block
}

/// Per-PD base key from the CP master key: AES-ECB over the PD's client UID
/// concatenated with its bitwise complement.
pub(crate) fn derive_scbk(master_key: &[u8; 16], client_uid: &[u8; 8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[..8].copy_from_slice(client_uid);
    for i in 0..8 {
        block[8 + i] = !client_uid[i];
    }
    ecb_encrypt(master_key, &mut block);
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (SecureChannel, SecureChannel) {
        let scbk = [0x11u8; 16];
        let mut cp = SecureChannel::new(Some(scbk));
        let mut pd = SecureChannel::new(Some(scbk));
        let uid = [1, 2, 3, 4, 5, 6, 7, 8];
        cp.init_session(uid);
        pd.init_session(uid);
        cp.cp_random = [0xA0; 8];
        pd.cp_random = [0xA0; 8];
        cp.pd_random = [0xB5; 8];
        pd.pd_random = [0xB5; 8];
        cp.compute_session_keys().unwrap();
        pd.compute_session_keys().unwrap();
        (cp, pd)
    }

    #[test]
    fn cryptograms_agree_across_sides() {
        let (cp, pd) = session_pair();
        assert_eq!(cp.compute_pd_cryptogram(), pd.compute_pd_cryptogram());
        assert_eq!(cp.compute_cp_cryptogram(), pd.compute_cp_cryptogram());
        // The two cryptograms differ from each other (different block order).
        assert_ne!(cp.compute_pd_cryptogram(), cp.compute_cp_cryptogram());
    }

    #[test]
    fn mac_chain_stays_in_sync() {
        let (mut cp, mut pd) = session_pair();
        let seed = cp.compute_rmac_i();
        cp.r_mac = seed;
        pd.r_mac = seed;

        for round in 0u8..4 {
            let cmd = [0x53, 0x65, round, 0x60];
            let tx = cp.compute_mac(true, &cmd).unwrap();
            let rx = pd.compute_mac(true, &cmd).unwrap();
            assert_eq!(tx, rx);

            let reply = [0x53, 0xE5, round, 0x40, 0x00, 0x01];
            let tx = pd.compute_mac(false, &reply).unwrap();
            let rx = cp.compute_mac(false, &reply).unwrap();
            assert_eq!(tx, rx);
        }
    }

    #[test]
    fn mac_covers_multi_block_frames() {
        let (mut cp, mut pd) = session_pair();
        let frame = [0x42u8; 45]; // three blocks once padded
        assert_eq!(
            cp.compute_mac(true, &frame).unwrap(),
            pd.compute_mac(true, &frame).unwrap()
        );
        // Aligned input takes the no-padding path.
        let frame = [0x42u8; 32];
        assert_eq!(
            cp.compute_mac(false, &frame).unwrap(),
            pd.compute_mac(false, &frame).unwrap()
        );
    }

    #[test]
    fn payload_round_trip() {
        let (cp, pd) = session_pair();
        let plain = b"\x68\x02\x01\x00\x00";
        let mut wire = cp.encrypt_payload(true, plain).unwrap();
        assert_eq!(wire.len() % 16, 0);
        let n = pd.decrypt_payload(true, &mut wire).unwrap();
        assert_eq!(&wire[..n], plain);
    }

    #[test]
    fn decrypt_rejects_mangled_padding() {
        let (cp, pd) = session_pair();
        let mut wire = cp.encrypt_payload(true, b"\x60").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(pd.decrypt_payload(true, &mut wire).is_err());
    }

    #[test]
    fn scbk_derivation_is_stable() {
        let master = [0x5Au8; 16];
        let uid = [9, 8, 7, 6, 5, 4, 3, 2];
        let a = derive_scbk(&master, &uid);
        let b = derive_scbk(&master, &uid);
        assert_eq!(a, b);
        assert_ne!(a, derive_scbk(&master, &[0u8; 8]));
    }
}
