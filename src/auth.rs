//! Challenge-response authentication material.
//!
//! The server hands the client a random challenge; the client proves key
//! possession by returning it encrypted with AES-CBC (PKCS#7 padding,
//! random IV prepended). Workspace secrets of arbitrary length are turned
//! into AES-256 keys by hashing, so both sides derive identical keys from
//! the same configured secret.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use anyhow::{bail, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const CHALLENGE_LEN: usize = 16;

/// Derive the AES-256 workspace key from the configured secret bytes.
pub fn derive_key(secret: &[u8]) -> [u8; KEY_LEN] {
    let digest = Sha256::digest(secret);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest);
    key
}

/// 128 bits of challenge material.
pub fn random_challenge() -> Vec<u8> {
    let mut challenge = vec![0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

pub fn random_nonce() -> u64 {
    rand::thread_rng().next_u64()
}

/// Encrypt `plain` under `key` with a fresh IV; output is `IV ‖ ciphertext`.
pub fn encrypt_challenge(key: &[u8; KEY_LEN], plain: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let ciphertext =
        Aes256CbcEnc::new(key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plain);
    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Inverse of [`encrypt_challenge`]; fails on short input or bad padding.
pub fn decrypt_challenge(key: &[u8; KEY_LEN], payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < IV_LEN + 16 {
        bail!("encrypted challenge too short ({} bytes)", payload.len());
    }
    let (iv, ciphertext) = payload.split_at(IV_LEN);
    let iv: [u8; IV_LEN] = iv.try_into().unwrap();
    Aes256CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| anyhow::anyhow!("challenge decryption failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = derive_key(b"hunter2");
        let challenge = random_challenge();
        let sealed = encrypt_challenge(&key, &challenge);
        assert_ne!(&sealed[IV_LEN..], challenge.as_slice());
        let opened = decrypt_challenge(&key, &sealed).unwrap();
        assert_eq!(opened, challenge);
    }

    #[test]
    fn wrong_key_does_not_verify() {
        let challenge = random_challenge();
        let sealed = encrypt_challenge(&derive_key(b"right"), &challenge);
        match decrypt_challenge(&derive_key(b"wrong"), &sealed) {
            Ok(opened) => assert_ne!(opened, challenge),
            Err(_) => {} // bad padding is the common outcome
        }
    }

    #[test]
    fn ivs_are_not_reused() {
        let key = derive_key(b"secret");
        let a = encrypt_challenge(&key, b"same input");
        let b = encrypt_challenge(&key, b"same input");
        assert_ne!(a, b);
    }

    #[test]
    fn short_payload_is_rejected() {
        let key = derive_key(b"k");
        assert!(decrypt_challenge(&key, &[0u8; 8]).is_err());
    }

    #[test]
    fn key_derivation_is_deterministic() {
        assert_eq!(derive_key(b"hunter2"), derive_key(b"hunter2"));
        assert_ne!(derive_key(b"hunter2"), derive_key(b"hunter3"));
    }
}
