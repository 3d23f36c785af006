//! Opaque pagination markers.
//!
//! A marker is the AES-256-GCM encryption of the last-returned primary key,
//! base64-encoded. The key is generated per process, so markers stop
//! validating across restarts; clients simply restart their listing.

use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD, Engine};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

fn marker_key() -> &'static [u8; 32] {
    static KEY: OnceLock<[u8; 32]> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut key = [0u8; 32];
        SystemRandom::new()
            .fill(&mut key)
            .expect("system rng unavailable");
        key
    })
}

/// Encrypt a primary key into an opaque marker.
pub fn encrypt_pk(pk: i64) -> Result<String> {
    let unbound = UnboundKey::new(&AES_256_GCM, marker_key())
        .map_err(|_| Error::Internal("failed to build marker key".to_string()))?;
    let key = LessSafeKey::new(unbound);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| Error::Internal("failed to generate marker nonce".to_string()))?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut data = pk.to_be_bytes().to_vec();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut data)
        .map_err(|_| Error::Internal("failed to seal marker".to_string()))?;

    let mut out = nonce_bytes.to_vec();
    out.extend(data);
    Ok(STANDARD.encode(out))
}

/// Decrypt a marker back to the primary key it carries.
pub fn decrypt_pk(marker: &str) -> Result<i64> {
    let invalid = || Error::Validation(format!("invalid marker[{}]", marker));
    let raw = STANDARD.decode(marker).map_err(|_| invalid())?;
    if raw.len() < NONCE_LEN {
        return Err(invalid());
    }
    let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
    let nonce_array: [u8; NONCE_LEN] = nonce_bytes.try_into().map_err(|_| invalid())?;
    let nonce = Nonce::assume_unique_for_key(nonce_array);

    let unbound = UnboundKey::new(&AES_256_GCM, marker_key())
        .map_err(|_| Error::Internal("failed to build marker key".to_string()))?;
    let key = LessSafeKey::new(unbound);

    let mut data = sealed.to_vec();
    let plain = key
        .open_in_place(nonce, Aad::empty(), &mut data)
        .map_err(|_| invalid())?;
    let bytes: [u8; 8] = plain.try_into().map_err(|_| invalid())?;
    Ok(i64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_roundtrip() {
        let marker = encrypt_pk(42).unwrap();
        assert_eq!(decrypt_pk(&marker).unwrap(), 42);
    }

    #[test]
    fn test_markers_are_opaque_and_unique() {
        let a = encrypt_pk(7).unwrap();
        let b = encrypt_pk(7).unwrap();
        // Random nonces make equal pks encode differently.
        assert_ne!(a, b);
        assert_eq!(decrypt_pk(&a).unwrap(), decrypt_pk(&b).unwrap());
    }

    #[test]
    fn test_tampered_marker_rejected() {
        let marker = encrypt_pk(99).unwrap();
        let mut raw = STANDARD.decode(&marker).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = STANDARD.encode(raw);
        assert!(decrypt_pk(&tampered).is_err());
    }

    #[test]
    fn test_garbage_marker_rejected() {
        assert!(decrypt_pk("not-a-marker").is_err());
        assert!(decrypt_pk("").is_err());
    }
}
