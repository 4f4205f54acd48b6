use rand::{rngs::OsRng, RngCore};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest;
use thiserror::Error;

pub const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("ciphertext too short")]
    CiphertextTooShort,
    #[error("invalid hex string")]
    InvalidHex,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Generate cryptographically secure random bytes
pub fn secure_random(bytes: &mut [u8]) {
    OsRng.fill_bytes(bytes);
}

/// Generate a lowercase hex identifier of `len` characters.
pub fn generate_uid(len: usize) -> String {
    let mut bytes = vec![0u8; (len + 1) / 2];
    secure_random(&mut bytes);
    let mut out = String::with_capacity(len + 1);
    for b in &bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out.truncate(len);
    out
}

/// Derive a 32-byte symmetric key from arbitrary seed material.
pub fn derive_key(seed: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(digest::digest(&digest::SHA256, seed).as_ref());
    key
}

/// Encrypt with AES-256-GCM. Output layout: nonce[12] || ciphertext || tag.
pub fn encrypt_data(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength);
    }
    let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| CryptoError::InvalidKeyLength)?;
    let sealing = LessSafeKey::new(unbound);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    secure_random(&mut nonce_bytes);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Decrypt the nonce[12] || ciphertext || tag layout produced by `encrypt_data`.
pub fn decrypt_data(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength);
    }
    if data.len() < NONCE_LEN + AES_256_GCM.tag_len() {
        return Err(CryptoError::CiphertextTooShort);
    }
    let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| CryptoError::InvalidKeyLength)?;
    let opening = LessSafeKey::new(unbound);

    let nonce = Nonce::try_assume_unique_for_key(&data[..NONCE_LEN])
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let mut in_out = data[NONCE_LEN..].to_vec();
    let plaintext = opening
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(plaintext.to_vec())
}

/// Decode a lowercase/uppercase hex string into raw bytes.
pub fn decode_hex(input: &str) -> Result<Vec<u8>> {
    if input.len() % 2 != 0 {
        return Err(CryptoError::InvalidHex);
    }
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).map_err(|_| CryptoError::InvalidHex))
        .collect()
}
