//! Pure wire codec: hex framing, AES-128-CBC encryption and the SHA-256
//! digest that authenticates each frame. No I/O, no mutable state beyond
//! the fixed protocol constants.
//!
//! The protocol derives both the AES key and the IV from the same 16-byte
//! material (`SECRET_KEY ‖ counter_ascii`), so key == IV. That is preserved
//! here for wire compatibility even though it is not something to imitate
//! in a new design. The digest is computed over the *hex-encoded* counter
//! and ciphertext strings, not their underlying bytes — also preserved.

use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

/// Fixed pre-shared secret for every device and client in this ecosystem.
pub const SECRET_KEY: &[u8; 8] = b"JiangPan";

const DIGEST_HEX_LEN: usize = 64;
const COUNTER_HEX_LEN: usize = 8;
const AES_BLOCK_SIZE: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Derives the 16-byte key/IV material shared by encryption and decryption.
fn key_iv_material(counter_hex: &str) -> [u8; 16] {
    let mut material = [0u8; 16];
    material[..8].copy_from_slice(SECRET_KEY);
    material[8..].copy_from_slice(counter_hex.as_bytes());
    material
}

/// Encrypts `plaintext` under the key/IV derived from `counter_hex`,
/// returning uppercase hex ciphertext.
pub fn encrypt(counter_hex: &str, plaintext: &str) -> String {
    let material = key_iv_material(counter_hex);
    let cipher = Aes128CbcEnc::new(&material.into(), &material.into());
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    hex::encode_upper(ciphertext)
}

/// Inverse of [`encrypt`]. Fails with [`Error::MalformedFrame`] if the hex
/// is invalid, the length is not a block multiple, the padding is invalid,
/// or the decrypted bytes are not valid UTF-8.
pub fn decrypt(counter_hex: &str, ciphertext_hex: &str) -> Result<String> {
    let ciphertext = hex::decode(ciphertext_hex)
        .map_err(|e| Error::MalformedFrame(format!("ciphertext is not valid hex: {e}")))?;
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(Error::MalformedFrame(format!(
            "ciphertext length {} is not a positive multiple of the AES block size",
            ciphertext.len()
        )));
    }

    let material = key_iv_material(counter_hex);
    let cipher = Aes128CbcDec::new(&material.into(), &material.into());
    let mut buf = ciphertext;
    let plaintext = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| Error::MalformedFrame("invalid PKCS#7 padding".to_string()))?;

    String::from_utf8(plaintext.to_vec())
        .map_err(|e| Error::MalformedFrame(format!("decrypted payload is not UTF-8: {e}")))
}

/// `SHA256(counter_hex ‖ ciphertext_hex)` rendered as 64 uppercase hex chars.
///
/// Computed over the hex-encoded strings rather than the underlying bytes —
/// a protocol quirk, not a design choice, preserved for wire compatibility.
pub fn digest(counter_hex: &str, ciphertext_hex: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(counter_hex.as_bytes());
    hasher.update(ciphertext_hex.as_bytes());
    hex::encode_upper(hasher.finalize())
}

/// Splits and authenticates a wire frame, returning `(counter_hex, ciphertext_hex)`.
///
/// The counter embedded in the frame is informational only — the client
/// never re-keys its own session counter from it.
pub fn verify(frame: &str) -> Result<(String, String)> {
    if frame.len() < COUNTER_HEX_LEN + DIGEST_HEX_LEN || !frame.is_ascii() {
        return Err(Error::MalformedFrame(format!(
            "frame length {} is shorter than the minimum {}",
            frame.len(),
            COUNTER_HEX_LEN + DIGEST_HEX_LEN
        )));
    }

    let (head, digest_hex) = frame.split_at(frame.len() - DIGEST_HEX_LEN);
    let (counter_hex, ciphertext_hex) = head.split_at(COUNTER_HEX_LEN);

    if (ciphertext_hex.len()) % 2 != 0 || ciphertext_hex.is_empty() {
        return Err(Error::MalformedFrame(
            "ciphertext section has odd or zero length".to_string(),
        ));
    }
    if hex::decode(counter_hex).is_err() || hex::decode(ciphertext_hex).is_err() {
        return Err(Error::MalformedFrame(
            "frame contains non-hex characters".to_string(),
        ));
    }

    let expected = digest(counter_hex, ciphertext_hex);
    let matches: bool = expected
        .as_bytes()
        .ct_eq(digest_hex.as_bytes())
        .unwrap_u8()
        == 1;
    if !matches {
        return Err(Error::DigestMismatch);
    }

    Ok((counter_hex.to_string(), ciphertext_hex.to_string()))
}
