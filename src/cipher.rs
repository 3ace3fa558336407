//! AES-128-CBC block decrypt with optional trailing-block padding strip
//! (spec §4.1). Fail-open: invalid key/iv sizes return the ciphertext
//! unchanged rather than erroring, to tolerate malformed real-world feeds —
//! this mirrors the source's historical behavior (see SPEC_FULL.md / Open
//! Questions) and is preserved deliberately, not an oversight.

use aes::Aes128;
use block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};

pub const KEY_LEN: usize = 16;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Derive the default per-segment IV when the playlist supplies none:
/// big-endian of the segment's media sequence index, padded to 16 bytes
/// (spec §3 EncryptionSpec invariant).
pub fn derive_iv(sequence_index: u64) -> [u8; KEY_LEN] {
    let mut iv = [0u8; KEY_LEN];
    iv[8..].copy_from_slice(&sequence_index.to_be_bytes());
    iv
}

/// Decrypt `ciphertext` under AES-128-CBC. `key` and `iv` must be exactly
/// [`KEY_LEN`] bytes; on any other length the ciphertext is returned
/// unchanged and a warning is logged (fail-open, per spec).
///
/// Ciphertext is zero-padded up to a 16-byte multiple to tolerate truncated
/// final segments. When `is_last_block` the return value is truncated back
/// to the original ciphertext length (stripping the zero padding);
/// otherwise the full decrypted, block-aligned buffer is returned so the
/// caller can reassemble streamed chunks.
pub fn decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8], is_last_block: bool) -> Vec<u8> {
    if key.len() != KEY_LEN || iv.len() != KEY_LEN {
        tracing::warn!(
            key_len = key.len(),
            iv_len = iv.len(),
            "cipher: invalid key/iv length, returning ciphertext unchanged"
        );
        return ciphertext.to_vec();
    }

    let original_len = ciphertext.len();
    let padded_len = original_len.div_ceil(KEY_LEN) * KEY_LEN;
    let mut buf = vec![0u8; padded_len];
    buf[..original_len].copy_from_slice(ciphertext);

    let key_arr: [u8; KEY_LEN] = key.try_into().expect("checked above");
    let iv_arr: [u8; KEY_LEN] = iv.try_into().expect("checked above");
    let decryptor = Aes128CbcDec::new(&key_arr.into(), &iv_arr.into());

    match decryptor.decrypt_padded_mut::<NoPadding>(&mut buf) {
        Ok(plaintext) => {
            if is_last_block {
                plaintext[..original_len.min(plaintext.len())].to_vec()
            } else {
                plaintext.to_vec()
            }
        }
        Err(e) => {
            tracing::warn!(error = ?e, "cipher: block decrypt failed, returning ciphertext unchanged");
            ciphertext.to_vec()
        }
    }
}
