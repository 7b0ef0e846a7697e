//! Pure functions mapping plaintext ranges to ciphertext ranges, and
//! decrypting an aligned ciphertext slice back to plaintext.
//!
//! Nothing here touches the network or a file; everything is a function of
//! bytes already in memory, which is what makes it directly unit-testable.

use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};

use crate::error::{DownloadError, Result};
use crate::types::{EncryptionMode, PlanMeta, RangeMapping, KEY_LEN, NONCE_LEN, TAG_LEN};

/// Bytes on the wire for one AEAD block: `block_header_size + block_data_size`.
fn block_stride(meta: &PlanMeta) -> u64 {
    meta.block_header_size as u64 + meta.block_data_size as u64
}

/// Maps a plaintext `(offset, length)` range to its underlying ciphertext
/// range.
pub fn map_range(meta: &PlanMeta, offset: u64, length: u64) -> RangeMapping {
    if meta.encryption_mode == EncryptionMode::Plain
        || meta.block_data_size == 0
        || meta.block_header_size == 0
    {
        return RangeMapping {
            underlying_offset: offset,
            underlying_limit: length,
            discard: 0,
            starting_block_index: 0,
        };
    }

    let b = meta.block_data_size as u64;
    let h = meta.block_header_size as u64;
    let f = meta.file_header_size as u64;

    let blocks = offset / b;
    let discard = offset % b;
    let underlying_offset = f + blocks * (h + b);

    let first_block_capacity = b - discard;
    let blocks_to_read: u64 = if length <= first_block_capacity {
        1
    } else {
        let bytes_to_read = length - first_block_capacity;
        1 + bytes_to_read / b + if bytes_to_read % b != 0 { 1 } else { 0 }
    };
    let underlying_limit = blocks_to_read * (h + b);

    RangeMapping {
        underlying_offset,
        underlying_limit,
        discard,
        starting_block_index: blocks,
    }
}

/// Adds `block_index` to `base_nonce`, treated as a little-endian unsigned
/// integer, with carry propagation. `block_index` may itself require the
/// full 64 bits, so the add is done byte-by-byte rather than via a native
/// integer type.
pub fn nonce_for_block(base_nonce: &[u8; NONCE_LEN], block_index: u64) -> [u8; NONCE_LEN] {
    let mut nonce = *base_nonce;
    let mut carry: u64 = block_index;
    for byte in nonce.iter_mut() {
        if carry == 0 {
            break;
        }
        let sum = *byte as u64 + (carry & 0xff);
        *byte = (sum & 0xff) as u8;
        carry = (carry >> 8) + (sum >> 8);
    }
    nonce
}

/// Decrypts a contiguous ciphertext slice already aligned to the block grid
/// (i.e. `ciphertext` is exactly the bytes described by a segment's
/// `RangeMapping`), starting at `starting_block_index`. Returns exactly
/// `length` plaintext bytes after discarding `discard` leading bytes and
/// truncating the tail.
pub fn decrypt_segment(
    meta: &PlanMeta,
    data_key: &[u8; KEY_LEN],
    base_nonce: &[u8; NONCE_LEN],
    mapping: &RangeMapping,
    length: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if meta.encryption_mode == EncryptionMode::Plain {
        let len = length as usize;
        if ciphertext.len() < len {
            return Err(DownloadError::Crypto("length mismatch".into()));
        }
        return Ok(ciphertext[..len].to_vec());
    }

    let stride = block_stride(meta);
    let h = meta.block_header_size as usize;
    let cipher = XSalsa20Poly1305::new(Key::from_slice(data_key));

    let mut plaintext = Vec::with_capacity(ciphertext.len());
    let mut pos: usize = 0;
    let mut block_index = mapping.starting_block_index;

    while pos < ciphertext.len() {
        let remaining = ciphertext.len() - pos;
        let this_block_len = (stride as usize).min(remaining);
        if this_block_len <= h || h < TAG_LEN {
            return Err(DownloadError::Crypto(
                "truncated block: shorter than block_header_size".into(),
            ));
        }
        let block = &ciphertext[pos..pos + this_block_len];
        // Block layout is `header || data`, where the header's leading
        // TAG_LEN bytes carry the Poly1305 tag (the NaCl/secretbox
        // convention: tag precedes ciphertext on the wire). `aead::Aead`
        // expects `ciphertext || tag`, so the two are recombined here.
        let (block_header, block_data) = block.split_at(h);
        let tag = &block_header[..TAG_LEN];
        let mut combined = Vec::with_capacity(block_data.len() + TAG_LEN);
        combined.extend_from_slice(block_data);
        combined.extend_from_slice(tag);

        let nonce_bytes = nonce_for_block(base_nonce, block_index);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let block_plain = cipher
            .decrypt(nonce, combined.as_slice())
            .map_err(|_| DownloadError::Crypto(format!("AEAD open failed at block {block_index}")))?;

        plaintext.extend_from_slice(&block_plain);

        pos += this_block_len;
        block_index += 1;
    }

    let discard = mapping.discard as usize;
    if discard > plaintext.len() {
        return Err(DownloadError::Crypto(
            "discard exceeds decrypted length".into(),
        ));
    }
    plaintext.drain(..discard);

    let want = length as usize;
    if plaintext.len() < want {
        return Err(DownloadError::Crypto(format!(
            "length mismatch: produced {} want {}",
            plaintext.len(),
            want
        )));
    }
    plaintext.truncate(want);

    Ok(plaintext)
}
