//! Client-to-server payload masking (RFC 6455 section 5.3).

/// XOR `data` with the 4-byte masking key, byte by byte.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Word-at-a-time masking for large payloads.
///
/// Produces exactly the same bytes as [`apply_mask`]; a multi-megabyte
/// message spends most of its unmasking time here.
#[inline]
pub fn apply_mask_fast(data: &mut [u8], mask: [u8; 4]) {
    let wide = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        chunk.copy_from_slice(&(u64::from_ne_bytes(word) ^ wide).to_ne_bytes());
    }
    // Chunks are a multiple of 8 bytes, so the tail starts on key index 0.
    apply_mask(chunks.into_remainder(), mask);
}
