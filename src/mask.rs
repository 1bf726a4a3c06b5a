//! WebSocket frame masking utilities
//!
//! Masking is the 4-byte rolling XOR from RFC 6455 section 5.3. The same
//! operation masks and unmasks.
//!
//! Randomness for mask keys and handshake nonces comes from one of two
//! backends selected via feature flags:
//! - `fastrand` (default): fast, non-cryptographic PRNG
//! - `getrandom`: OS entropy, with `fastrand` used if the OS source fails
//!
//! If both are enabled, `getrandom` wins.

/// Apply the WebSocket mask in place
///
/// Processes eight bytes at a time and finishes the tail byte by byte.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // Chunks are a multiple of 8 so the remainder starts at mask index 0
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Generate a random mask for client frames
#[inline]
pub fn generate_mask() -> [u8; 4] {
    let mut buf = [0u8; 4];
    fill_random(&mut buf);
    buf
}

/// Fill `buf` with random bytes from the selected backend
pub fn fill_random(buf: &mut [u8]) {
    fill_random_inner(buf)
}

#[cfg(feature = "getrandom")]
#[inline]
fn fill_random_inner(buf: &mut [u8]) {
    if let Err(e) = getrandom::getrandom(buf) {
        tracing::warn!("OS entropy unavailable ({e}), mask keys fall back to fastrand");
        fastrand::fill(buf);
    }
}

#[cfg(all(feature = "fastrand", not(feature = "getrandom")))]
#[inline]
fn fill_random_inner(buf: &mut [u8]) {
    fastrand::fill(buf);
}

#[cfg(not(any(feature = "fastrand", feature = "getrandom")))]
fn fill_random_inner(_buf: &mut [u8]) {
    compile_error!("At least one RNG feature must be enabled: fastrand or getrandom");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_mask_basic() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let original = b"Hello, WebSocket!".to_vec();
        let mut data = original.clone();

        apply_mask(&mut data, mask);
        assert_ne!(data, original);

        // XOR is self-inverse
        apply_mask(&mut data, mask);
        assert_eq!(data, original);
    }

    #[test]
    fn test_apply_mask_matches_bytewise() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        for len in 0..=40 {
            let original: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let mut fast = original.clone();
            apply_mask(&mut fast, mask);

            let slow: Vec<u8> = original
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ mask[i % 4])
                .collect();
            assert_eq!(fast, slow, "length {len}");
        }
    }

    #[test]
    fn test_fill_random() {
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        fill_random(&mut a);
        fill_random(&mut b);
        assert_ne!(a, b);
    }

    #[cfg(feature = "getrandom")]
    #[test]
    fn test_os_entropy_backend() {
        let mut nonce = [0u8; 32];
        fill_random_inner(&mut nonce);
        assert!(nonce.iter().any(|&b| b != 0));
        assert_ne!(generate_mask(), generate_mask());
    }
}
