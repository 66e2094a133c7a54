//! Key transcoding between 8-bit bytes and the trie's 6-bit nibbles.
//!
//! Every group of three key bytes becomes four nibbles; a partial group
//! pads the final nibble with zero bits. Padding carries no information
//! and the round trip is exact, so nibble-wise lexicographic order matches
//! byte-wise order.

/// Re-encode a byte key as 6-bit nibbles, one per output byte.
pub fn to_key6(key: &[u8]) -> Vec<u8> {
    let bits = key.len() * 8;
    let mut out = vec![0u8; (bits + 5) / 6];

    let mut chunks = key.chunks_exact(3);
    let mut pos = 0;
    for c in &mut chunks {
        out[pos] = c[0] >> 2;
        out[pos + 1] = (c[0] & 0x3) << 4 | c[1] >> 4;
        out[pos + 2] = (c[1] & 0xf) << 2 | c[2] >> 6;
        out[pos + 3] = c[2] & 0x3f;
        pos += 4;
    }
    match chunks.remainder() {
        [a] => {
            out[pos] = a >> 2;
            out[pos + 1] = (a & 0x3) << 4;
        }
        [a, b] => {
            out[pos] = a >> 2;
            out[pos + 1] = (a & 0x3) << 4 | b >> 4;
            out[pos + 2] = (b & 0xf) << 2;
        }
        _ => {}
    }
    out
}

/// Inverse of [`to_key6`]; padding bits are discarded.
pub fn from_key6(k6: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; k6.len() * 6 / 8];

    let mut chunks = k6.chunks_exact(4);
    let mut pos = 0;
    for c in &mut chunks {
        out[pos] = c[0] << 2 | c[1] >> 4;
        out[pos + 1] = c[1] << 4 | c[2] >> 2;
        out[pos + 2] = c[2] << 6 | c[3];
        pos += 3;
    }
    match chunks.remainder() {
        [a, b, c] => {
            out[pos] = a << 2 | b >> 4;
            out[pos + 1] = b << 4 | c >> 2;
        }
        [a, b] => {
            out[pos] = a << 2 | b >> 4;
        }
        _ => {}
    }
    out
}

/// Length of the shared prefix of two nibble strings.
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn round_trip_small() {
        for key in [
            &b""[..],
            b"a",
            b"ab",
            b"abc",
            b"abcd",
            b"apple",
            b"\x00",
            b"\x00\x00\x00",
            b"\xff\xff",
            b"\xff\xff\xff\xff\xff",
        ] {
            let k6 = to_key6(key);
            assert!(k6.iter().all(|n| *n < 64), "nibble out of range");
            assert_eq!(from_key6(&k6), key, "round trip of {:?}", key);
        }
    }

    #[test]
    fn round_trip_fuzz() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..2000 {
            let len = rng.gen_range(0..64);
            let key: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            assert_eq!(from_key6(&to_key6(&key)), key);
        }
    }

    #[test]
    fn nibble_order_matches_byte_order() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..2000 {
            let len_a = rng.gen_range(0..12);
            let len_b = rng.gen_range(0..12);
            let a: Vec<u8> = (0..len_a).map(|_| rng.gen()).collect();
            let b: Vec<u8> = (0..len_b).map(|_| rng.gen()).collect();
            assert_eq!(
                to_key6(&a).cmp(&to_key6(&b)),
                a.cmp(&b),
                "{:02x?} vs {:02x?}",
                a,
                b
            );
        }
    }

    #[test]
    fn expected_lengths() {
        assert_eq!(to_key6(b"").len(), 0);
        assert_eq!(to_key6(b"x").len(), 2);
        assert_eq!(to_key6(b"xy").len(), 3);
        assert_eq!(to_key6(b"xyz").len(), 4);
        assert_eq!(to_key6(b"xyzw").len(), 6);
    }

    #[test]
    fn common_prefix() {
        assert_eq!(common_prefix_len(b"abc", b"abd"), 2);
        assert_eq!(common_prefix_len(b"abc", b"abc"), 3);
        assert_eq!(common_prefix_len(b"abc", b"abcd"), 3);
        assert_eq!(common_prefix_len(b"", b"abc"), 0);
        assert_eq!(common_prefix_len(b"xyz", b"abc"), 0);
    }
}
