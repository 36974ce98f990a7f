//! XTEA block transform (64-bit block, 128-bit key, 32 cycles).

const DELTA: u32 = 0x9E37_79B9;
const ROUNDS: u32 = 32;

/// A 64-bit block as two little-endian words.
pub(crate) type Block = [u32; 2];

/// Encrypts `block ^ seed`.
pub(crate) fn encrypt_block(block: Block, seed: Block, key: &[u32; 4]) -> Block {
    let mut v0 = block[0] ^ seed[0];
    let mut v1 = block[1] ^ seed[1];
    let mut sum: u32 = 0;

    for _ in 0..ROUNDS {
        v0 = v0.wrapping_add(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                ^ (sum.wrapping_add(key[(sum & 3) as usize])),
        );
        sum = sum.wrapping_add(DELTA);
        v1 = v1.wrapping_add(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(key[((sum >> 11) & 3) as usize])),
        );
    }

    [v0, v1]
}

/// Decrypts `block` and removes `seed` from the result.
pub(crate) fn decrypt_block(block: Block, seed: Block, key: &[u32; 4]) -> Block {
    let mut v0 = block[0];
    let mut v1 = block[1];
    let mut sum: u32 = DELTA.wrapping_mul(ROUNDS);

    for _ in 0..ROUNDS {
        v1 = v1.wrapping_sub(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(key[((sum >> 11) & 3) as usize])),
        );
        sum = sum.wrapping_sub(DELTA);
        v0 = v0.wrapping_sub(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                ^ (sum.wrapping_add(key[(sum & 3) as usize])),
        );
    }

    [v0 ^ seed[0], v1 ^ seed[1]]
}
