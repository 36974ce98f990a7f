//! Chained-seed XTEA transform used to obscure payload images.
//!
//! The plaintext is zero padded to a multiple of eight bytes and processed
//! block by block. Every block is XORed with a running two-word seed before
//! encryption; the seed of the next block is the ciphertext of the previous
//! one. The sealed buffer carries a trailer:
//!
//! ```text
//! +---------------+-------+---------------+
//! | padded blocks | count | seed (BE u32) |
//! +---------------+-------+---------------+
//! ```
//!
//! where `count` is the number of padding bytes that were appended.

mod block;

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Instant,
};

use self::block::{Block, decrypt_block, encrypt_block};

/// A 128-bit key as four words.
pub type Key = [u32; 4];

const BLOCK_SIZE: usize = 8;
const COUNT_SIZE: usize = 1;
const SEED_SIZE: usize = 4;

/// Mask applied to the seed to derive the second seed word.
const SEED_MASK: u32 = !0xA55A_5AA5;

/// An error that can occur while opening a sealed buffer.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherError {
    /// The buffer is too short or not block aligned.
    #[error("Sealed buffer of {0} bytes is truncated")]
    Truncated(usize),

    /// The padding count in the trailer is out of range.
    #[error("Invalid padding count {0}")]
    InvalidPadding(u8),
}

impl From<CipherError> for kinject_core::InjectError {
    fn from(value: CipherError) -> Self {
        Self::Cipher(Box::new(value))
    }
}

/// Returns the size of the sealed form of `len` plaintext bytes.
///
/// # Examples
///
/// ```
/// # use kinject_cipher::size_for;
/// assert_eq!(size_for(0, true), 0);
/// assert_eq!(size_for(1, false), 9);
/// assert_eq!(size_for(8, true), 13);
/// assert_eq!(size_for(9, true), 21);
/// ```
pub const fn size_for(len: usize, with_seed: bool) -> usize {
    if len == 0 {
        return 0;
    }

    let padded = len.next_multiple_of(BLOCK_SIZE);

    if with_seed {
        padded + COUNT_SIZE + SEED_SIZE
    } else {
        padded + COUNT_SIZE
    }
}

/// Derives a non-zero seed from a monotonic tick counter.
pub fn derive_seed() -> u32 {
    static EPOCH: spin::Once<Instant> = spin::Once::new();
    static SALT: AtomicU32 = AtomicU32::new(0);

    let ticks = EPOCH.call_once(Instant::now).elapsed().as_nanos() as u64;
    let salt = SALT.fetch_add(0x9E37_79B9, Ordering::Relaxed);

    match (ticks as u32) ^ ((ticks >> 32) as u32) ^ salt {
        0 => 1,
        seed => seed,
    }
}

/// Reads the seed stored in the trailer of a sealed buffer.
pub fn stored_seed(sealed: &[u8]) -> Option<u32> {
    let seed = sealed.last_chunk::<SEED_SIZE>()?;
    Some(u32::from_be_bytes(*seed))
}

fn initial_seed(seed: u32) -> Block {
    [seed, seed ^ SEED_MASK]
}

fn read_block(chunk: &[u8]) -> Block {
    [
        u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
        u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
    ]
}

fn write_block(chunk: &mut [u8], block: Block) {
    chunk[..4].copy_from_slice(&block[0].to_le_bytes());
    chunk[4..8].copy_from_slice(&block[1].to_le_bytes());
}

/// The payload transform, bound to a key.
#[derive(Clone)]
pub struct Cipher {
    key: Key,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Creates a new cipher with the given key.
    pub fn new(key: Key) -> Self {
        Self { key }
    }

    /// Returns the key.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Seals `plain`.
    ///
    /// A missing or zero `seed` is derived with [`derive_seed`]. The seed
    /// that was used is always appended to the output. An empty input
    /// produces an empty output.
    pub fn encrypt(&self, plain: &[u8], seed: Option<u32>) -> Vec<u8> {
        if plain.is_empty() {
            return Vec::new();
        }

        let seed = match seed {
            Some(seed) if seed != 0 => seed,
            _ => derive_seed(),
        };

        let padded = plain.len().next_multiple_of(BLOCK_SIZE);
        let count = (padded - plain.len()) as u8;

        let mut output = Vec::with_capacity(size_for(plain.len(), true));
        output.extend_from_slice(plain);
        output.resize(padded, 0);

        let mut chain = initial_seed(seed);
        for chunk in output.chunks_exact_mut(BLOCK_SIZE) {
            let block = encrypt_block(read_block(chunk), chain, &self.key);
            write_block(chunk, block);

            // Encryption chains on the ciphertext it just produced.
            chain = block;
        }

        output.push(count);
        output.extend_from_slice(&seed.to_be_bytes());
        output
    }

    /// Opens a buffer produced by [`encrypt`].
    ///
    /// The seed trailer is always consumed. An explicit non-zero `seed`
    /// overrides the stored one.
    ///
    /// [`encrypt`]: Self::encrypt
    pub fn decrypt(&self, sealed: &[u8], seed: Option<u32>) -> Result<Vec<u8>, CipherError> {
        if sealed.is_empty() {
            return Ok(Vec::new());
        }

        let Some((body, trailer)) = sealed.split_last_chunk::<SEED_SIZE>() else {
            return Err(CipherError::Truncated(sealed.len()));
        };

        let seed = match seed {
            Some(seed) if seed != 0 => seed,
            _ => u32::from_be_bytes(*trailer),
        };

        let Some((&count, body)) = body.split_last() else {
            return Err(CipherError::Truncated(sealed.len()));
        };

        if body.len() % BLOCK_SIZE != 0 {
            return Err(CipherError::Truncated(sealed.len()));
        }

        if count as usize >= BLOCK_SIZE || count as usize > body.len() {
            return Err(CipherError::InvalidPadding(count));
        }

        let mut output = body.to_vec();

        let mut chain = initial_seed(seed);
        for chunk in output.chunks_exact_mut(BLOCK_SIZE) {
            // Decryption chains on the ciphertext it is about to consume.
            let ciphertext = read_block(chunk);
            write_block(chunk, decrypt_block(ciphertext, chain, &self.key));
            chain = ciphertext;
        }

        output.truncate(body.len() - count as usize);
        Ok(output)
    }
}
