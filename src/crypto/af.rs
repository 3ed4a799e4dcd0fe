// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Anti-forensic information splitter.
//!
//! Expands a key into `stripes` blocks of the same length. All but the last
//! stripe are random; each is XORed into a running accumulator which is then
//! diffused through the hash. The last stripe is the accumulator XOR the key.
//! Losing any single non-final stripe makes the key unrecoverable.

use super::registry::HashAlgorithm;
use crate::error::{LuksError, Result};

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

/// Hash-based diffusion of `block` in place.
///
/// Each digest-sized chunk `i` becomes `H(be32(i) || chunk)`; a trailing
/// partial chunk takes the prefix of its digest.
fn diffuse(block: &mut [u8], hash: HashAlgorithm) {
    let digest_size = hash.digest_size();
    for (i, chunk) in block.chunks_mut(digest_size).enumerate() {
        let iv = (i as u32).to_be_bytes();
        let digest = Zeroizing::new(hash.digest(&[&iv, chunk]));
        let len = chunk.len();
        chunk.copy_from_slice(&digest[..len]);
    }
}

fn xor_into(acc: &mut [u8], other: &[u8]) {
    acc.iter_mut().zip(other).for_each(|(a, b)| *a ^= b);
}

fn check_args(key_len: usize, stripes: u32) -> Result<()> {
    if key_len == 0 {
        return Err(LuksError::InvalidParameter("cannot split an empty key".into()));
    }
    if stripes == 0 {
        return Err(LuksError::InvalidParameter("stripe count must be at least 1".into()));
    }
    Ok(())
}

/// Splits `key` into `stripes * key.len()` bytes of material.
pub fn split(key: &[u8], stripes: u32, hash: HashAlgorithm) -> Result<Zeroizing<Vec<u8>>> {
    split_with_rng(key, stripes, hash, &mut OsRng)
}

/// [`split`] with a caller-provided randomness source.
pub fn split_with_rng<R: RngCore>(
    key: &[u8],
    stripes: u32,
    hash: HashAlgorithm,
    rng: &mut R,
) -> Result<Zeroizing<Vec<u8>>> {
    check_args(key.len(), stripes)?;
    let block_len = key.len();
    let mut material = Zeroizing::new(vec![0u8; block_len * stripes as usize]);
    let mut acc = Zeroizing::new(vec![0u8; block_len]);

    let (random, last) = material.split_at_mut(block_len * (stripes as usize - 1));
    for stripe in random.chunks_exact_mut(block_len) {
        rng.try_fill_bytes(stripe)
            .map_err(|e| LuksError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        xor_into(&mut acc, stripe);
        diffuse(&mut acc, hash);
    }
    last.copy_from_slice(&acc);
    xor_into(last, key);

    Ok(material)
}

/// Recovers the key from split material. Exact inverse of [`split`].
///
/// Corruption is not detected here; the caller compares the result against
/// the volume key digest.
pub fn merge(material: &[u8], stripes: u32, hash: HashAlgorithm) -> Result<Zeroizing<Vec<u8>>> {
    if stripes == 0 || material.len() % stripes as usize != 0 {
        return Err(LuksError::InvalidParameter(format!(
            "material of {} bytes does not hold {} stripes",
            material.len(),
            stripes
        )));
    }
    let block_len = material.len() / stripes as usize;
    check_args(block_len, stripes)?;

    let mut acc = Zeroizing::new(vec![0u8; block_len]);
    let (random, last) = material.split_at(block_len * (stripes as usize - 1));
    for stripe in random.chunks_exact(block_len) {
        xor_into(&mut acc, stripe);
        diffuse(&mut acc, hash);
    }
    xor_into(&mut acc, last);
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_split_merge_identity() {
        let key: Vec<u8> = (0..64u8).collect();
        let material = split(&key, 4000, HashAlgorithm::Sha256).unwrap();
        assert_eq!(material.len(), 64 * 4000);

        let merged = merge(&material, 4000, HashAlgorithm::Sha256).unwrap();
        assert_eq!(&merged[..], &key[..]);
    }

    #[test]
    fn test_single_stripe_is_key() {
        let key = [0x5au8; 32];
        let material = split(&key, 1, HashAlgorithm::Sha1).unwrap();
        assert_eq!(&material[..], &key[..]);
    }

    #[test]
    fn test_partial_digest_block() {
        // 20-byte digest over a 64-byte key leaves a 4-byte tail chunk
        let key = [7u8; 64];
        let material = split(&key, 3, HashAlgorithm::Sha1).unwrap();
        let merged = merge(&material, 3, HashAlgorithm::Sha1).unwrap();
        assert_eq!(&merged[..], &key[..]);
    }

    #[test]
    fn test_corrupt_stripe_destroys_key() {
        let key = [0x11u8; 32];
        let mut material = split(&key, 10, HashAlgorithm::Sha256).unwrap();
        material[32 * 4] ^= 0x01;
        let merged = merge(&material, 10, HashAlgorithm::Sha256).unwrap();
        assert_ne!(&merged[..], &key[..]);
    }

    #[test]
    fn test_seeded_split_is_deterministic() {
        let key = [3u8; 16];
        let a = split_with_rng(&key, 8, HashAlgorithm::Sha512, &mut StdRng::seed_from_u64(9)).unwrap();
        let b = split_with_rng(&key, 8, HashAlgorithm::Sha512, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(&a[..], &b[..]);
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(split(&[], 4, HashAlgorithm::Sha256).is_err());
        assert!(split(&[1, 2], 0, HashAlgorithm::Sha256).is_err());
        assert!(merge(&[0u8; 10], 3, HashAlgorithm::Sha256).is_err());
    }
}
