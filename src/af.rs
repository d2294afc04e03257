//! Anti-forensic splitting of key material, compatible with `cryptsetup`'s
//! `afsplitter`. A key split over `n` stripes can only be recovered with all
//! `n` stripes present; any proper subset carries no information about it.

use digest::{Digest, FixedOutputReset};
use rand::prelude::*;

use crate::error::LuksError;

fn xor_block(src: &[u8], dst: &mut [u8], n: usize) {
    for j in 0..n {
        dst[j] = src[j] ^ dst[j];
    }
}

fn diffuse<H: Digest + FixedOutputReset>(buf: &mut [u8], size: usize) {
    let mut hash = H::new();
    let digest_size = <H as Digest>::output_size();
    let blocks = size / digest_size;
    let padding = size % digest_size;

    for i in 0..blocks {
        Digest::update(&mut hash, (i as u32).to_be_bytes()); // i is the iv

        let s = digest_size * i;
        let e = s + digest_size;
        Digest::update(&mut hash, &buf[s..e]);
        buf[s..e].copy_from_slice(&hash.finalize_reset()[..]);
    }
    if padding != 0 {
        Digest::update(&mut hash, (blocks as u32).to_be_bytes()); // i is the iv

        let s = digest_size * blocks;
        let e = s + padding;
        Digest::update(&mut hash, &buf[s..e]);
        buf[s..e].copy_from_slice(&hash.finalize_reset()[..padding]);
    }
}

/// Expands `key` into `stripes` stripes of `key.len()` bytes each. The first
/// `stripes - 1` stripes are random; the last one closes the XOR/diffusion
/// chain so that [`merge`] recovers the key.
pub fn split<H>(key: &[u8], stripes: usize) -> Result<Vec<u8>, LuksError>
where
    H: Digest + FixedOutputReset,
{
    let block_size = key.len();
    if block_size == 0 || stripes == 0 {
        return Err(LuksError::CorruptStriping {
            len: block_size * stripes,
            block_size,
            stripes,
        });
    }

    let mut bufblock = vec![0; block_size];
    let mut dst = vec![0; block_size * stripes];
    let mut rng = StdRng::try_from_os_rng().map_err(|_| LuksError::Random)?;

    for i in 0..stripes {
        let s = block_size * i;
        let e = s + block_size;
        if i < (stripes - 1) {
            rng.fill_bytes(&mut dst[s..e]);
            xor_block(&dst[s..e], &mut bufblock, block_size);
            diffuse::<H>(&mut bufblock, block_size);
        } else {
            dst[s..e].copy_from_slice(key);
            xor_block(&bufblock, &mut dst[s..e], block_size);
        }
    }

    Ok(dst)
}

/// Recovers the key from material produced by [`split`] with the same
/// `block_size` and `stripes` values.
pub fn merge<H>(striped: &[u8], block_size: usize, stripes: usize) -> Result<Vec<u8>, LuksError>
where
    H: Digest + FixedOutputReset,
{
    if block_size == 0 || stripes == 0 || striped.len() != block_size * stripes {
        return Err(LuksError::CorruptStriping {
            len: striped.len(),
            block_size,
            stripes,
        });
    }

    let mut bufblock = vec![0; block_size];

    for i in 0..stripes {
        let s = block_size * i;
        let e = s + block_size;
        xor_block(&striped[s..e], &mut bufblock, block_size);
        if i < (stripes - 1) {
            diffuse::<H>(&mut bufblock, block_size);
        }
    }

    Ok(bufblock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Sha256, Sha512};

    #[test]
    fn test_af_roundtrip() {
        let key: Vec<u8> = (0..64).collect();
        let stripes = 4_000;
        let key_split = split::<Sha256>(&key, stripes).unwrap();
        assert_eq!(key_split.len(), key.len() * stripes);
        let key_merged = merge::<Sha256>(&key_split, key.len(), stripes).unwrap();
        assert_eq!(key, key_merged);
    }

    #[test]
    fn test_af_single_stripe() {
        let key: Vec<u8> = (0..32).collect();
        let key_split = split::<Sha256>(&key, 1).unwrap();
        let key_merged = merge::<Sha256>(&key_split, key.len(), 1).unwrap();
        assert_eq!(key, key_merged);
    }

    #[test]
    fn test_af_padding_block() {
        // 48-byte key does not divide evenly into sha512 digest blocks
        let key: Vec<u8> = (0..48).collect();
        let key_split = split::<Sha512>(&key, 7).unwrap();
        let key_merged = merge::<Sha512>(&key_split, key.len(), 7).unwrap();
        assert_eq!(key, key_merged);
    }

    #[test]
    fn test_af_damaged_stripe_destroys_key() {
        let key: Vec<u8> = (0..64).collect();
        let stripes = 4_000;
        let mut key_split = split::<Sha256>(&key, stripes).unwrap();
        key_split[123] ^= 0x01;
        let key_merged = merge::<Sha256>(&key_split, key.len(), stripes).unwrap();
        assert_ne!(key, key_merged);
    }

    #[test]
    fn test_af_length_mismatch() {
        let striped = vec![0u8; 100];
        assert!(matches!(
            merge::<Sha256>(&striped, 64, 4_000),
            Err(LuksError::CorruptStriping { .. })
        ));
        assert!(matches!(
            merge::<Sha256>(&striped, 0, 0),
            Err(LuksError::CorruptStriping { .. })
        ));
    }
}
