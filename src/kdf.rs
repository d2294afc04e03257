//! Password-based key derivation for key slots, and the empirical cost
//! tuning used when creating volumes.

use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::error::LuksError;
use crate::hash::HashAlg;

/// How long a single derivation should take with freshly tuned costs.
const CALIBRATION_TARGET: Duration = Duration::from_secs(1);

/// Argon2 memory tuning never exceeds 1 GiB.
const MEMORY_CEILING_KIB: u32 = 1 << 20;

pub(crate) fn derive_pbkdf2(
    hash: &HashAlg,
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    key_len: usize,
) -> Result<Zeroizing<Vec<u8>>, LuksError> {
    let mut key = Zeroizing::new(vec![0u8; key_len]);
    hash.pbkdf2(password, salt, iterations, &mut key)?;
    Ok(key)
}

pub(crate) fn derive_argon2(
    algorithm: argon2::Algorithm,
    password: &[u8],
    salt: &[u8],
    time: u32,
    memory: u32,
    cpus: u32,
    key_len: usize,
) -> Result<Zeroizing<Vec<u8>>, LuksError> {
    let params = argon2::Params::new(memory, time, cpus, Some(key_len))?;
    let argon = argon2::Argon2::new(algorithm, argon2::Version::V0x13, params);
    let mut key = Zeroizing::new(vec![0u8; key_len]);
    argon.hash_password_into(password, salt, &mut key)?;
    Ok(key)
}

/// Picks a PBKDF2 iteration count such that one derivation of `key_len`
/// bytes takes about [`CALIBRATION_TARGET`] on this host. Faster hosts get
/// strictly larger counts.
pub fn pbkdf2_cost(salt: &[u8], key_len: usize, hash: &HashAlg) -> Result<u32, LuksError> {
    let mut out = vec![0u8; key_len];
    let mut iterations: u32 = 1_000;
    loop {
        let start = Instant::now();
        hash.pbkdf2(&[], salt, iterations, &mut out)?;
        if start.elapsed() >= CALIBRATION_TARGET || iterations > u32::MAX / 2 {
            return Ok(iterations);
        }
        iterations *= 2;
    }
}

/// Picks an Argon2 memory cost (in KiB) for fixed time and thread costs so
/// that one derivation takes about [`CALIBRATION_TARGET`], capped at
/// [`MEMORY_CEILING_KIB`].
pub fn argon2_memory_cost(
    salt: &[u8],
    key_len: usize,
    time_cost: u32,
    threads: u32,
) -> Result<u32, LuksError> {
    let mut memory: u32 = 1_024.max(8 * threads);
    loop {
        let start = Instant::now();
        derive_argon2(
            argon2::Algorithm::Argon2i,
            &[],
            salt,
            time_cost,
            memory,
            threads,
            key_len,
        )?;
        if start.elapsed() >= CALIBRATION_TARGET || memory >= MEMORY_CEILING_KIB / 2 {
            return Ok(memory);
        }
        memory *= 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pbkdf2_is_deterministic() {
        let a = derive_pbkdf2(&HashAlg::Sha256, b"hunter2", b"salt-bytes", 1_000, 64).unwrap();
        let b = derive_pbkdf2(&HashAlg::Sha256, b"hunter2", b"salt-bytes", 1_000, 64).unwrap();
        assert_eq!(&a[..], &b[..]);
        let c = derive_pbkdf2(&HashAlg::Sha256, b"hunter2", b"other-salt", 1_000, 64).unwrap();
        assert_ne!(&a[..], &c[..]);
    }

    #[test]
    fn test_argon2_variants_differ() {
        let salt = [0x5au8; 32];
        let i = derive_argon2(argon2::Algorithm::Argon2i, b"p", &salt, 1, 64, 4, 64).unwrap();
        let id = derive_argon2(argon2::Algorithm::Argon2id, b"p", &salt, 1, 64, 4, 64).unwrap();
        assert_ne!(&i[..], &id[..]);
    }

    #[test]
    fn test_argon2_rejects_bad_params() {
        // memory below 8 * lanes is invalid
        assert!(derive_argon2(argon2::Algorithm::Argon2i, b"p", &[0u8; 32], 1, 8, 4, 64).is_err());
    }
}
