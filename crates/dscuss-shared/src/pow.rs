//! Hashcash-style proof of work over scrypt.
//!
//! A nonce is valid for `data` at difficulty `T` when
//! `scrypt(data || BE64(nonce), POW_SALT, N=32768, r=8, p=1, 32)` read as a
//! big-endian 256-bit number is below `2^(256 - T)`, i.e. its first `T` bits
//! are zero.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::constants::{
    MAX_POW_DIFFICULTY, POW_HASH_LEN, POW_SALT, POW_SCRYPT_LOG_N, POW_SCRYPT_P, POW_SCRYPT_R,
};
use crate::error::CryptoError;

/// Upper bound on search threads; every worker holds a 32 MiB scrypt buffer.
const MAX_WORKERS: usize = 8;

fn scrypt_params() -> Result<scrypt::Params, CryptoError> {
    scrypt::Params::new(POW_SCRYPT_LOG_N, POW_SCRYPT_R, POW_SCRYPT_P, POW_HASH_LEN)
        .map_err(|e| CryptoError::PowHash(e.to_string()))
}

fn pow_hash(
    data: &[u8],
    nonce: u64,
    params: &scrypt::Params,
) -> Result<[u8; POW_HASH_LEN], CryptoError> {
    let mut input = Vec::with_capacity(data.len() + 8);
    input.extend_from_slice(data);
    input.extend_from_slice(&nonce.to_be_bytes());

    let mut out = [0u8; POW_HASH_LEN];
    scrypt::scrypt(&input, POW_SALT, params, &mut out)
        .map_err(|e| CryptoError::PowHash(e.to_string()))?;
    Ok(out)
}

fn leading_zero_bits(hash: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

fn meets(
    data: &[u8],
    nonce: u64,
    difficulty: u32,
    params: &scrypt::Params,
) -> Result<bool, CryptoError> {
    Ok(leading_zero_bits(&pow_hash(data, nonce, params)?) >= difficulty)
}

/// Check a nonce against the difficulty. A hash that cannot be computed
/// never verifies.
pub fn verify(data: &[u8], nonce: u64, difficulty: u32) -> bool {
    if difficulty == 0 {
        return true;
    }
    if difficulty > MAX_POW_DIFFICULTY {
        return false;
    }
    match scrypt_params().and_then(|params| meets(data, nonce, difficulty, &params)) {
        Ok(valid) => valid,
        Err(e) => {
            tracing::warn!(error = %e, "proof-of-work hash failed");
            false
        }
    }
}

/// Search for a nonce in parallel.
///
/// Workers draw increasing nonces from a shared counter; the first one to
/// find a solution stops the others. Fails with
/// [`CryptoError::PowCancelled`] when `cancel` is raised first, and up front
/// when `difficulty` exceeds the hash width.
pub fn find(data: &[u8], difficulty: u32, cancel: &AtomicBool) -> Result<u64, CryptoError> {
    if difficulty > MAX_POW_DIFFICULTY {
        return Err(CryptoError::PowDifficulty(difficulty));
    }
    if difficulty == 0 {
        return Ok(0);
    }
    let params = scrypt_params()?;

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_WORKERS);

    let counter = AtomicU64::new(0);
    let found = AtomicBool::new(false);
    let result = AtomicU64::new(0);
    let failed = AtomicBool::new(false);
    let failure = std::sync::Mutex::new(None::<CryptoError>);

    tracing::debug!(workers, difficulty, "Starting proof-of-work search");

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if found.load(Ordering::Relaxed)
                    || failed.load(Ordering::Relaxed)
                    || cancel.load(Ordering::Relaxed)
                {
                    break;
                }
                let nonce = counter.fetch_add(1, Ordering::Relaxed);
                match meets(data, nonce, difficulty, &params) {
                    Ok(true) => {
                        if !found.swap(true, Ordering::AcqRel) {
                            result.store(nonce, Ordering::Release);
                        }
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        if let Ok(mut slot) = failure.lock() {
                            slot.get_or_insert(e);
                        }
                        failed.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            });
        }
    });

    if let Some(e) = failure.into_inner().ok().flatten() {
        tracing::warn!(error = %e, "Proof-of-work search failed");
        return Err(e);
    }
    if found.load(Ordering::Acquire) {
        let nonce = result.load(Ordering::Acquire);
        tracing::info!(nonce, tries = counter.load(Ordering::Relaxed), "Proof of work found");
        Ok(nonce)
    } else {
        tracing::warn!("Proof-of-work search cancelled");
        Err(CryptoError::PowCancelled)
    }
}
