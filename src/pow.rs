//! Hashcash-style proof of work gating both hidden-service endpoints.

use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Static difficulty in leading zero bits of the solution hash.
pub const POW_DIFFICULTY: u32 = 16;

pub const CHALLENGE_BYTES: usize = 24;

pub fn new_challenge() -> Vec<u8> {
    let mut challenge = vec![0u8; CHALLENGE_BYTES];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

fn solution_hash(challenge: &[u8], solution: u64) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(challenge);
    h.update(solution.to_le_bytes());
    h.finalize().into()
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

pub fn check(challenge: &[u8], solution: u64, difficulty: u32) -> bool {
    leading_zero_bits(&solution_hash(challenge, solution)) >= difficulty
}

/// Brute-forces a solution. Client side; cost scales with 2^difficulty.
pub fn solve(challenge: &[u8], difficulty: u32) -> u64 {
    let mut solution = 0u64;
    while !check(challenge, solution, difficulty) {
        solution += 1;
    }
    solution
}
