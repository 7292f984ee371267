//! Encrypted arithmetic capability.
//!
//! Scheduling only ever touches [`Ciphertext`] values through an
//! [`FheBackend`]: the packing code never sees a plaintext capacity or load.
//! The backend contract is addition, subtraction, multiplication, a
//! less-than comparison yielding an encrypted 0/1, and an encrypted select.
//! Boolean connectives over 0/1 ciphertexts are derived from those.
//!
//! [`SimulatedFhe`] implements the contract with a keyed stream mask. It
//! preserves the data flow of a real homomorphic scheme (every operation is
//! fed and produces opaque bytes) but offers no confidentiality against the
//! process evaluating it, since that process holds the key. A production
//! deployment plugs a real scheme in behind the same trait.

use std::sync::atomic::{AtomicU64, Ordering};

use canteen_state::Ciphertext;
use sha2::{Digest, Sha256};

use crate::error::{PlacementError, PlacementResult};

/// Opaque encrypted-integer operations over unsigned 64-bit values.
///
/// Arithmetic wraps. Comparison and select take and return 0/1 ciphertexts.
pub trait FheBackend: Send + Sync {
    fn encrypt(&self, value: u64) -> Ciphertext;

    fn add(&self, a: &Ciphertext, b: &Ciphertext) -> PlacementResult<Ciphertext>;

    fn sub(&self, a: &Ciphertext, b: &Ciphertext) -> PlacementResult<Ciphertext>;

    fn mul(&self, a: &Ciphertext, b: &Ciphertext) -> PlacementResult<Ciphertext>;

    /// Encrypted `1` if `a < b`, else encrypted `0`.
    fn lt(&self, a: &Ciphertext, b: &Ciphertext) -> PlacementResult<Ciphertext>;

    /// `a` where `cond` is 1, `b` where it is 0.
    fn select(
        &self,
        cond: &Ciphertext,
        a: &Ciphertext,
        b: &Ciphertext,
    ) -> PlacementResult<Ciphertext>;

    fn and(&self, a: &Ciphertext, b: &Ciphertext) -> PlacementResult<Ciphertext> {
        self.mul(a, b)
    }

    fn or(&self, a: &Ciphertext, b: &Ciphertext) -> PlacementResult<Ciphertext> {
        let sum = self.add(a, b)?;
        let both = self.mul(a, b)?;
        self.sub(&sum, &both)
    }

    fn not(&self, a: &Ciphertext) -> PlacementResult<Ciphertext> {
        self.sub(&self.encrypt(1), a)
    }
}

// ── Key material ──────────────────────────────────────────────────

const NONCE_LEN: usize = 8;
const VALUE_LEN: usize = 8;
const CIPHERTEXT_LEN: usize = NONCE_LEN + VALUE_LEN;

/// Symmetric key shared by the encrypting nodes and the decryption authority.
#[derive(Clone)]
pub struct SchedulingKey {
    secret: [u8; 32],
}

impl std::fmt::Debug for SchedulingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SchedulingKey(..)")
    }
}

impl SchedulingKey {
    /// Derive the key from a cluster-wide passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"canteen/scheduling-key/v1\n");
        hasher.update(passphrase.as_bytes());
        Self {
            secret: hasher.finalize().into(),
        }
    }

    /// Public fingerprint, safe to gossip as a node's key share.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.secret);
        hex::encode(&digest[..8])
    }

    fn pad(&self, nonce: u64) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update(nonce.to_be_bytes());
        let digest = hasher.finalize();
        let mut word = [0u8; VALUE_LEN];
        word.copy_from_slice(&digest[..VALUE_LEN]);
        u64::from_be_bytes(word)
    }

    pub(crate) fn seal(&self, value: u64, nonce: u64) -> Ciphertext {
        let mut bytes = Vec::with_capacity(CIPHERTEXT_LEN);
        bytes.extend_from_slice(&nonce.to_be_bytes());
        bytes.extend_from_slice(&(value ^ self.pad(nonce)).to_be_bytes());
        Ciphertext(bytes)
    }

    /// Recover the plaintext of a ciphertext produced under this key.
    pub fn open(&self, ct: &Ciphertext) -> PlacementResult<u64> {
        let bytes = ct.as_bytes();
        if bytes.len() != CIPHERTEXT_LEN {
            return Err(PlacementError::MalformedCiphertext(format!(
                "expected {CIPHERTEXT_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[..NONCE_LEN]);
        let mut masked = [0u8; VALUE_LEN];
        masked.copy_from_slice(&bytes[NONCE_LEN..]);
        Ok(u64::from_be_bytes(masked) ^ self.pad(u64::from_be_bytes(nonce)))
    }
}

// ── Simulated backend ─────────────────────────────────────────────

/// Stand-in homomorphic backend built on [`SchedulingKey`].
pub struct SimulatedFhe {
    key: SchedulingKey,
    nonce: AtomicU64,
}

impl SimulatedFhe {
    pub fn new(key: SchedulingKey) -> Self {
        Self {
            key,
            // Random start so two nodes sharing a key do not reuse nonces.
            nonce: AtomicU64::new(rand::random::<u64>()),
        }
    }

    pub fn key(&self) -> &SchedulingKey {
        &self.key
    }

    fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::Relaxed)
    }

    fn binary(
        &self,
        a: &Ciphertext,
        b: &Ciphertext,
        op: impl FnOnce(u64, u64) -> u64,
    ) -> PlacementResult<Ciphertext> {
        let x = self.key.open(a)?;
        let y = self.key.open(b)?;
        Ok(self.encrypt(op(x, y)))
    }
}

impl FheBackend for SimulatedFhe {
    fn encrypt(&self, value: u64) -> Ciphertext {
        self.key.seal(value, self.next_nonce())
    }

    fn add(&self, a: &Ciphertext, b: &Ciphertext) -> PlacementResult<Ciphertext> {
        self.binary(a, b, u64::wrapping_add)
    }

    fn sub(&self, a: &Ciphertext, b: &Ciphertext) -> PlacementResult<Ciphertext> {
        self.binary(a, b, u64::wrapping_sub)
    }

    fn mul(&self, a: &Ciphertext, b: &Ciphertext) -> PlacementResult<Ciphertext> {
        self.binary(a, b, u64::wrapping_mul)
    }

    fn lt(&self, a: &Ciphertext, b: &Ciphertext) -> PlacementResult<Ciphertext> {
        self.binary(a, b, |x, y| u64::from(x < y))
    }

    fn select(
        &self,
        cond: &Ciphertext,
        a: &Ciphertext,
        b: &Ciphertext,
    ) -> PlacementResult<Ciphertext> {
        let c = self.key.open(cond)?;
        let x = self.key.open(a)?;
        let y = self.key.open(b)?;
        Ok(self.encrypt(if c != 0 { x } else { y }))
    }
}
