//! # Entry Encryption Seam
//!
//! Optional cipher applied to leaf values before they are written and after
//! they are read. The engine does not ship a cipher; embedders supply one
//! through this trait when their deployment requires encryption at rest.

use eyre::Result;

pub trait EntryCipher: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Vec<u8>;
    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>>;
}

/// Identity cipher for tests and callers that want the seam exercised
/// without real cryptography.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCipher;

impl EntryCipher for PassthroughCipher {
    fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        plain.to_vec()
    }

    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>> {
        Ok(cipher.to_vec())
    }
}
