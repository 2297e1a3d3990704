use crate::error::Result;

/// Symmetric text cipher applied to every payload
///
/// Implementations hold their own key material. `decrypt(encrypt(x))` must
/// return `x`, and ciphertext must be valid text since it travels as UTF-8.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;

    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Identity cipher, for tests and trusted local links
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCipher;

impl Cipher for PlainCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_owned())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_owned())
    }
}
