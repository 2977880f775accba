use std::{fmt, num::NonZeroUsize, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use lru::LruCache;
use parking_lot::Mutex;
use rand::RngCore;
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    Oaep, RsaPrivateKey, RsaPublicKey,
};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use shared::protocol::EncryptionEnvelope;
use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{DecryptError, KeyError, SealError};

pub const SYMMETRIC_KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const DEFAULT_PARSE_CACHE_CAPACITY: usize = 10;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// PEM-encoded RSA private key text. Wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKeyPem(String);

impl PrivateKeyPem {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PrivateKeyPem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKeyPem(<redacted>)")
    }
}

/// Cheap structural check: PEM armor present and a private-key label.
pub fn check_pem_markers(text: &str) -> Result<(), KeyError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(KeyError::malformed("key text is empty"));
    }
    if !text.contains("-----BEGIN") || !text.contains("-----END") {
        return Err(KeyError::malformed("missing PEM armor"));
    }
    if !text.contains("PRIVATE KEY") {
        return Err(KeyError::malformed("PEM block is not a private key"));
    }
    Ok(())
}

/// Parses PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`).
pub fn parse_private_key(pem: &PrivateKeyPem) -> Result<RsaPrivateKey, KeyError> {
    check_pem_markers(pem.as_str())?;
    let text = pem.as_str().trim();
    RsaPrivateKey::from_pkcs8_pem(text)
        .or_else(|pkcs8_err| {
            RsaPrivateKey::from_pkcs1_pem(text).map_err(|pkcs1_err| {
                KeyError::malformed(format!("pkcs8: {pkcs8_err}; pkcs1: {pkcs1_err}"))
            })
        })
}

pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, SealError> {
    let text = pem.trim();
    RsaPublicKey::from_public_key_pem(text)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(text))
        .map_err(|err| SealError::PublicKey(err.to_string()))
}

/// Bounded LRU of parsed private keys, keyed by a digest of the PEM text so
/// the cache never holds a second copy of the secret.
pub struct ParsedKeyCache {
    entries: Mutex<LruCache<[u8; 32], Arc<RsaPrivateKey>>>,
}

impl ParsedKeyCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get_or_parse(&self, pem: &PrivateKeyPem) -> Result<Arc<RsaPrivateKey>, KeyError> {
        let fingerprint: [u8; 32] = Sha256::digest(pem.as_str().trim().as_bytes()).into();
        if let Some(parsed) = self.entries.lock().get(&fingerprint) {
            trace!("crypto: parsed key cache hit");
            return Ok(Arc::clone(parsed));
        }

        let parsed = Arc::new(parse_private_key(pem)?);
        self.entries.lock().put(fingerprint, Arc::clone(&parsed));
        Ok(parsed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for ParsedKeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_PARSE_CACHE_CAPACITY)
    }
}

/// Opens one envelope: unwrap the AES key with RSA-OAEP, then AES-256-CBC.
/// Blank or non-UTF-8 output is a failure, never a message.
pub fn open_envelope(
    key: &RsaPrivateKey,
    envelope: &EncryptionEnvelope,
) -> Result<String, DecryptError> {
    if !envelope.is_complete() {
        return Err(DecryptError::EnvelopeIncomplete);
    }

    let wrapped = decode_field(&envelope.wrapped_symmetric_key, "encryptedAESKey")?;
    let iv = decode_field(&envelope.initialization_vector, "iv")?;
    if iv.len() != IV_LEN {
        return Err(DecryptError::IvLength {
            expected: IV_LEN,
            actual: iv.len(),
        });
    }
    let body = decode_field(&envelope.ciphertext_body, "encryptedMessage")?;

    let symmetric_key = unwrap_symmetric_key(key, &wrapped)?;
    let plaintext = Aes256CbcDec::new_from_slices(&symmetric_key, &iv)
        .map_err(|_| DecryptError::Cipher)?
        .decrypt_padded_vec_mut::<Pkcs7>(&body)
        .map_err(|_| DecryptError::Cipher)?;

    let text = String::from_utf8(plaintext).map_err(|err| {
        let mut bytes = err.into_bytes();
        bytes.zeroize();
        DecryptError::InvalidUtf8
    })?;
    if text.trim().is_empty() {
        return Err(DecryptError::EmptyPlaintext);
    }
    Ok(text)
}

/// Encrypts `plaintext` for the holder of `recipient`'s private key.
pub fn seal_envelope(
    recipient: &RsaPublicKey,
    plaintext: &str,
) -> Result<EncryptionEnvelope, SealError> {
    let mut rng = rand::thread_rng();
    let mut symmetric_key = Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]);
    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(symmetric_key.as_mut());
    rng.fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new_from_slices(symmetric_key.as_ref(), &iv)
        .map_err(|_| SealError::Cipher)?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    let wrapped = recipient
        .encrypt(&mut rng, Oaep::new::<Sha256>(), symmetric_key.as_ref())
        .map_err(|err| SealError::Wrap(err.to_string()))?;

    Ok(EncryptionEnvelope {
        ciphertext_body: STANDARD.encode(ciphertext),
        wrapped_symmetric_key: STANDARD.encode(wrapped),
        initialization_vector: STANDARD.encode(iv),
    })
}

fn decode_field(value: &str, field: &'static str) -> Result<Vec<u8>, DecryptError> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|_| DecryptError::InvalidEncoding { field })
}

/// SHA-256 OAEP first; keys wrapped by older senders used SHA-1.
fn unwrap_symmetric_key(
    key: &RsaPrivateKey,
    wrapped: &[u8],
) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
    if let Ok(unwrapped) = key.decrypt(Oaep::new::<Sha256>(), wrapped) {
        let unwrapped = Zeroizing::new(unwrapped);
        if unwrapped.len() == SYMMETRIC_KEY_LEN {
            return Ok(unwrapped);
        }
        debug!(
            len = unwrapped.len(),
            "crypto: sha-256 unwrap produced wrong key length"
        );
    }

    debug!("crypto: retrying key unwrap with sha-1 oaep");
    let unwrapped = key
        .decrypt(Oaep::new::<Sha1>(), wrapped)
        .map(Zeroizing::new)
        .map_err(|_| DecryptError::KeyUnwrap)?;
    if unwrapped.len() != SYMMETRIC_KEY_LEN {
        return Err(DecryptError::SymmetricKeyLength {
            expected: SYMMETRIC_KEY_LEN,
            actual: unwrapped.len(),
        });
    }
    Ok(unwrapped)
}

#[cfg(test)]
#[path = "tests/crypto_tests.rs"]
mod tests;
