use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::VaultError;

type HmacSha256 = Hmac<Sha256>;

/// GCM authentication tag length. The tag is stored separately from the
/// ciphertext so both round-trip through the persisted record format.
pub const TAG_LEN: usize = 16;

/// Per-record IV length. Always freshly drawn from the OS RNG.
pub const IV_LEN: usize = 12;

/// 32-byte AES-256-GCM master key, wiped from memory on drop.
#[derive(ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Parse a master key from exactly 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, VaultError> {
        if s.len() != 64 {
            return Err(VaultError::InvalidInput(format!(
                "master key must be 64 hex characters, got {}",
                s.len()
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|_| VaultError::InvalidInput("master key is not valid hex".into()))?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Encrypt `plaintext` under `key`, returning `(ciphertext, iv, auth_tag)`.
/// A fresh 12-byte IV is drawn per call.
pub fn encrypt(
    key: &MasterKey,
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; IV_LEN], [u8; TAG_LEN]), VaultError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from(iv);

    // The aead API appends the tag to the ciphertext; split it back off so
    // the two persist as distinct record fields.
    let mut sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| VaultError::Backend("encryption failed".into()))?;

    let tag_offset = sealed.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&sealed[tag_offset..]);
    sealed.truncate(tag_offset);

    Ok((sealed, iv, tag))
}

/// Decrypt `(ciphertext, iv, auth_tag)` under `key`. The tag is verified
/// before any plaintext is released; a mismatch yields
/// [`VaultError::Integrity`].
pub fn decrypt(
    key: &MasterKey,
    ciphertext: &[u8],
    iv: &[u8; IV_LEN],
    auth_tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>, VaultError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(auth_tag);

    cipher
        .decrypt(&Nonce::from(*iv), sealed.as_slice())
        .map_err(|_| VaultError::Integrity)
}

/// Compute the raw 32-byte HMAC-SHA-256 tag of `message` under `secret`.
/// Rendered as 64 lowercase hex chars wherever it crosses a boundary.
pub fn compute_signature(secret: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Deterministic 32-byte sub-key: `HMAC-SHA-256(master_key, context)`.
/// Provided for per-alias key isolation; the relay pipeline itself encrypts
/// everything under the master key directly.
pub fn derive_subkey(key: &MasterKey, context: &str) -> [u8; 32] {
    compute_signature(key.as_bytes(), context.as_bytes())
}

/// `n` bytes from the OS RNG, hex-encoded (2n chars). Used for nonces and
/// audit entry ids.
pub fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> MasterKey {
        MasterKey::from_hex(&"00".repeat(32)).unwrap()
    }

    #[test]
    fn round_trip() {
        let key = test_key();
        let plaintext = b"sk-live-abc123";
        let (ct, iv, tag) = encrypt(&key, plaintext).unwrap();
        let pt = decrypt(&key, &ct, &iv, &tag).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn wrong_key_fails() {
        let key1 = test_key();
        let key2 = MasterKey::from_hex(&"11".repeat(32)).unwrap();
        let (ct, iv, tag) = encrypt(&key1, b"secret").unwrap();
        assert!(matches!(
            decrypt(&key2, &ct, &iv, &tag),
            Err(VaultError::Integrity)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = test_key();
        let (mut ct, iv, tag) = encrypt(&key, b"secret").unwrap();
        ct[0] ^= 0x01;
        assert!(matches!(
            decrypt(&key, &ct, &iv, &tag),
            Err(VaultError::Integrity)
        ));
    }

    #[test]
    fn tampered_tag_fails() {
        let key = test_key();
        let (ct, iv, mut tag) = encrypt(&key, b"secret").unwrap();
        tag[15] ^= 0x80;
        assert!(matches!(
            decrypt(&key, &ct, &iv, &tag),
            Err(VaultError::Integrity)
        ));
    }

    #[test]
    fn fresh_iv_per_call() {
        let key = test_key();
        let (ct1, iv1, _) = encrypt(&key, b"same plaintext").unwrap();
        let (ct2, iv2, _) = encrypt(&key, b"same plaintext").unwrap();
        assert_ne!(iv1, iv2);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn master_key_length_is_strict() {
        assert!(MasterKey::from_hex(&"a".repeat(63)).is_err());
        assert!(MasterKey::from_hex(&"a".repeat(64)).is_ok());
        assert!(MasterKey::from_hex(&"a".repeat(65)).is_err());
        assert!(MasterKey::from_hex(&"g".repeat(64)).is_err());
    }

    #[test]
    fn signature_is_deterministic_and_field_sensitive() {
        let sig1 = compute_signature(b"s", b"weather:GET:/data:1700000000000:n1");
        let sig2 = compute_signature(b"s", b"weather:GET:/data:1700000000000:n1");
        assert_eq!(sig1, sig2);

        // Any one field changing changes the tag.
        for altered in [
            "weathex:GET:/data:1700000000000:n1",
            "weather:PUT:/data:1700000000000:n1",
            "weather:GET:/datb:1700000000000:n1",
            "weather:GET:/data:1700000000001:n1",
            "weather:GET:/data:1700000000000:n2",
        ] {
            assert_ne!(sig1, compute_signature(b"s", altered.as_bytes()));
        }

        // Different secret, different tag.
        assert_ne!(
            sig1,
            compute_signature(b"t", b"weather:GET:/data:1700000000000:n1")
        );
    }

    #[test]
    fn subkey_is_deterministic_and_context_separated() {
        let key = test_key();
        assert_eq!(derive_subkey(&key, "alias:a"), derive_subkey(&key, "alias:a"));
        assert_ne!(derive_subkey(&key, "alias:a"), derive_subkey(&key, "alias:b"));
    }

    #[test]
    fn random_hex_length_and_uniqueness() {
        let a = random_hex(8);
        let b = random_hex(8);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
