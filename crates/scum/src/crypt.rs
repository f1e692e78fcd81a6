//! Crypt - hybrid encryption envelope for stored credentials
//!
//! Every encryption generates a fresh 256-bit data key. The payload is sealed
//! with AES-256-GCM under that key, and the key itself is wrapped to the
//! public key with age (X25519 + ChaCha20-Poly1305).
//!
//! Envelope layout:
//!
//! ```text
//! "SCUM" | version (1 byte) | wrapped key length (u32 BE) | wrapped key
//!        | nonce (12 bytes) | ciphertext || tag (16 bytes)
//! ```
//!
//! The private key file is an ASCII-armored age file encrypted with a
//! passphrase (scrypt), whose plaintext is the age identity.

use age::secrecy::{ExposeSecret, SecretString};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"SCUM";
const VERSION: u8 = 1;
const DATA_KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = MAGIC.len() + 1 + 4;

/// Encrypts with the public key, decrypts with the passphrase-protected private key
pub struct Crypt {
    recipient: age::x25519::Recipient,
    private_key_path: PathBuf,
    rng: SystemRandom,
}

impl Crypt {
    /// Load the public key; the private key is only read when decrypting
    pub fn new(public_key_path: &Path, private_key_path: &Path) -> Result<Self> {
        let recipient = read_recipient(public_key_path)?;

        Ok(Self {
            recipient,
            private_key_path: private_key_path.to_path_buf(),
            rng: SystemRandom::new(),
        })
    }

    /// Encrypt a payload for the configured public key
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut data_key = Zeroizing::new([0u8; DATA_KEY_LEN]);
        self.rng
            .fill(data_key.as_mut())
            .map_err(|_| Error::InvalidKey("failed to generate data key".to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| Error::InvalidKey("failed to generate nonce".to_string()))?;

        let wrapped = self.wrap_key(data_key.as_ref())?;

        let key = LessSafeKey::new(
            UnboundKey::new(&AES_256_GCM, data_key.as_ref())
                .map_err(|_| Error::InvalidKey("failed to create AES-256-GCM key".to_string()))?,
        );
        let mut sealed = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(MAGIC),
            &mut sealed,
        )
        .map_err(|_| Error::InvalidKey("AES-256-GCM encryption failed".to_string()))?;

        let wrapped_len = u32::try_from(wrapped.len())
            .map_err(|_| Error::InvalidKey("wrapped key too large".to_string()))?;

        let mut envelope =
            Vec::with_capacity(HEADER_LEN + wrapped.len() + NONCE_LEN + sealed.len());
        envelope.extend_from_slice(MAGIC);
        envelope.push(VERSION);
        envelope.extend_from_slice(&wrapped_len.to_be_bytes());
        envelope.extend_from_slice(&wrapped);
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&sealed);

        Ok(envelope)
    }

    /// Decrypt an envelope, unlocking the private key with `passphrase`
    ///
    /// The unlocked identity only lives for the duration of this call.
    pub fn decrypt(&self, ciphertext: &[u8], passphrase: &SecretString) -> Result<Vec<u8>> {
        let identity = unlock_identity(&self.private_key_path, passphrase)?;

        let envelope = Envelope::parse(ciphertext)?;
        let data_key = unwrap_key(envelope.wrapped_key, &identity)?;

        let key = LessSafeKey::new(
            UnboundKey::new(&AES_256_GCM, data_key.as_ref())
                .map_err(|_| Error::Decryption("invalid data key".to_string()))?,
        );
        let mut in_out = envelope.sealed.to_vec();
        let plaintext = key
            .open_in_place(
                Nonce::assume_unique_for_key(envelope.nonce),
                Aad::from(MAGIC),
                &mut in_out,
            )
            .map_err(|_| {
                Error::Decryption("payload authentication failed - corrupted or tampered".to_string())
            })?;

        debug!(len = plaintext.len(), "decrypted payload");
        Ok(plaintext.to_vec())
    }

    fn wrap_key(&self, data_key: &[u8]) -> Result<Vec<u8>> {
        let encryptor = age::Encryptor::with_recipients(vec![Box::new(self.recipient.clone())])
            .ok_or_else(|| Error::InvalidKey("no recipient for key wrapping".to_string()))?;

        let mut wrapped = vec![];
        let mut writer = encryptor
            .wrap_output(&mut wrapped)
            .map_err(|e| Error::InvalidKey(format!("key wrapping failed: {}", e)))?;
        writer
            .write_all(data_key)
            .map_err(|e| Error::InvalidKey(format!("key wrapping failed: {}", e)))?;
        writer
            .finish()
            .map_err(|e| Error::InvalidKey(format!("key wrapping failed: {}", e)))?;

        Ok(wrapped)
    }
}

/// Borrowed view of a parsed envelope
struct Envelope<'a> {
    wrapped_key: &'a [u8],
    nonce: [u8; NONCE_LEN],
    sealed: &'a [u8],
}

impl<'a> Envelope<'a> {
    fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_LEN || &data[..MAGIC.len()] != MAGIC {
            return Err(Error::Decryption("not a scum envelope".to_string()));
        }
        if data[MAGIC.len()] != VERSION {
            return Err(Error::Decryption(format!(
                "unsupported envelope version {}",
                data[MAGIC.len()]
            )));
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[MAGIC.len() + 1..HEADER_LEN]);
        let wrapped_len = u32::from_be_bytes(len_bytes) as usize;

        let rest = &data[HEADER_LEN..];
        if rest.len() < wrapped_len + NONCE_LEN + TAG_LEN {
            return Err(Error::Decryption("truncated envelope".to_string()));
        }

        let (wrapped_key, rest) = rest.split_at(wrapped_len);
        let (nonce_slice, sealed) = rest.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_slice);

        Ok(Self {
            wrapped_key,
            nonce,
            sealed,
        })
    }
}

fn unwrap_key(
    wrapped: &[u8],
    identity: &age::x25519::Identity,
) -> Result<Zeroizing<[u8; DATA_KEY_LEN]>> {
    let decryptor = match age::Decryptor::new(wrapped)
        .map_err(|e| Error::Decryption(format!("invalid wrapped key: {}", e)))?
    {
        age::Decryptor::Recipients(d) => d,
        _ => {
            return Err(Error::Decryption(
                "wrapped key is not public-key encrypted".to_string(),
            ))
        }
    };

    let mut reader = decryptor
        .decrypt(std::iter::once(identity as &dyn age::Identity))
        .map_err(|e| Error::Decryption(format!("failed to unwrap data key: {}", e)))?;

    let mut raw = Zeroizing::new(Vec::with_capacity(DATA_KEY_LEN));
    reader
        .read_to_end(&mut raw)
        .map_err(|e| Error::Decryption(format!("failed to unwrap data key: {}", e)))?;

    if raw.len() != DATA_KEY_LEN {
        return Err(Error::Decryption("wrapped data key has wrong length".to_string()));
    }

    let mut key = Zeroizing::new([0u8; DATA_KEY_LEN]);
    key.copy_from_slice(&raw);
    Ok(key)
}

/// Decrypt the private key file with the passphrase and parse the identity
fn unlock_identity(path: &Path, passphrase: &SecretString) -> Result<age::x25519::Identity> {
    let armored = fs::read(path).map_err(|e| {
        Error::Authentication(format!("cannot read private key {}: {}", path.display(), e))
    })?;

    let decryptor = match age::Decryptor::new(age::armor::ArmoredReader::new(&armored[..]))
        .map_err(|e| Error::Authentication(format!("unreadable private key: {}", e)))?
    {
        age::Decryptor::Passphrase(d) => d,
        _ => {
            return Err(Error::Authentication(
                "private key is not passphrase protected".to_string(),
            ))
        }
    };

    let mut reader = decryptor
        .decrypt(passphrase, None)
        .map_err(|_| Error::Authentication("wrong passphrase or corrupt private key".to_string()))?;

    let mut text = Zeroizing::new(String::new());
    reader
        .read_to_string(&mut text)
        .map_err(|_| Error::Authentication("wrong passphrase or corrupt private key".to_string()))?;

    text.trim()
        .parse::<age::x25519::Identity>()
        .map_err(|e| Error::Authentication(format!("invalid private key: {}", e)))
}

fn read_recipient(path: &Path) -> Result<age::x25519::Recipient> {
    let content = fs::read_to_string(path).map_err(|e| {
        Error::InvalidKey(format!("cannot read public key {}: {}", path.display(), e))
    })?;

    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .ok_or_else(|| Error::InvalidKey(format!("{} contains no public key", path.display())))?
        .parse::<age::x25519::Recipient>()
        .map_err(|e| Error::InvalidKey(format!("invalid public key {}: {}", path.display(), e)))
}

/// Key pair generation for `scum init`
pub mod keygen {
    use super::*;
    use age::secrecy::Secret;
    use std::fs::{File, OpenOptions, Permissions};
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    /// Generate a key pair, protecting the private key with `passphrase`
    ///
    /// Returns the public key. Existing key files are never overwritten.
    pub fn generate(
        public_key_path: &Path,
        private_key_path: &Path,
        passphrase: &SecretString,
    ) -> Result<String> {
        for path in [public_key_path, private_key_path] {
            if path.exists() {
                return Err(Error::InvalidKey(format!(
                    "{} already exists, refusing to overwrite",
                    path.display()
                )));
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| key_io(parent, e))?;
            }
        }

        let identity = age::x25519::Identity::generate();
        let public = identity.to_public().to_string();

        let encryptor = age::Encryptor::with_user_passphrase(Secret::new(passphrase.expose_secret().clone()));
        let mut armored = vec![];
        {
            let armor = age::armor::ArmoredWriter::wrap_output(&mut armored, age::armor::Format::AsciiArmor)
                .map_err(|e| key_io(private_key_path, e))?;
            let mut writer = encryptor
                .wrap_output(armor)
                .map_err(|e| key_io(private_key_path, e))?;
            writer
                .write_all(identity.to_string().expose_secret().as_bytes())
                .map_err(|e| key_io(private_key_path, e))?;
            writer
                .finish()
                .and_then(|armor| armor.finish())
                .map_err(|e| key_io(private_key_path, e))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(private_key_path)
            .map_err(|e| key_io(private_key_path, e))?;
        file.write_all(&armored)
            .map_err(|e| key_io(private_key_path, e))?;

        let mut file = File::create(public_key_path).map_err(|e| key_io(public_key_path, e))?;
        writeln!(file, "{}", public).map_err(|e| key_io(public_key_path, e))?;
        fs::set_permissions(public_key_path, Permissions::from_mode(0o644))
            .map_err(|e| key_io(public_key_path, e))?;

        Ok(public)
    }

    fn key_io(path: &Path, e: impl std::fmt::Display) -> Error {
        Error::InvalidKey(format!("{}: {}", path.display(), e))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use age::secrecy::Secret;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    pub(crate) const PASSPHRASE: &str = "correct horse battery staple";

    pub(crate) fn passphrase(value: &str) -> SecretString {
        Secret::new(value.to_string())
    }

    /// Generate a key pair in a temp dir and return a crypt using it
    pub(crate) fn temp_crypt() -> (Crypt, TempDir) {
        let dir = TempDir::new().unwrap();
        let public = dir.path().join("keys/scum.pub");
        let private = dir.path().join("keys/scum.key");
        keygen::generate(&public, &private, &passphrase(PASSPHRASE)).unwrap();
        (Crypt::new(&public, &private).unwrap(), dir)
    }

    #[test]
    fn test_roundtrip_small_empty_and_large() {
        let (crypt, _dir) = temp_crypt();
        let pass = passphrase(PASSPHRASE);

        let large: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        for payload in [b"secret".to_vec(), Vec::new(), large] {
            let ciphertext = crypt.encrypt(&payload).unwrap();
            assert_eq!(crypt.decrypt(&ciphertext, &pass).unwrap(), payload);
        }
    }

    #[test]
    fn test_encryption_is_randomized() {
        let (crypt, _dir) = temp_crypt();

        let a = crypt.encrypt(b"same input").unwrap();
        let b = crypt.encrypt(b"same input").unwrap();
        assert_ne!(a, b);
        assert_eq!(&a[..4], MAGIC);
    }

    #[test]
    fn test_wrong_passphrase_is_authentication_error() {
        let (crypt, _dir) = temp_crypt();

        let ciphertext = crypt.encrypt(b"secret").unwrap();
        let result = crypt.decrypt(&ciphertext, &passphrase("wrong"));
        assert!(matches!(result, Err(Error::Authentication(_))));
    }

    #[test]
    fn test_tampered_ciphertext_is_decryption_error() {
        let (crypt, _dir) = temp_crypt();
        let pass = passphrase(PASSPHRASE);

        let ciphertext = crypt.encrypt(b"do not tamper").unwrap();

        // Payload tag, nonce, wrapped key and header tampering all fail the same way
        let last = ciphertext.len() - 1;
        let nonce_start = last + 1 - TAG_LEN - b"do not tamper".len() - NONCE_LEN;
        for index in [last, nonce_start, HEADER_LEN + 20, 0] {
            let mut tampered = ciphertext.clone();
            tampered[index] ^= 0x01;
            let result = crypt.decrypt(&tampered, &pass);
            assert!(
                matches!(result, Err(Error::Decryption(_))),
                "byte {} not detected",
                index
            );
        }

        let truncated = &ciphertext[..ciphertext.len() - 5];
        assert!(matches!(crypt.decrypt(truncated, &pass), Err(Error::Decryption(_))));
    }

    #[test]
    fn test_ciphertext_for_other_key_pair() {
        let (crypt, _dir) = temp_crypt();
        let (other, _other_dir) = temp_crypt();

        let ciphertext = other.encrypt(b"not for you").unwrap();
        let result = crypt.decrypt(&ciphertext, &passphrase(PASSPHRASE));
        assert!(matches!(result, Err(Error::Decryption(_))));
    }

    #[test]
    fn test_corrupt_private_key_is_authentication_error() {
        let dir = TempDir::new().unwrap();
        let public = dir.path().join("scum.pub");
        let private = dir.path().join("scum.key");
        keygen::generate(&public, &private, &passphrase(PASSPHRASE)).unwrap();

        let crypt = Crypt::new(&public, &private).unwrap();
        let ciphertext = crypt.encrypt(b"secret").unwrap();

        fs::write(&private, b"garbage").unwrap();
        let result = crypt.decrypt(&ciphertext, &passphrase(PASSPHRASE));
        assert!(matches!(result, Err(Error::Authentication(_))));
    }

    #[test]
    fn test_keygen_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let public = dir.path().join("scum.pub");
        let private = dir.path().join("scum.key");

        let key = keygen::generate(&public, &private, &passphrase(PASSPHRASE)).unwrap();
        assert!(key.starts_with("age1"));

        let mode = fs::metadata(&private).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let again = keygen::generate(&public, &private, &passphrase(PASSPHRASE));
        assert!(matches!(again, Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_missing_public_key() {
        let dir = TempDir::new().unwrap();
        let result = Crypt::new(&dir.path().join("missing.pub"), &dir.path().join("missing.key"));
        assert!(matches!(result, Err(Error::InvalidKey(_))));
    }

}
