//! Plugin-scoped symmetric encryption
//!
//! Every plugin gets its own AES-256-GCM key derived from the host master key
//! with HKDF-SHA256 (`info = "plugin:<id>"`). Ciphertext uses the versioned
//! text format `v1:{nonce_b64}:{ciphertext_b64}`.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{PluginResult, PluginRuntimeError};

const KEY_VERSION: u32 = 1;
const HKDF_SALT: &[u8] = b"plugin-runtime-core/v1";

/// Host master key, wiped on drop
#[derive(Clone)]
pub struct MasterKey(Zeroizing<[u8; 32]>);

impl MasterKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self(Zeroizing::new(key))
    }

    /// Random per-process key; ciphertext does not survive a restart
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    pub fn from_base64(encoded: &str) -> PluginResult<Self> {
        let bytes = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|_| PluginRuntimeError::ConfigurationError("master key is not valid base64".into()))?,
        );
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            PluginRuntimeError::ConfigurationError(format!(
                "master key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(key))
    }

    /// Cipher bound to one plugin
    pub fn cipher_for(&self, plugin_id: &str) -> PluginResult<PluginCipher> {
        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), self.0.as_slice());
        let mut okm = Zeroizing::new([0u8; 32]);
        hkdf.expand(format!("plugin:{plugin_id}").as_bytes(), okm.as_mut_slice())
            .map_err(|e| PluginRuntimeError::Crypto(format!("key derivation failed: {e}")))?;
        let cipher = Aes256Gcm::new_from_slice(okm.as_slice())
            .map_err(|_| PluginRuntimeError::Crypto("invalid derived key".into()))?;
        Ok(PluginCipher { cipher })
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// AES-256-GCM cipher keyed for a single plugin
#[derive(Clone)]
pub struct PluginCipher {
    cipher: Aes256Gcm,
}

impl PluginCipher {
    pub fn encrypt(&self, plaintext: &str) -> PluginResult<String> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| PluginRuntimeError::Crypto("encryption failed".into()))?;

        Ok(format!(
            "v{}:{}:{}",
            KEY_VERSION,
            BASE64.encode(nonce_bytes),
            BASE64.encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, encrypted: &str) -> PluginResult<String> {
        let invalid = || PluginRuntimeError::Crypto("invalid ciphertext format".into());

        let mut parts = encrypted.splitn(3, ':');
        let (Some(version), Some(nonce_b64), Some(ciphertext_b64)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(invalid)?;
        if version != KEY_VERSION {
            return Err(PluginRuntimeError::Crypto(format!(
                "unsupported key version {version}"
            )));
        }

        let nonce_bytes = BASE64.decode(nonce_b64).map_err(|_| invalid())?;
        if nonce_bytes.len() != 12 {
            return Err(invalid());
        }
        let ciphertext = BASE64.decode(ciphertext_b64).map_err(|_| invalid())?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| PluginRuntimeError::Crypto("decryption failed".into()))?;
        String::from_utf8(plaintext)
            .map_err(|_| PluginRuntimeError::Crypto("plaintext is not UTF-8".into()))
    }
}
