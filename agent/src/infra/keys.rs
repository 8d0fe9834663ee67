//! Static key material for the encrypted coordinator channel.
//!
//! Keys are provisioned out of band as base64 text files, one Curve25519 key
//! per file, under `<work_dir>/certificates/`.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hive_common::channel::{KEY_LEN, NOISE_PATTERN};

use crate::domain::KeyError;

/// Agent static secret, relative to the working directory.
pub const AGENT_SECRET_FILE: &str = "certificates/private_keys/agent.key";

/// Coordinator static public key, relative to the working directory.
pub const SERVER_PUBLIC_FILE: &str = "certificates/public_keys/server.key";

/// The agent's own static secret plus the coordinator's known public key.
#[derive(Clone)]
pub struct ChannelKeys {
    secret: [u8; KEY_LEN],
    server_public: [u8; KEY_LEN],
}

impl ChannelKeys {
    #[must_use]
    pub fn new(secret: [u8; KEY_LEN], server_public: [u8; KEY_LEN]) -> Self {
        Self {
            secret,
            server_public,
        }
    }

    /// Load both keys from their provisioned files under `work_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if either file is missing, not base64, or the wrong
    /// length.
    pub fn load(work_dir: &Path) -> Result<Self> {
        let secret = read_key(&work_dir.join(AGENT_SECRET_FILE))?;
        let server_public = read_key(&work_dir.join(SERVER_PUBLIC_FILE))?;
        Ok(Self::new(secret, server_public))
    }

    #[must_use]
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    #[must_use]
    pub fn server_public(&self) -> &[u8] {
        &self.server_public
    }
}

impl fmt::Debug for ChannelKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelKeys")
            .field("secret", &"<redacted>")
            .field("server_public", &encode_key(&self.server_public))
            .finish()
    }
}

/// A freshly generated static keypair.
#[derive(Clone)]
pub struct StaticKeypair {
    pub secret: [u8; KEY_LEN],
    pub public: [u8; KEY_LEN],
}

/// Generate a Curve25519 keypair suitable for the channel handshake.
///
/// # Errors
///
/// Returns an error if the crypto backend cannot produce a keypair.
pub fn generate_keypair() -> Result<StaticKeypair> {
    let params = NOISE_PATTERN.parse().context("parsing noise pattern")?;
    let pair = snow::Builder::new(params)
        .generate_keypair()
        .context("generating keypair")?;
    Ok(StaticKeypair {
        secret: fixed(&pair.private, "<generated>")?,
        public: fixed(&pair.public, "<generated>")?,
    })
}

/// Encode a key the way it is stored on disk.
#[must_use]
pub fn encode_key(key: &[u8]) -> String {
    STANDARD.encode(key)
}

/// Decode one on-disk key. `source` names the file in errors.
///
/// # Errors
///
/// Returns [`KeyError`] for bad base64 or a wrong key length.
pub fn decode_key(text: &str, source: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let raw = STANDARD
        .decode(text.trim())
        .map_err(|_| KeyError::Encoding {
            path: source.to_string(),
        })?;
    fixed(&raw, source)
}

fn fixed(raw: &[u8], source: &str) -> Result<[u8; KEY_LEN], KeyError> {
    raw.try_into().map_err(|_| KeyError::Length {
        path: source.to_string(),
        len: raw.len(),
        expected: KEY_LEN,
    })
}

fn read_key(path: &Path) -> Result<[u8; KEY_LEN]> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading key file {}", path.display()))?;
    Ok(decode_key(&text, &path.display().to_string())?)
}
