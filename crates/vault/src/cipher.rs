//! Value encryption
//!
//! Values are age messages (X25519 recipients) wrapped as text:
//!
//! - `encrypted:si:v2:` (current) - the message minus its constant
//!   `age-encryption.org/v1\n-> X25519 ` opening, base64url without padding
//! - `encrypted:si:v1:` (legacy) - the whole message
//! - `es2:` (legacy) - same payload as the current form
//!
//! Payloads decode from either base64 alphabet, padded or not.

use crate::error::VaultError;
use age::x25519;
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

pub const PREFIX_CURRENT: &str = "encrypted:si:v2:";
pub const PREFIX_V1: &str = "encrypted:si:v1:";
pub const PREFIX_COMPACT_LEGACY: &str = "es2:";

const AGE_MAGIC_LINE: &str = "age-encryption.org/v1\n";
const AGE_X25519_STANZA: &str = "-> X25519 ";
const AGE_MAC_LINE: &str = "\n--- ";

/// How a wrapped value is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Current,
    V1,
    CompactLegacy,
}

impl Encoding {
    pub fn detect(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.starts_with(PREFIX_CURRENT) {
            Some(Encoding::Current)
        } else if value.starts_with(PREFIX_V1) {
            Some(Encoding::V1)
        } else if value.starts_with(PREFIX_COMPACT_LEGACY) {
            Some(Encoding::CompactLegacy)
        } else {
            None
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Encoding::Current => PREFIX_CURRENT,
            Encoding::V1 => PREFIX_V1,
            Encoding::CompactLegacy => PREFIX_COMPACT_LEGACY,
        }
    }

    fn is_compact(&self) -> bool {
        !matches!(self, Encoding::V1)
    }
}

/// Whether a raw value token is a wrapped ciphertext
pub fn is_encrypted(value: &str) -> bool {
    Encoding::detect(value).is_some()
}

/// Parse an `age1...` recipient
pub fn parse_recipient(raw: &str) -> Result<x25519::Recipient> {
    raw.trim()
        .parse::<x25519::Recipient>()
        .map_err(|e| anyhow!(VaultError::BadInput(format!("invalid recipient {:?}: {}", raw.trim(), e))))
}

/// Encrypt a value to every recipient, in the current encoding
pub fn encrypt(plaintext: &str, recipients: &[String]) -> Result<String> {
    let parsed = recipients
        .iter()
        .map(|r| parse_recipient(r).map(|r| Box::new(r) as Box<dyn age::Recipient + Send>))
        .collect::<Result<Vec<_>>>()?;

    let encryptor = match age::Encryptor::with_recipients(parsed) {
        Some(e) => e,
        None => bail!(VaultError::NotInitialized(
            "no recipients configured (missing '# si-vault:recipient' header lines)".to_string()
        )),
    };

    let mut message = vec![];
    let mut writer = encryptor
        .wrap_output(&mut message)
        .context("Encryption error")?;
    writer
        .write_all(plaintext.as_bytes())
        .context("Encryption error")?;
    writer.finish().context("Encryption error")?;

    let compact = format!("{}{}", AGE_MAGIC_LINE, AGE_X25519_STANZA);
    Ok(match message.strip_prefix(compact.as_bytes()) {
        Some(rest) => format!("{}{}", PREFIX_CURRENT, URL_SAFE_NO_PAD.encode(rest)),
        None => format!("{}{}", PREFIX_V1, URL_SAFE_NO_PAD.encode(&message)),
    })
}

/// Recover the full age message from a wrapped value
pub fn decode_payload(wrapped: &str) -> Result<Vec<u8>> {
    let wrapped = wrapped.trim();
    let encoding = Encoding::detect(wrapped).ok_or_else(|| {
        anyhow!(
            "value is not {}, {} or {} ciphertext",
            PREFIX_CURRENT,
            PREFIX_COMPACT_LEGACY,
            PREFIX_V1
        )
    })?;

    let payload = wrapped[encoding.prefix().len()..].trim();
    if payload.is_empty() {
        bail!("invalid ciphertext payload: empty");
    }

    let mut last_err = None;
    let mut raw = None;
    for engine in [&URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD_NO_PAD, &STANDARD] {
        match engine.decode(payload) {
            Ok(bytes) => {
                raw = Some(bytes);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let raw = match (raw, last_err) {
        (Some(raw), _) => raw,
        (None, Some(e)) => return Err(e).context("invalid ciphertext payload"),
        (None, None) => bail!("invalid ciphertext payload"),
    };

    if encoding.is_compact() {
        let mut message = Vec::with_capacity(raw.len() + 32);
        message.extend_from_slice(AGE_MAGIC_LINE.as_bytes());
        message.extend_from_slice(AGE_X25519_STANZA.as_bytes());
        message.extend_from_slice(&raw);
        Ok(message)
    } else {
        Ok(raw)
    }
}

/// Structural check without decrypting
pub fn validate(wrapped: &str) -> Result<()> {
    let message = decode_payload(wrapped)?;
    if !message.starts_with(AGE_MAGIC_LINE.as_bytes()) {
        bail!("invalid ciphertext payload: not age format");
    }
    if !message
        .windows(AGE_MAC_LINE.len())
        .any(|w| w == AGE_MAC_LINE.as_bytes())
    {
        bail!("invalid ciphertext payload: missing age MAC stanza");
    }
    Ok(())
}

/// Decrypt a wrapped value, trying each identity in turn
pub fn decrypt(key: &str, wrapped: &str, identities: &[x25519::Identity]) -> Result<String> {
    let message =
        decode_payload(wrapped).with_context(|| format!("decode ciphertext of {}", key))?;

    let mut tried = Vec::with_capacity(identities.len());
    for identity in identities {
        match decrypt_with(&message, identity) {
            Ok(plain) => {
                return String::from_utf8(plain)
                    .with_context(|| format!("decrypted value of {} is not valid UTF-8", key))
            }
            Err(e) => {
                let fp = identity_fingerprint(&identity.to_public().to_string());
                tracing::debug!(key, identity = %fp, error = %e, "identity did not open value");
                tried.push(fp);
            }
        }
    }

    bail!(VaultError::DecryptFailed {
        key: key.to_string(),
        tried,
    })
}

fn decrypt_with(message: &[u8], identity: &x25519::Identity) -> Result<Vec<u8>> {
    let decryptor = match age::Decryptor::new(message).context("Decryption error")? {
        age::Decryptor::Recipients(d) => d,
        _ => bail!("Unexpected passphrase encryption"),
    };

    let mut plain = vec![];
    let mut reader = decryptor
        .decrypt(std::iter::once(identity as &dyn age::Identity))
        .context("Decryption error")?;
    reader.read_to_end(&mut plain).context("Decryption error")?;
    Ok(plain)
}

/// Decrypt with any identity and wrap again for `recipients`
pub fn reencrypt(
    key: &str,
    wrapped: &str,
    identities: &[x25519::Identity],
    recipients: &[String],
) -> Result<String> {
    let plain = decrypt(key, wrapped, identities)?;
    encrypt(&plain, recipients)
}

/// Trust fingerprint of a recipient set: sha256 over the sorted, unique
/// recipients, each followed by a newline
pub fn recipients_fingerprint(recipients: &[String]) -> String {
    let mut set: Vec<&str> = recipients
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .collect();
    set.sort_unstable();
    set.dedup();

    let mut hasher = Sha256::new();
    for r in set {
        hasher.update(r.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Short fingerprint naming an identity by its recipient
pub fn identity_fingerprint(recipient: &str) -> String {
    let digest = Sha256::digest(recipient.trim().as_bytes());
    hex::encode(digest)[..16].to_string()
}
