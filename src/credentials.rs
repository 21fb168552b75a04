use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::info;

use crate::errors::{AppError, AppResult};

const KEY_SUFFIX_CHARS: usize = 6;

/// API credentials for the two remote services. The backing file is
/// base64-obfuscated JSON, not encrypted storage; values are held as
/// `SecretString` and never logged in full.
#[derive(Clone, Debug)]
pub struct Credentials {
    google: SecretString,
    openai: SecretString,
}

#[derive(Deserialize)]
struct EncodedCredentials {
    google: String,
    openai: String,
}

impl Credentials {
    pub fn load(path: &Path) -> AppResult<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            AppError::Config(format!(
                "credentials file {} could not be read: {err}",
                path.display()
            ))
        })?;
        let encoded: EncodedCredentials = serde_json::from_str(&contents)
            .map_err(|err| AppError::Config(format!("invalid credentials file: {err}")))?;

        let credentials = Self {
            google: decode_value("google", &encoded.google)?,
            openai: decode_value("openai", &encoded.openai)?,
        };
        info!(
            google = %key_identifier(&credentials.google),
            openai = %key_identifier(&credentials.openai),
            "loaded credentials from {}",
            path.display()
        );
        Ok(credentials)
    }

    pub fn google(&self) -> &SecretString {
        &self.google
    }

    pub fn openai(&self) -> &SecretString {
        &self.openai
    }
}

fn decode_value(name: &str, encoded: &str) -> AppResult<SecretString> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|err| AppError::Config(format!("credential '{name}' is not valid base64: {err}")))?;
    let value = String::from_utf8(bytes)
        .map_err(|err| AppError::Config(format!("credential '{name}' is not valid UTF-8: {err}")))?;
    if value.trim().is_empty() {
        return Err(AppError::Config(format!("credential '{name}' is empty")));
    }
    Ok(SecretString::new(value.into()))
}

/// Truncated suffix plus an MD5 fingerprint; safe for logs and stable
/// enough to key the usage ledger across runs.
pub fn key_identifier(secret: &SecretString) -> String {
    let raw = secret.expose_secret();
    let start = raw
        .char_indices()
        .rev()
        .take(KEY_SUFFIX_CHARS)
        .last()
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    format!("....{} ( MD5 {:x})", &raw[start..], md5::compute(raw.as_bytes()))
}
