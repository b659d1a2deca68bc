//! password storage schemes
//!
//! stored values use the usual `{SCHEME}base64(digest || salt)` form; values
//! without a scheme prefix are compared as clear text

use openssl::base64::{decode_block, encode_block};
use serde::Deserialize;
use std::fmt::Display;
use thiserror::Error;

/// length of the random salt appended to salted digests
const SALT_LENGTH: usize = 8;

/// errors encoding or checking stored passwords
#[derive(Debug, Error)]
pub enum PasswordStorageError {
    /// an error in the openssl library
    #[error("openssl error: {0}")]
    OpenSSLError(#[from] openssl::error::ErrorStack),
    /// the scheme prefix of a stored value is not supported
    #[error("Unknown password storage scheme {0}")]
    UnknownScheme(String),
    /// the stored value does not decode to digest and salt
    #[error("Stored {0} password value is malformed")]
    Malformed(StorageScheme),
}

/// supported password storage schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageScheme {
    /// the password as is
    Clear,
    /// salted SHA-1
    Ssha,
    /// salted SHA-256
    Ssha256,
    /// salted SHA-512
    Ssha512,
}

impl StorageScheme {
    /// the scheme name as used in the `{SCHEME}` prefix
    pub fn name(self) -> &'static str {
        match self {
            StorageScheme::Clear => "CLEAR",
            StorageScheme::Ssha => "SSHA",
            StorageScheme::Ssha256 => "SSHA256",
            StorageScheme::Ssha512 => "SSHA512",
        }
    }

    /// the scheme for a prefix name, case-insensitive
    pub fn from_name(name: &str) -> Option<Self> {
        [
            StorageScheme::Clear,
            StorageScheme::Ssha,
            StorageScheme::Ssha256,
            StorageScheme::Ssha512,
        ]
        .into_iter()
        .find(|s| s.name().eq_ignore_ascii_case(name))
    }

    /// digest of the data, `None` for the clear scheme
    fn digest(self, data: &[u8]) -> Option<Vec<u8>> {
        match self {
            StorageScheme::Clear => None,
            StorageScheme::Ssha => Some(openssl::sha::sha1(data).to_vec()),
            StorageScheme::Ssha256 => Some(openssl::sha::sha256(data).to_vec()),
            StorageScheme::Ssha512 => Some(openssl::sha::sha512(data).to_vec()),
        }
    }

    /// length of the digest in bytes
    fn digest_length(self) -> usize {
        match self {
            StorageScheme::Clear => 0,
            StorageScheme::Ssha => 20,
            StorageScheme::Ssha256 => 32,
            StorageScheme::Ssha512 => 64,
        }
    }
}

impl Display for StorageScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// digest password and salt
fn salted_digest(scheme: StorageScheme, clear: &[u8], salt: &[u8]) -> Option<Vec<u8>> {
    let mut data = Vec::with_capacity(clear.len() + salt.len());
    data.extend_from_slice(clear);
    data.extend_from_slice(salt);
    scheme.digest(&data)
}

/// compare two byte strings in constant time
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && openssl::memcmp::eq(a, b)
}

/// encode a clear text password for storage
pub fn encode_password(scheme: StorageScheme, clear: &str) -> Result<String, PasswordStorageError> {
    let mut salt = [0u8; SALT_LENGTH];
    openssl::rand::rand_bytes(&mut salt)?;
    match salted_digest(scheme, clear.as_bytes(), &salt) {
        None => Ok(format!("{{{}}}{}", scheme.name(), clear)),
        Some(mut digest) => {
            digest.extend_from_slice(&salt);
            Ok(format!("{{{}}}{}", scheme.name(), encode_block(&digest)))
        }
    }
}

/// split a stored value into scheme and encoded part
fn split_scheme(stored: &str) -> Result<(StorageScheme, &str), PasswordStorageError> {
    let Some(rest) = stored.strip_prefix('{') else {
        return Ok((StorageScheme::Clear, stored));
    };
    let Some((name, encoded)) = rest.split_once('}') else {
        return Ok((StorageScheme::Clear, stored));
    };
    let scheme = StorageScheme::from_name(name)
        .ok_or_else(|| PasswordStorageError::UnknownScheme(name.to_string()))?;
    Ok((scheme, encoded))
}

/// check a clear text password against a stored value
pub fn password_matches(clear: &str, stored: &str) -> Result<bool, PasswordStorageError> {
    let (scheme, encoded) = split_scheme(stored)?;
    if scheme == StorageScheme::Clear {
        return Ok(constant_time_eq(clear.as_bytes(), encoded.as_bytes()));
    }
    let decoded = decode_block(encoded).map_err(|_| PasswordStorageError::Malformed(scheme))?;
    if decoded.len() <= scheme.digest_length() {
        return Err(PasswordStorageError::Malformed(scheme));
    }
    let (digest, salt) = decoded.split_at(scheme.digest_length());
    let computed = salted_digest(scheme, clear.as_bytes(), salt).unwrap_or_default();
    Ok(constant_time_eq(digest, &computed))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn salted_schemes_verify() {
        for scheme in [
            StorageScheme::Ssha,
            StorageScheme::Ssha256,
            StorageScheme::Ssha512,
        ] {
            let stored = encode_password(scheme, "secret").unwrap();
            assert!(stored.starts_with(&format!("{{{}}}", scheme.name())));
            assert!(password_matches("secret", &stored).unwrap());
            assert!(!password_matches("Secret", &stored).unwrap());
        }
    }

    #[test]
    fn salts_differ() {
        let a = encode_password(StorageScheme::Ssha256, "secret").unwrap();
        let b = encode_password(StorageScheme::Ssha256, "secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn clear_values() {
        assert!(password_matches("secret", "secret").unwrap());
        assert!(password_matches("secret", "{CLEAR}secret").unwrap());
        assert!(!password_matches("secret", "{clear}other").unwrap());
    }

    #[test]
    fn unknown_and_malformed() {
        assert!(matches!(
            password_matches("secret", "{MD4}abc"),
            Err(PasswordStorageError::UnknownScheme(_))
        ));
        assert!(matches!(
            password_matches("secret", "{SSHA}AAAA"),
            Err(PasswordStorageError::Malformed(StorageScheme::Ssha))
        ));
    }
}
