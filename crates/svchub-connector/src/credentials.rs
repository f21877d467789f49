//! Credential generation and service-specific password hashing.
//!
//! Every scheme here reproduces, byte for byte, the format the external
//! product's own login code verifies against. None of them may be
//! "upgraded" without breaking logins on the far side.

use md5::Md5;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{ConnectorError, ConnectorResult};
use crate::types::ServiceKind;

/// Default length of generated passwords.
pub const DEFAULT_PASSWORD_LENGTH: usize = 16;

/// Default bcrypt work factor.
pub const DEFAULT_BCRYPT_COST: u32 = 13;

/// Default phpass iteration count, as a power of two.
pub const DEFAULT_PHPASS_ROUNDS: u8 = 19;

/// Length of the salt embedded in a bcrypt hash string.
pub const BCRYPT_SALT_LENGTH: usize = 22;

/// Offset of the salt in `$2y$NN$<salt><digest>`.
const BCRYPT_SALT_OFFSET: usize = 7;

/// Alphabet used by phpass for salts and digests.
const ITOA64: &[u8; 64] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Password hashing scheme required by an external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum HashScheme {
    /// bcrypt, emitted with the `$2y$` prefix.
    Bcrypt { cost: u32 },
    /// phpBB3 portable hash (`$H$`, iterated MD5).
    Phpass { rounds_log2: u8 },
    /// Hex SHA1 of the lower-cased username followed by the password.
    Sha1UsernamePassword,
    /// Hex SHA1 of the password alone.
    Sha1Password,
    /// Hex MD5 of the password, for legacy board APIs.
    Md5Password,
}

impl HashScheme {
    /// The scheme a service kind uses with default parameters, if any.
    #[must_use]
    pub fn for_kind(kind: ServiceKind) -> Option<HashScheme> {
        match kind {
            ServiceKind::Phpbb3 => Some(HashScheme::Phpass {
                rounds_log2: DEFAULT_PHPASS_ROUNDS,
            }),
            ServiceKind::Smf => Some(HashScheme::Sha1UsernamePassword),
            ServiceKind::Ips4 => Some(HashScheme::Bcrypt {
                cost: DEFAULT_BCRYPT_COST,
            }),
            ServiceKind::Mumble => Some(HashScheme::Sha1Password),
            ServiceKind::Discord => None,
        }
    }

    /// Short name stored alongside hashes that carry no self-description.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            HashScheme::Bcrypt { .. } => "bcrypt",
            HashScheme::Phpass { .. } => "phpass",
            HashScheme::Sha1UsernamePassword => "sha1-username",
            HashScheme::Sha1Password => "sha1",
            HashScheme::Md5Password => "md5",
        }
    }
}

/// An encoded password hash and the salt some stores keep in a separate column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHash {
    /// Full encoded hash as the external store expects it.
    pub hash: String,
    /// Salt, for stores that keep it in its own column.
    pub salt: Option<String>,
}

impl PasswordHash {
    /// First five characters, safe to put in logs.
    #[must_use]
    pub fn log_prefix(&self) -> &str {
        let end = self.hash.len().min(5);
        self.hash.get(..end).unwrap_or_default()
    }
}

/// Random credential generation and hash dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialGenerator;

impl CredentialGenerator {
    /// Generate a random password of letters and digits from the OS CSPRNG.
    #[must_use]
    pub fn generate_password(length: usize) -> String {
        OsRng
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect()
    }

    /// Generate a throwaway username: `prefix` followed by `length`
    /// lower-case letters and digits.
    #[must_use]
    pub fn generate_username(prefix: &str, length: usize) -> String {
        let suffix: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        format!("{prefix}{suffix}")
    }

    /// Generate a 16 character password by hex-encoding 8 random bytes.
    ///
    /// Used by the board connectors, whose stores have always been fed
    /// passwords in this form.
    #[must_use]
    pub fn generate_legacy_password() -> String {
        let mut bytes = [0u8; 8];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Hash `plaintext` with the given scheme.
    ///
    /// `username` only participates for [`HashScheme::Sha1UsernamePassword`].
    pub fn hash_for(
        scheme: HashScheme,
        username: &str,
        plaintext: &str,
    ) -> ConnectorResult<PasswordHash> {
        match scheme {
            HashScheme::Bcrypt { cost } => {
                let hash = bcrypt::hash_with_result(plaintext, cost)
                    .map_err(|e| ConnectorError::Hashing {
                        message: format!("bcrypt: {e}"),
                    })?
                    .format_for_version(bcrypt::Version::TwoY);
                let salt = bcrypt_salt(&hash)
                    .ok_or_else(|| ConnectorError::Hashing {
                        message: "bcrypt produced an unexpected layout".to_string(),
                    })?
                    .to_string();
                Ok(PasswordHash {
                    hash,
                    salt: Some(salt),
                })
            }
            HashScheme::Phpass { rounds_log2 } => {
                if !(7..=30).contains(&rounds_log2) {
                    return Err(ConnectorError::Hashing {
                        message: format!("phpass rounds {rounds_log2} outside 7..=30"),
                    });
                }
                let mut raw = [0u8; 6];
                OsRng.fill_bytes(&mut raw);
                let salt = encode64(&raw);
                Ok(PasswordHash {
                    hash: phpass_hash(plaintext, &salt, rounds_log2),
                    salt: None,
                })
            }
            HashScheme::Sha1UsernamePassword => Ok(PasswordHash {
                hash: sha1_hex(format!("{}{}", username.to_lowercase(), plaintext).as_bytes()),
                salt: None,
            }),
            HashScheme::Sha1Password => Ok(PasswordHash {
                hash: sha1_hex(plaintext.as_bytes()),
                salt: None,
            }),
            HashScheme::Md5Password => Ok(PasswordHash {
                hash: hex::encode(Md5::digest(plaintext.as_bytes())),
                salt: None,
            }),
        }
    }

    /// Check `plaintext` against a stored hash.
    pub fn verify(
        scheme: HashScheme,
        username: &str,
        plaintext: &str,
        stored: &str,
    ) -> ConnectorResult<bool> {
        match scheme {
            HashScheme::Bcrypt { .. } => {
                bcrypt::verify(plaintext, stored).map_err(|e| ConnectorError::Hashing {
                    message: format!("bcrypt: {e}"),
                })
            }
            HashScheme::Phpass { .. } => Ok(phpass_verify(plaintext, stored)),
            HashScheme::Sha1UsernamePassword => Ok(sha1_hex(
                format!("{}{}", username.to_lowercase(), plaintext).as_bytes(),
            ) == stored),
            HashScheme::Sha1Password => Ok(sha1_hex(plaintext.as_bytes()) == stored),
            HashScheme::Md5Password => {
                Ok(hex::encode(Md5::digest(plaintext.as_bytes())) == stored)
            }
        }
    }
}

/// Extract the 22 character salt from a `$2?$NN$` bcrypt hash.
///
/// The salt sits at a fixed offset; splitting on `$` would also work for
/// well-formed input but accepts garbage the stores reject.
#[must_use]
pub fn bcrypt_salt(hash: &str) -> Option<&str> {
    let bytes = hash.as_bytes();
    if !hash.is_ascii() || bytes.len() < BCRYPT_SALT_OFFSET + BCRYPT_SALT_LENGTH {
        return None;
    }
    if bytes[0] != b'$' || bytes[1] != b'2' || bytes[3] != b'$' || bytes[6] != b'$' {
        return None;
    }
    if !bytes[4].is_ascii_digit() || !bytes[5].is_ascii_digit() {
        return None;
    }
    hash.get(BCRYPT_SALT_OFFSET..BCRYPT_SALT_OFFSET + BCRYPT_SALT_LENGTH)
}

fn sha1_hex(input: &[u8]) -> String {
    hex::encode(Sha1::digest(input))
}

fn phpass_hash(password: &str, salt: &str, rounds_log2: u8) -> String {
    let count = 1u64 << rounds_log2;
    let mut digest = Md5::new()
        .chain_update(salt.as_bytes())
        .chain_update(password.as_bytes())
        .finalize();
    for _ in 0..count {
        digest = Md5::new()
            .chain_update(digest.as_slice())
            .chain_update(password.as_bytes())
            .finalize();
    }
    format!(
        "$H${}{}{}",
        ITOA64[usize::from(rounds_log2)] as char,
        salt,
        encode64(digest.as_slice())
    )
}

fn phpass_verify(password: &str, stored: &str) -> bool {
    if stored.len() != 34 || !stored.is_ascii() {
        return false;
    }
    if !(stored.starts_with("$H$") || stored.starts_with("$P$")) {
        return false;
    }
    let Some(rounds_log2) = ITOA64
        .iter()
        .position(|c| *c == stored.as_bytes()[3])
        .and_then(|p| u8::try_from(p).ok())
    else {
        return false;
    };
    if !(7..=30).contains(&rounds_log2) {
        return false;
    }
    let salt = &stored[4..12];
    let computed = phpass_hash(password, salt, rounds_log2);
    // The identifier letter is not part of the digest input.
    computed[3..] == stored[3..]
}

/// phpass' own base64 variant (little-endian, `./0-9A-Za-z`).
fn encode64(input: &[u8]) -> String {
    let count = input.len();
    let mut out = String::with_capacity(count.div_ceil(3) * 4);
    let mut i = 0;
    while i < count {
        let mut value = u32::from(input[i]);
        i += 1;
        out.push(ITOA64[(value & 0x3f) as usize] as char);
        if i < count {
            value |= u32::from(input[i]) << 8;
        }
        out.push(ITOA64[((value >> 6) & 0x3f) as usize] as char);
        if i >= count {
            break;
        }
        i += 1;
        if i < count {
            value |= u32::from(input[i]) << 16;
        }
        out.push(ITOA64[((value >> 12) & 0x3f) as usize] as char);
        if i >= count {
            break;
        }
        i += 1;
        out.push(ITOA64[((value >> 18) & 0x3f) as usize] as char);
    }
    out
}
