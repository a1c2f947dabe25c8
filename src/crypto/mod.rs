//! Symmetric stream ciphers applied to upstream connections
//!
//! RC4 keys each direction directly from the secret. DES-CFB and AES-CFB send
//! a random IV ahead of the first ciphertext in each direction.

mod kdf;
mod stream;

pub use kdf::evp_bytes_to_key;
pub use stream::CipherStream;

use std::fmt;
use std::sync::Arc;

use cfb_mode::{BufDecryptor, BufEncryptor};
use cipher::consts::{
    U1, U10, U11, U12, U13, U14, U15, U16, U17, U18, U19, U2, U20, U21, U22, U23, U24, U25, U26,
    U27, U28, U29, U3, U30, U31, U32, U4, U5, U6, U7, U8, U9,
};
use cipher::{BlockCipher, BlockEncryptMut, KeyInit, KeyIvInit, StreamCipher};
use rand::RngCore;
use rc4::Rc4;
use thiserror::Error;

/// Errors raised while building a cipher from an upstream endpoint entry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Unsupported cipher: {0}")]
    Unsupported(String),

    #[error("Invalid key length {len} for {kind}")]
    InvalidKeyLength { kind: CipherKind, len: usize },

    #[error("Invalid IV length {len} for {kind}")]
    InvalidIvLength { kind: CipherKind, len: usize },
}

/// Cipher algorithms accepted in the `crypto` field of an upstream service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    None,
    Rc4,
    DesCfb,
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
}

impl CipherKind {
    pub fn from_name(name: &str) -> Result<Self, CipherError> {
        match name.trim().to_lowercase().as_str() {
            "" | "none" | "plain" => Ok(Self::None),
            "rc4" => Ok(Self::Rc4),
            "des" | "des-cfb" => Ok(Self::DesCfb),
            "aes-128-cfb" | "aes128" | "aes-128" => Ok(Self::Aes128Cfb),
            "aes-192-cfb" | "aes192" | "aes-192" => Ok(Self::Aes192Cfb),
            "aes-256-cfb" | "aes256" | "aes-256" => Ok(Self::Aes256Cfb),
            other => Err(CipherError::Unsupported(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Rc4 => "rc4",
            Self::DesCfb => "des-cfb",
            Self::Aes128Cfb => "aes-128-cfb",
            Self::Aes192Cfb => "aes-192-cfb",
            Self::Aes256Cfb => "aes-256-cfb",
        }
    }

    /// Bytes of IV sent ahead of each direction's ciphertext
    pub fn iv_len(&self) -> usize {
        match self {
            Self::None | Self::Rc4 => 0,
            Self::DesCfb => 8,
            Self::Aes128Cfb | Self::Aes192Cfb | Self::Aes256Cfb => 16,
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Encrypt,
    Decrypt,
}

/// In-place keystream transform for one direction of a connection
pub(crate) type Keystream = Box<dyn FnMut(&mut [u8]) + Send>;

/// A cipher with its key material resolved from the configured secret
#[derive(Clone)]
pub struct Cipher {
    kind: CipherKind,
    key: Arc<[u8]>,
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").field("kind", &self.kind).finish()
    }
}

impl Cipher {
    /// Resolve key material for `kind` from `secret`
    pub fn new(kind: CipherKind, secret: &str) -> Result<Self, CipherError> {
        let secret = secret.as_bytes();
        let key: Vec<u8> = match kind {
            CipherKind::None => Vec::new(),
            CipherKind::Rc4 => {
                if secret.is_empty() || secret.len() > 32 {
                    return Err(CipherError::InvalidKeyLength {
                        kind,
                        len: secret.len(),
                    });
                }
                secret.to_vec()
            }
            CipherKind::DesCfb => {
                if secret.len() < 8 {
                    return Err(CipherError::InvalidKeyLength {
                        kind,
                        len: secret.len(),
                    });
                }
                secret[..8].to_vec()
            }
            CipherKind::Aes128Cfb => evp_bytes_to_key(secret, 16),
            CipherKind::Aes192Cfb => evp_bytes_to_key(secret, 24),
            CipherKind::Aes256Cfb => evp_bytes_to_key(secret, 32),
        };

        Ok(Self {
            kind,
            key: key.into(),
        })
    }

    /// Parse the cipher name and resolve its key in one step
    pub fn from_config(name: &str, secret: &str) -> Result<Self, CipherError> {
        Self::new(CipherKind::from_name(name)?, secret)
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Wrap a connection; the caller must `open` it before writing
    pub fn wrap<S>(&self, inner: S) -> CipherStream<S> {
        CipherStream::new(inner, self.clone())
    }

    pub(crate) fn random_iv(&self) -> Vec<u8> {
        let mut iv = vec![0u8; self.kind.iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);
        iv
    }

    pub(crate) fn keystream(
        &self,
        iv: &[u8],
        direction: Direction,
    ) -> Result<Keystream, CipherError> {
        if iv.len() != self.kind.iv_len() {
            return Err(CipherError::InvalidIvLength {
                kind: self.kind,
                len: iv.len(),
            });
        }

        match self.kind {
            CipherKind::None => Ok(Box::new(|_: &mut [u8]| {})),
            CipherKind::Rc4 => {
                let mut rc4 = rc4_for_key(&self.key).ok_or(CipherError::InvalidKeyLength {
                    kind: self.kind,
                    len: self.key.len(),
                })?;
                Ok(Box::new(move |data: &mut [u8]| rc4.apply_keystream(data)))
            }
            CipherKind::DesCfb => cfb_keystream::<des::Des>(self.kind, &self.key, iv, direction),
            CipherKind::Aes128Cfb => {
                cfb_keystream::<aes::Aes128>(self.kind, &self.key, iv, direction)
            }
            CipherKind::Aes192Cfb => {
                cfb_keystream::<aes::Aes192>(self.kind, &self.key, iv, direction)
            }
            CipherKind::Aes256Cfb => {
                cfb_keystream::<aes::Aes256>(self.kind, &self.key, iv, direction)
            }
        }
    }
}

fn cfb_keystream<C>(
    kind: CipherKind,
    key: &[u8],
    iv: &[u8],
    direction: Direction,
) -> Result<Keystream, CipherError>
where
    C: BlockEncryptMut + BlockCipher + KeyInit + Send + 'static,
{
    let invalid = |_| CipherError::InvalidKeyLength {
        kind,
        len: key.len(),
    };

    match direction {
        Direction::Encrypt => {
            let mut enc = BufEncryptor::<C>::new_from_slices(key, iv).map_err(invalid)?;
            Ok(Box::new(move |data: &mut [u8]| enc.encrypt(data)))
        }
        Direction::Decrypt => {
            let mut dec = BufDecryptor::<C>::new_from_slices(key, iv).map_err(invalid)?;
            Ok(Box::new(move |data: &mut [u8]| dec.decrypt(data)))
        }
    }
}

macro_rules! rc4_by_len {
    ($key:expr; $($len:literal => $size:ty),+ $(,)?) => {
        match $key.len() {
            $(
                $len => Rc4::<$size>::new_from_slice($key)
                    .ok()
                    .map(|c| Box::new(c) as Box<dyn StreamCipher + Send>),
            )+
            _ => None,
        }
    };
}

/// RC4 is generic over its key size, so dispatch on the runtime length
fn rc4_for_key(key: &[u8]) -> Option<Box<dyn StreamCipher + Send>> {
    rc4_by_len!(key;
        1 => U1, 2 => U2, 3 => U3, 4 => U4, 5 => U5, 6 => U6, 7 => U7, 8 => U8,
        9 => U9, 10 => U10, 11 => U11, 12 => U12, 13 => U13, 14 => U14, 15 => U15, 16 => U16,
        17 => U17, 18 => U18, 19 => U19, 20 => U20, 21 => U21, 22 => U22, 23 => U23, 24 => U24,
        25 => U25, 26 => U26, 27 => U27, 28 => U28, 29 => U29, 30 => U30, 31 => U31, 32 => U32,
    )
}
