//! Predicate key types and predicate definitions.
//!
//! The set of key categories is closed: every [`PsfKey`] reports a
//! [`KeyKind`] with a fixed encoded width, validated once at registration.
//! Query and maintenance paths only ever see the encoded bytes.

use crate::encoding::keycode;
use crate::error::Result;
use crate::Error;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Upper bound on the encoded size of one key-pointer key.
pub const MAX_KEY_SIZE: usize = 256;

/// Supported key layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Boolean,
    Unsigned(u8),
    Signed(u8),
    Char,
    FixedBytes(u16),
}

impl KeyKind {
    /// Payload width in bytes, excluding the type prefix.
    pub fn width(&self) -> usize {
        match self {
            KeyKind::Boolean => 1,
            KeyKind::Unsigned(w) | KeyKind::Signed(w) => *w as usize,
            KeyKind::Char => 4,
            KeyKind::FixedBytes(w) => *w as usize,
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.width() + 1
    }

    /// Layout check performed at registration.
    pub fn validate(&self) -> Result<()> {
        match self {
            KeyKind::Unsigned(w) | KeyKind::Signed(w) if !matches!(w, 1 | 2 | 4 | 8) => Err(
                Error::InvalidArgument(format!("unsupported integer key width {}", w)),
            ),
            KeyKind::FixedBytes(0) => Err(Error::InvalidArgument(
                "zero-sized key type is not supported".to_string(),
            )),
            _ if self.encoded_len() > MAX_KEY_SIZE => Err(Error::InvalidArgument(format!(
                "key size {} exceeds the maximum of {} bytes",
                self.encoded_len(),
                MAX_KEY_SIZE
            ))),
            _ => Ok(()),
        }
    }
}

/// A fixed-layout key produced by a predicate.
pub trait PsfKey: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    const KIND: KeyKind;

    /// Order-preserving encoding of exactly `KIND.encoded_len()` bytes.
    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Result<Self>;
}

impl PsfKey for bool {
    const KIND: KeyKind = KeyKind::Boolean;

    fn encode(&self) -> Vec<u8> {
        keycode::encode_boolean(*self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        keycode::decode_boolean(bytes)
    }
}

impl PsfKey for char {
    const KIND: KeyKind = KeyKind::Char;

    fn encode(&self) -> Vec<u8> {
        keycode::encode_char(*self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        keycode::decode_char(bytes)
    }
}

macro_rules! unsigned_key {
    ($($t:ty),*) => {$(
        impl PsfKey for $t {
            const KIND: KeyKind = KeyKind::Unsigned(std::mem::size_of::<$t>() as u8);

            fn encode(&self) -> Vec<u8> {
                keycode::encode_unsigned(*self as u64, std::mem::size_of::<$t>())
            }

            fn decode(bytes: &[u8]) -> Result<Self> {
                let value = keycode::decode_unsigned(bytes, std::mem::size_of::<$t>())?;
                <$t>::try_from(value)
                    .map_err(|_| Error::InvalidOperation(format!("key {} out of range", value)))
            }
        }
    )*};
}

macro_rules! signed_key {
    ($($t:ty),*) => {$(
        impl PsfKey for $t {
            const KIND: KeyKind = KeyKind::Signed(std::mem::size_of::<$t>() as u8);

            fn encode(&self) -> Vec<u8> {
                keycode::encode_signed(*self as i64, std::mem::size_of::<$t>())
            }

            fn decode(bytes: &[u8]) -> Result<Self> {
                let value = keycode::decode_signed(bytes, std::mem::size_of::<$t>())?;
                <$t>::try_from(value)
                    .map_err(|_| Error::InvalidOperation(format!("key {} out of range", value)))
            }
        }
    )*};
}

unsigned_key!(u8, u16, u32, u64);
signed_key!(i8, i16, i32, i64);

impl<const N: usize> PsfKey for [u8; N] {
    const KIND: KeyKind = KeyKind::FixedBytes(if N > u16::MAX as usize {
        u16::MAX
    } else {
        N as u16
    });

    fn encode(&self) -> Vec<u8> {
        keycode::encode_fixed_bytes(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let raw = keycode::decode_fixed_bytes(bytes, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&raw);
        Ok(out)
    }
}

/// Type-erased predicate as stored in a group.
pub(crate) trait Predicate<D>: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> KeyKind;

    /// Evaluate the predicate and encode its key.
    fn evaluate(&self, data: &D) -> Option<Vec<u8>>;
}

pub(crate) struct PredicateFn<D, K, F> {
    name: String,
    f: F,
    _marker: PhantomData<fn(&D) -> K>,
}

impl<D, K, F> PredicateFn<D, K, F>
where
    K: PsfKey,
    F: Fn(&D) -> Option<K> + Send + Sync + 'static,
{
    pub(crate) fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _marker: PhantomData,
        }
    }
}

impl<D, K, F> Predicate<D> for PredicateFn<D, K, F>
where
    K: PsfKey,
    F: Fn(&D) -> Option<K> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> KeyKind {
        K::KIND
    }

    fn evaluate(&self, data: &D) -> Option<Vec<u8>> {
        (self.f)(data).map(|key| key.encode())
    }
}

/// Handle to a registered predicate, used to compose queries.
pub struct Psf<K> {
    pub(crate) name: Arc<str>,
    pub(crate) group_id: u64,
    pub(crate) ordinal: u8,
    pub(crate) owner: Arc<()>,
    _key: PhantomData<fn() -> K>,
}

impl<K: PsfKey> Psf<K> {
    pub(crate) fn new(name: Arc<str>, group_id: u64, ordinal: u8, owner: Arc<()>) -> Self {
        Self {
            name,
            group_id,
            ordinal,
            owner,
            _key: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    pub fn ordinal(&self) -> u8 {
        self.ordinal
    }
}

impl<K> Clone for Psf<K> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            group_id: self.group_id,
            ordinal: self.ordinal,
            owner: self.owner.clone(),
            _key: PhantomData,
        }
    }
}

impl<K> fmt::Debug for Psf<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Psf")
            .field("name", &self.name)
            .field("group_id", &self.group_id)
            .field("ordinal", &self.ordinal)
            .finish()
    }
}
