// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Size-prefixed wrapper around a structured value
//!
//! A [`Tpm2b`] holds either the wire bytes of a structure, its decoded value,
//! or both. Each side is produced lazily from the other and cached until the
//! value is replaced with [`Tpm2b::set`].

use std::cell::OnceCell;
use std::fmt;

use crate::error::{Error, Result};
use crate::marshal::{decode_exact, CommandBuffer, Marshal, ResponseBuffer, Unmarshal};

pub struct Tpm2b<T> {
    raw: OnceCell<Vec<u8>>,
    decoded: OnceCell<T>,
}

impl<T> Tpm2b<T> {
    /// Wrap a structured value
    pub fn new(value: T) -> Self {
        Self {
            raw: OnceCell::new(),
            decoded: OnceCell::from(value),
        }
    }

    /// Wrap wire bytes without decoding them
    pub fn from_raw(bytes: Vec<u8>) -> Self {
        Self {
            raw: OnceCell::from(bytes),
            decoded: OnceCell::new(),
        }
    }

    /// Replace the contents. Any cached encoding is discarded.
    pub fn set(&mut self, value: T) {
        self.raw = OnceCell::new();
        self.decoded = OnceCell::from(value);
    }
}

impl<T: Unmarshal> Tpm2b<T> {
    /// The decoded value, decoding the wire bytes on first access
    pub fn contents(&self) -> Result<&T> {
        if let Some(v) = self.decoded.get() {
            return Ok(v);
        }
        let raw = self.raw.get().ok_or(Error::InvalidValue {
            what: "empty sized structure",
            value: 0,
        })?;
        let value = decode_exact(raw, std::any::type_name::<T>())?;
        Ok(self.decoded.get_or_init(|| value))
    }

    pub fn into_contents(self) -> Result<T> {
        self.contents()?;
        self.decoded.into_inner().ok_or(Error::InvalidValue {
            what: "empty sized structure",
            value: 0,
        })
    }
}

impl<T: Marshal> Tpm2b<T> {
    /// The wire bytes (without size prefix), encoding on first access
    pub fn bytes(&self) -> Result<&[u8]> {
        if let Some(raw) = self.raw.get() {
            return Ok(raw);
        }
        let encoded = match self.decoded.get() {
            Some(v) => v.to_bytes()?,
            None => Vec::new(),
        };
        Ok(self.raw.get_or_init(|| encoded))
    }
}

impl<T> Default for Tpm2b<T> {
    fn default() -> Self {
        Self::from_raw(Vec::new())
    }
}

impl<T: Clone> Clone for Tpm2b<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            decoded: self.decoded.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Tpm2b<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.decoded.get(), self.raw.get()) {
            (Some(v), _) => f.debug_tuple("Tpm2b").field(v).finish(),
            (None, Some(raw)) => f.debug_tuple("Tpm2b").field(&hex::encode(raw)).finish(),
            (None, None) => f.write_str("Tpm2b(<empty>)"),
        }
    }
}

/// Two boxes are equal when they encode to the same bytes
impl<T: Marshal> PartialEq for Tpm2b<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self.bytes(), other.bytes()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl<T: Marshal> Marshal for Tpm2b<T> {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_tpm2b(self.bytes()?)
    }
}

impl<T> Unmarshal for Tpm2b<T> {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_tpm2b().map(Self::from_raw)
    }
}

/// An absent optional sized structure is written as a zero size
impl<T: Marshal> Marshal for Option<Tpm2b<T>> {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        match self {
            Some(v) => v.marshal(buf),
            None => {
                buf.put_tpm2b_empty();
                Ok(())
            }
        }
    }
}

impl<T> Unmarshal for Option<Tpm2b<T>> {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let raw = buf.get_tpm2b()?;
        Ok((!raw.is_empty()).then(|| Tpm2b::from_raw(raw)))
    }
}
