// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 marshalling/unmarshalling utilities
//!
//! Provides serialization and deserialization for TPM structures: primitive
//! big-endian numerics, length-prefixed (sized) sub-buffers, counted lists,
//! tagged unions resolved by a sibling selector, and bitfield records that keep
//! reserved bits verbatim.

use crate::constants::{tpm_rh, TpmAlgId};
use crate::error::{Error, Result};

/// Upper bound on the element count of a decoded list
pub const MAX_LIST_LENGTH: u32 = 4096;

/// Buffer for building TPM commands
#[derive(Debug, Default)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a TPM2B structure (2-byte size prefix + data)
    pub fn put_tpm2b(&mut self, data: &[u8]) -> Result<()> {
        let len = u16::try_from(data.len()).map_err(|_| Error::SizeOverflow {
            len: data.len(),
            max: u16::MAX as usize,
        })?;
        self.put_u16(len);
        self.put_bytes(data);
        Ok(())
    }

    /// Put an empty TPM2B structure
    pub fn put_tpm2b_empty(&mut self) {
        self.put_u16(0);
    }

    /// Marshal into a scratch buffer, then emit it with a 2-byte size prefix
    pub fn put_sized<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut CommandBuffer) -> Result<()>,
    {
        let mut inner = CommandBuffer::new();
        f(&mut inner)?;
        self.put_tpm2b(inner.as_bytes())
    }

    /// Like [`put_sized`](Self::put_sized) with a 1-byte size prefix
    pub fn put_sized8<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut CommandBuffer) -> Result<()>,
    {
        let mut inner = CommandBuffer::new();
        f(&mut inner)?;
        let len = u8::try_from(inner.len()).map_err(|_| Error::SizeOverflow {
            len: inner.len(),
            max: u8::MAX as usize,
        })?;
        self.put_u8(len);
        self.put_bytes(inner.as_bytes());
        Ok(())
    }

    /// Put a counted list (4-byte element count + elements)
    pub fn put_list<T: Marshal>(&mut self, items: &[T]) -> Result<()> {
        let count = u32::try_from(items.len())
            .ok()
            .filter(|n| *n <= MAX_LIST_LENGTH)
            .ok_or(Error::ListTooLong {
                len: items.len().min(u32::MAX as usize) as u32,
                max: MAX_LIST_LENGTH,
            })?;
        self.put_u32(count);
        for item in items {
            item.marshal(self)?;
        }
        Ok(())
    }

    /// Put the member of a tagged union selected by `selector`.
    ///
    /// Nothing is written when the selector is `TPM_ALG_NULL`.
    pub fn put_union<U: Union>(&mut self, selector: u64, value: &U) -> Result<()> {
        if selector == TpmAlgId::Null.to_u16() as u64 {
            return Ok(());
        }
        value.marshal_member(selector, self)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Update a u32 at a specific position (for size fields)
    pub fn update_u32(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}

/// Buffer for parsing TPM responses
#[derive(Debug)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn need(&self, what: &'static str, needed: usize) -> Result<()> {
        if needed > self.remaining() {
            return Err(Error::Underflow {
                what,
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N]> {
        self.need(what, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>("u8")?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.array("u16").map(u16::from_be_bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.array("u32").map(u32::from_be_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.array("u64").map(u64::from_be_bytes)
    }

    /// Borrow the next `len` bytes
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        self.need("bytes", len)?;
        let v = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.take(len).map(<[u8]>::to_vec)
    }

    /// Get a TPM2B structure (2-byte size prefix + data)
    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        self.get_bytes(size)
    }

    /// Get a 1-byte size prefixed byte string
    pub fn get_sized8_bytes(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u8()? as usize;
        self.get_bytes(size)
    }

    /// Decode a 2-byte sized structure; the size must be consumed exactly
    pub fn get_sized<T: Unmarshal>(&mut self, ty: &'static str) -> Result<T> {
        let size = self.get_u16()? as usize;
        let inner = self.take(size)?;
        decode_exact(inner, ty)
    }

    /// Decode an optional sized structure: a zero size yields `None`
    pub fn get_optional_sized<T: Unmarshal>(&mut self, ty: &'static str) -> Result<Option<T>> {
        let size = self.get_u16()? as usize;
        if size == 0 {
            return Ok(None);
        }
        let inner = self.take(size)?;
        decode_exact(inner, ty).map(Some)
    }

    /// Get a counted list (4-byte element count + elements)
    pub fn get_list<T: Unmarshal>(&mut self) -> Result<Vec<T>> {
        let count = self.get_u32()?;
        if count > MAX_LIST_LENGTH {
            return Err(Error::ListTooLong {
                len: count,
                max: MAX_LIST_LENGTH,
            });
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(T::unmarshal(self)?);
        }
        Ok(items)
    }

    /// Decode the member of a tagged union selected by `selector`
    pub fn get_union<U: Union>(&mut self, selector: u64) -> Result<U> {
        if selector == TpmAlgId::Null.to_u16() as u64 {
            return Ok(U::null());
        }
        U::create(selector, self)
    }

    /// Get remaining bytes
    pub fn get_remaining(&mut self) -> Vec<u8> {
        let v = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        v
    }

    /// Skip bytes
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    /// Peek at bytes without advancing position
    pub fn peek_bytes(&self, len: usize) -> Result<&'a [u8]> {
        self.need("bytes", len)?;
        Ok(&self.data[self.pos..self.pos + len])
    }
}

/// Decode `T` from `data`, rejecting unconsumed bytes
pub fn decode_exact<T: Unmarshal>(data: &[u8], ty: &'static str) -> Result<T> {
    let mut buf = ResponseBuffer::new(data);
    let value = T::unmarshal(&mut buf)?;
    if !buf.is_empty() {
        return Err(Error::TrailingBytes {
            ty,
            extra: buf.remaining(),
        });
    }
    Ok(value)
}

/// Trait for types that can be marshalled to TPM format
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()>;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf)?;
        Ok(buf.into_vec())
    }
}

/// Trait for types that can be unmarshalled from TPM format
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self>;

    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        Self::unmarshal(&mut buf)
    }
}

/// A tagged union whose member is chosen by a sibling selector field
pub trait Union: Sized {
    const NAME: &'static str;

    /// Value used when the selector is `TPM_ALG_NULL`
    fn null() -> Self;

    /// Instantiate and decode the member for `selector`
    fn create(selector: u64, buf: &mut ResponseBuffer) -> Result<Self>;

    /// Encode the member for `selector`. Fails if this value holds a
    /// different member.
    fn marshal_member(&self, selector: u64, buf: &mut CommandBuffer) -> Result<()>;

    fn unknown(selector: u64) -> Error {
        Error::UnknownSelector {
            union: Self::NAME,
            selector,
        }
    }

    fn mismatch(selector: u64) -> Error {
        Error::SelectorMismatch {
            union: Self::NAME,
            selector,
        }
    }
}

/// Inclusive bit range `hi..=lo` of a bitfield record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitRange {
    pub hi: u8,
    pub lo: u8,
}

impl BitRange {
    pub const fn new(hi: u8, lo: u8) -> Self {
        Self { hi, lo }
    }

    pub const fn bit(n: u8) -> Self {
        Self { hi: n, lo: n }
    }

    pub const fn mask(self) -> u64 {
        let width = (self.hi - self.lo + 1) as u32;
        let ones = if width >= 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        };
        ones << self.lo
    }

    pub fn get(self, bits: u64) -> u64 {
        (bits & self.mask()) >> self.lo
    }

    pub fn set(self, bits: &mut u64, value: u64) {
        *bits = (*bits & !self.mask()) | ((value << self.lo) & self.mask());
    }

    pub fn flag(self, bits: u64) -> bool {
        self.get(bits) != 0
    }
}

/// A record whose fields all live at fixed bit positions of one integer
pub trait Bitfield: Sized {
    /// Width of the packed integer in bits (8, 16, 32 or 64)
    const BITS: u32;
    /// Declared field positions
    const FIELDS: &'static [BitRange];

    /// Pack the declared fields
    fn pack(&self) -> u64;
    /// Unpack the declared fields, reserved bits left clear
    fn unpack(bits: u64) -> Self;
    /// Bits not covered by any declared field, kept as decoded
    fn reserved(&self) -> u64;
    fn set_reserved(&mut self, bits: u64);

    fn declared_mask() -> u64 {
        Self::FIELDS.iter().fold(0, |m, r| m | r.mask())
    }

    fn to_bits(&self) -> u64 {
        let mask = Self::declared_mask();
        (self.pack() & mask) | (self.reserved() & !mask)
    }

    fn from_bits(bits: u64) -> Self {
        let mask = Self::declared_mask();
        let mut v = Self::unpack(bits & mask);
        v.set_reserved(bits & !mask);
        v
    }
}

/// Marshal a bitfield record as a big-endian integer of its declared width
pub fn marshal_bitfield<T: Bitfield>(value: &T, buf: &mut CommandBuffer) -> Result<()> {
    let bits = value.to_bits();
    let bytes = bits.to_be_bytes();
    let width = (T::BITS / 8) as usize;
    buf.put_bytes(&bytes[8 - width..]);
    Ok(())
}

/// Unmarshal a bitfield record, capturing undeclared bits as reserved
pub fn unmarshal_bitfield<T: Bitfield>(buf: &mut ResponseBuffer) -> Result<T> {
    let width = (T::BITS / 8) as usize;
    let raw = buf.take(width)?;
    let bits = raw.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
    Ok(T::from_bits(bits))
}

/// Nullable handle normalization: zero means `TPM_RH_NULL`
pub fn nullable_handle(handle: u32) -> u32 {
    if handle == 0 {
        tpm_rh::NULL
    } else {
        handle
    }
}

/// Nullable algorithm normalization: zero means `TPM_ALG_NULL`
pub fn nullable_alg(alg: u16) -> u16 {
    if alg == 0 {
        TpmAlgId::Null.to_u16()
    } else {
        alg
    }
}

/// Declare a plain TPM record and derive field-order `Marshal`/`Unmarshal`.
///
/// Errors are wrapped with the record and field name.
#[macro_export]
macro_rules! tpm_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $field: $ty,
            )*
        }

        impl $crate::marshal::Marshal for $name {
            #[allow(unused_variables)]
            fn marshal(&self, buf: &mut $crate::marshal::CommandBuffer) -> $crate::Result<()> {
                $(
                    $crate::marshal::Marshal::marshal(&self.$field, buf)
                        .map_err(|e| e.in_field(stringify!($name), stringify!($field)))?;
                )*
                Ok(())
            }
        }

        impl $crate::marshal::Unmarshal for $name {
            #[allow(unused_variables)]
            fn unmarshal(buf: &mut $crate::marshal::ResponseBuffer) -> $crate::Result<Self> {
                Ok(Self {
                    $(
                        $field: <$ty as $crate::marshal::Unmarshal>::unmarshal(buf)
                            .map_err(|e| e.in_field(stringify!($name), stringify!($field)))?,
                    )*
                })
            }
        }
    };
}

// Implement Marshal for primitive types
impl Marshal for u8 {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u8(*self);
        Ok(())
    }
}

impl Marshal for u16 {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u16(*self);
        Ok(())
    }
}

impl Marshal for u32 {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u32(*self);
        Ok(())
    }
}

impl Marshal for u64 {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u64(*self);
        Ok(())
    }
}

impl Marshal for i32 {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_bytes(&self.to_be_bytes());
        Ok(())
    }
}

impl Marshal for bool {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u8(u8::from(*self));
        Ok(())
    }
}

/// Unsized byte strings are written verbatim
impl Marshal for [u8] {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_bytes(self);
        Ok(())
    }
}

impl Marshal for Vec<u8> {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_bytes(self);
        Ok(())
    }
}

impl<T: Marshal + ?Sized> Marshal for &T {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        (**self).marshal(buf)
    }
}

// Implement Unmarshal for primitive types
impl Unmarshal for u8 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u8()
    }
}

impl Unmarshal for u16 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u16()
    }
}

impl Unmarshal for u32 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u32()
    }
}

impl Unmarshal for u64 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u64()
    }
}

impl Unmarshal for i32 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u32().map(|v| v as i32)
    }
}

impl Unmarshal for bool {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(buf.get_u8()? != 0)
    }
}

/// An unsized byte string consumes the rest of the buffer
impl Unmarshal for Vec<u8> {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(buf.get_remaining())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Flags {
        low: u64,
        enabled: bool,
        reserved: u64,
    }

    impl Bitfield for Flags {
        const BITS: u32 = 16;
        const FIELDS: &'static [BitRange] = &[BitRange::new(3, 0), BitRange::bit(8)];

        fn pack(&self) -> u64 {
            let mut bits = 0;
            Self::FIELDS[0].set(&mut bits, self.low);
            Self::FIELDS[1].set(&mut bits, self.enabled as u64);
            bits
        }

        fn unpack(bits: u64) -> Self {
            Self {
                low: Self::FIELDS[0].get(bits),
                enabled: Self::FIELDS[1].flag(bits),
                reserved: 0,
            }
        }

        fn reserved(&self) -> u64 {
            self.reserved
        }

        fn set_reserved(&mut self, bits: u64) {
            self.reserved = bits;
        }
    }

    crate::tpm_struct! {
        #[derive(Debug, Clone, PartialEq)]
        struct Pair {
            first: u16,
            second: u32,
        }
    }

    #[test]
    fn test_primitive_round_trip() {
        let mut buf = CommandBuffer::new();
        buf.put_u8(0x01);
        buf.put_u16(0x0203);
        buf.put_u32(0x04050607);
        buf.put_u64(0x08090a0b0c0d0e0f);
        assert_eq!(buf.len(), 15);

        let bytes = buf.into_vec();
        let mut rsp = ResponseBuffer::new(&bytes);
        assert_eq!(rsp.get_u8().unwrap(), 0x01);
        assert_eq!(rsp.get_u16().unwrap(), 0x0203);
        assert_eq!(rsp.get_u32().unwrap(), 0x04050607);
        assert_eq!(rsp.get_u64().unwrap(), 0x08090a0b0c0d0e0f);
        assert!(rsp.is_empty());
    }

    #[test]
    fn test_underflow_names_field() {
        let err = Pair::from_bytes(&[0x00, 0x01, 0x02]).unwrap_err();
        assert!(matches!(
            err,
            Error::Field {
                ty: "Pair",
                field: "second",
                ..
            }
        ));
        assert!(matches!(err.root(), Error::Underflow { needed: 4, remaining: 1, .. }));
    }

    #[test]
    fn test_struct_round_trip() {
        let pair = Pair {
            first: 0xBEEF,
            second: 7,
        };
        let bytes = pair.to_bytes().unwrap();
        assert_eq!(bytes, vec![0xBE, 0xEF, 0, 0, 0, 7]);
        assert_eq!(Pair::from_bytes(&bytes).unwrap(), pair);
    }

    #[test]
    fn test_sized_prefix_matches_length() {
        let pair = Pair {
            first: 1,
            second: 2,
        };
        let mut buf = CommandBuffer::new();
        buf.put_sized(|inner| pair.marshal(inner)).unwrap();
        let bytes = buf.into_vec();
        let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        assert_eq!(len, bytes.len() - 2);

        let mut rsp = ResponseBuffer::new(&bytes);
        assert_eq!(rsp.get_sized::<Pair>("Pair").unwrap(), pair);
    }

    #[test]
    fn test_sized_rejects_trailing_bytes() {
        let bytes = [0x00, 0x07, 0, 1, 0, 0, 0, 2, 0xFF];
        let err = ResponseBuffer::new(&bytes)
            .get_sized::<Pair>("Pair")
            .unwrap_err();
        assert!(matches!(err, Error::TrailingBytes { extra: 1, .. }));
    }

    #[test]
    fn test_sized8_prefix() {
        let mut buf = CommandBuffer::new();
        buf.put_sized8(|inner| {
            inner.put_bytes(&[0xAA, 0xBB, 0xCC]);
            Ok(())
        })
        .unwrap();
        assert_eq!(buf.as_bytes(), &[3, 0xAA, 0xBB, 0xCC]);
        let bytes = buf.into_vec();
        assert_eq!(
            ResponseBuffer::new(&bytes).get_sized8_bytes().unwrap(),
            vec![0xAA, 0xBB, 0xCC]
        );
    }

    #[test]
    fn test_optional_zero_size() {
        let bytes = [0x00, 0x00];
        let mut rsp = ResponseBuffer::new(&bytes);
        assert_eq!(rsp.get_optional_sized::<Pair>("Pair").unwrap(), None);
        assert!(rsp.is_empty());
    }

    #[test]
    fn test_list_limit() {
        let bytes = (MAX_LIST_LENGTH + 1).to_be_bytes();
        let err = ResponseBuffer::new(&bytes).get_list::<u16>().unwrap_err();
        assert!(matches!(err, Error::ListTooLong { .. }));

        let mut buf = CommandBuffer::new();
        buf.put_list(&[1u16, 2, 3]).unwrap();
        let bytes = buf.into_vec();
        assert_eq!(bytes, vec![0, 0, 0, 3, 0, 1, 0, 2, 0, 3]);
        assert_eq!(
            ResponseBuffer::new(&bytes).get_list::<u16>().unwrap(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_bitfield_reserved_fidelity() {
        for pattern in [0x0000u16, 0xFFFF, 0xA5C3, 0x0100, 0x7E0F] {
            let bytes = pattern.to_be_bytes();
            let flags: Flags = unmarshal_bitfield(&mut ResponseBuffer::new(&bytes)).unwrap();
            assert_eq!(flags.low, (pattern & 0xF) as u64);
            assert_eq!(flags.enabled, pattern & 0x100 != 0);

            let mut buf = CommandBuffer::new();
            marshal_bitfield(&flags, &mut buf).unwrap();
            assert_eq!(buf.as_bytes(), &bytes);
        }
    }

    #[test]
    fn test_nullable_normalization() {
        assert_eq!(nullable_handle(0), tpm_rh::NULL);
        assert_eq!(nullable_handle(0x81000001), 0x81000001);
        assert_eq!(nullable_alg(0), TpmAlgId::Null.to_u16());
        assert_eq!(nullable_alg(TpmAlgId::Sha256.to_u16()), 0x000B);
    }

    #[test]
    fn test_tpm2b_overflow() {
        let big = vec![0u8; 70_000];
        let err = CommandBuffer::new().put_tpm2b(&big).unwrap_err();
        assert!(matches!(err, Error::SizeOverflow { len: 70_000, .. }));
    }
}
