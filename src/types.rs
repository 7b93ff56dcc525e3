// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types

use std::fmt;

use super::constants::*;
use super::crypto;
use super::error::{Error, Result};
use super::marshal::*;
use super::session::Session;
use super::tpm2b::Tpm2b;

macro_rules! tpm2b_buffer {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            pub buffer: Vec<u8>,
        }

        impl $name {
            pub fn new(data: Vec<u8>) -> Self {
                Self { buffer: data }
            }

            pub fn empty() -> Self {
                Self { buffer: Vec::new() }
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.buffer
            }

            pub fn is_empty(&self) -> bool {
                self.buffer.is_empty()
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(data: Vec<u8>) -> Self {
                Self::new(data)
            }
        }

        impl From<&[u8]> for $name {
            fn from(data: &[u8]) -> Self {
                Self::new(data.to_vec())
            }
        }

        impl Marshal for $name {
            fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
                buf.put_tpm2b(&self.buffer)
            }
        }

        impl Unmarshal for $name {
            fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
                Ok(Self {
                    buffer: buf.get_tpm2b()?,
                })
            }
        }
    };
}

tpm2b_buffer!(
    /// TPM2B_DIGEST - Variable length digest
    Tpm2bDigest
);
tpm2b_buffer!(
    /// TPM2B_DATA - Variable length data
    Tpm2bData
);
tpm2b_buffer!(
    /// TPM2B_AUTH - Authorization value
    Tpm2bAuth
);
tpm2b_buffer!(
    /// TPM2B_NAME - Name of an entity
    Tpm2bName
);
tpm2b_buffer!(
    /// TPM2B_ENCRYPTED_SECRET - Encrypted salt or seed
    Tpm2bEncryptedSecret
);
tpm2b_buffer!(
    /// TPM2B_MAX_NV_BUFFER - NV buffer
    Tpm2bMaxNvBuffer
);
tpm2b_buffer!(
    /// TPM2B_MAX_BUFFER - Input to hash/HMAC commands
    Tpm2bMaxBuffer
);
tpm2b_buffer!(
    /// TPM2B_OPERAND - Operand for PolicyNV comparisons
    Tpm2bOperand
);
tpm2b_buffer!(
    /// TPM2B_NONCE - Nonce value
    Tpm2bNonce
);
tpm2b_buffer!(
    /// TPM2B_TIMEOUT - Policy ticket timeout
    Tpm2bTimeout
);

impl Marshal for TpmAlgId {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u16(self.to_u16());
        Ok(())
    }
}

impl Unmarshal for TpmAlgId {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let alg = buf.get_u16()?;
        TpmAlgId::from_u16(alg).ok_or(Error::InvalidValue {
            what: "algorithm",
            value: alg as u64,
        })
    }
}

impl Marshal for TpmCc {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u32(self.to_u32());
        Ok(())
    }
}

impl Marshal for TpmSe {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u8(*self as u8);
        Ok(())
    }
}

impl Marshal for TpmEo {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u16(self.to_u16());
        Ok(())
    }
}

impl Marshal for TpmaNv {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u32(self.0);
        Ok(())
    }
}

impl Unmarshal for TpmaNv {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u32().map(TpmaNv)
    }
}

/// TPMA_SESSION - Session attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaSession {
    pub continue_session: bool,
    pub audit_exclusive: bool,
    pub audit_reset: bool,
    pub decrypt: bool,
    pub encrypt: bool,
    pub audit: bool,
    /// Undeclared bits 3 and 4, as received
    pub reserved: u8,
}

impl TpmaSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_continue_session(mut self) -> Self {
        self.continue_session = true;
        self
    }

    /// The attribute byte as it appears on the wire
    pub fn to_byte(&self) -> u8 {
        self.to_bits() as u8
    }

    pub fn from_byte(byte: u8) -> Self {
        Self::from_bits(byte as u64)
    }
}

impl Bitfield for TpmaSession {
    const BITS: u32 = 8;
    const FIELDS: &'static [BitRange] = &[
        BitRange::bit(0),
        BitRange::bit(1),
        BitRange::bit(2),
        BitRange::bit(5),
        BitRange::bit(6),
        BitRange::bit(7),
    ];

    fn pack(&self) -> u64 {
        let flags = [
            self.continue_session,
            self.audit_exclusive,
            self.audit_reset,
            self.decrypt,
            self.encrypt,
            self.audit,
        ];
        let mut bits = 0;
        for (range, set) in Self::FIELDS.iter().zip(flags) {
            range.set(&mut bits, set as u64);
        }
        bits
    }

    fn unpack(bits: u64) -> Self {
        let f = Self::FIELDS;
        Self {
            continue_session: f[0].flag(bits),
            audit_exclusive: f[1].flag(bits),
            audit_reset: f[2].flag(bits),
            decrypt: f[3].flag(bits),
            encrypt: f[4].flag(bits),
            audit: f[5].flag(bits),
            reserved: 0,
        }
    }

    fn reserved(&self) -> u64 {
        self.reserved as u64
    }

    fn set_reserved(&mut self, bits: u64) {
        self.reserved = bits as u8;
    }
}

impl Marshal for TpmaSession {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        marshal_bitfield(self, buf)
    }
}

impl Unmarshal for TpmaSession {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        unmarshal_bitfield(buf)
    }
}

crate::tpm_struct! {
    /// TPMS_AUTH_COMMAND - One entry of the command authorization area
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct TpmsAuthCommand {
        pub handle: u32,
        pub nonce: Tpm2bNonce,
        pub attributes: TpmaSession,
        pub hmac: Tpm2bAuth,
    }
}

crate::tpm_struct! {
    /// TPMS_AUTH_RESPONSE - One entry of the response authorization area
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct TpmsAuthResponse {
        pub nonce: Tpm2bNonce,
        pub attributes: TpmaSession,
        pub hmac: Tpm2bAuth,
    }
}

/// TPMU_SYM_KEY_BITS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmuSymKeyBits {
    Null,
    Aes(u16),
    /// Hash algorithm used by XOR obfuscation
    Xor(u16),
}

impl Union for TpmuSymKeyBits {
    const NAME: &'static str = "TPMU_SYM_KEY_BITS";

    fn null() -> Self {
        Self::Null
    }

    fn create(selector: u64, buf: &mut ResponseBuffer) -> Result<Self> {
        match selector {
            s if s == TpmAlgId::Aes.to_u16() as u64 => Ok(Self::Aes(buf.get_u16()?)),
            s if s == TpmAlgId::Xor.to_u16() as u64 => Ok(Self::Xor(buf.get_u16()?)),
            s => Err(Self::unknown(s)),
        }
    }

    fn marshal_member(&self, selector: u64, buf: &mut CommandBuffer) -> Result<()> {
        let aes = TpmAlgId::Aes.to_u16() as u64;
        let xor = TpmAlgId::Xor.to_u16() as u64;
        match (self, selector) {
            (Self::Aes(bits), s) if s == aes => bits.marshal(buf),
            (Self::Xor(hash), s) if s == xor => hash.marshal(buf),
            (_, s) if s == aes || s == xor => Err(Self::mismatch(s)),
            (_, s) => Err(Self::unknown(s)),
        }
    }
}

/// TPMU_SYM_MODE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmuSymMode {
    Null,
    Aes(u16),
    /// XOR carries no mode
    Xor,
}

impl Union for TpmuSymMode {
    const NAME: &'static str = "TPMU_SYM_MODE";

    fn null() -> Self {
        Self::Null
    }

    fn create(selector: u64, buf: &mut ResponseBuffer) -> Result<Self> {
        match selector {
            s if s == TpmAlgId::Aes.to_u16() as u64 => Ok(Self::Aes(buf.get_u16()?)),
            s if s == TpmAlgId::Xor.to_u16() as u64 => Ok(Self::Xor),
            s => Err(Self::unknown(s)),
        }
    }

    fn marshal_member(&self, selector: u64, buf: &mut CommandBuffer) -> Result<()> {
        let aes = TpmAlgId::Aes.to_u16() as u64;
        let xor = TpmAlgId::Xor.to_u16() as u64;
        match (self, selector) {
            (Self::Aes(mode), s) if s == aes => mode.marshal(buf),
            (Self::Xor, s) if s == xor => Ok(()),
            (_, s) if s == aes || s == xor => Err(Self::mismatch(s)),
            (_, s) => Err(Self::unknown(s)),
        }
    }
}

/// TPMT_SYM_DEF - Symmetric algorithm definition
///
/// `algorithm` is nullable: zero is sent as `TPM_ALG_NULL`, and the key bits
/// and mode are omitted when it is NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: u16,
    pub key_bits: TpmuSymKeyBits,
    pub mode: TpmuSymMode,
}

impl Default for TpmtSymDef {
    fn default() -> Self {
        Self::null()
    }
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null.to_u16(),
            key_bits: TpmuSymKeyBits::Null,
            mode: TpmuSymMode::Null,
        }
    }

    pub fn aes_cfb(key_bits: u16) -> Self {
        Self {
            algorithm: TpmAlgId::Aes.to_u16(),
            key_bits: TpmuSymKeyBits::Aes(key_bits),
            mode: TpmuSymMode::Aes(TpmAlgId::Cfb.to_u16()),
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self::aes_cfb(128)
    }

    pub fn is_null(&self) -> bool {
        nullable_alg(self.algorithm) == TpmAlgId::Null.to_u16()
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        let alg = nullable_alg(self.algorithm);
        buf.put_u16(alg);
        buf.put_union(alg as u64, &self.key_bits)
            .map_err(|e| e.in_field("TpmtSymDef", "key_bits"))?;
        buf.put_union(alg as u64, &self.mode)
            .map_err(|e| e.in_field("TpmtSymDef", "mode"))
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm = buf.get_u16()?;
        let key_bits = buf
            .get_union(algorithm as u64)
            .map_err(|e| e.in_field("TpmtSymDef", "key_bits"))?;
        let mode = buf
            .get_union(algorithm as u64)
            .map_err(|e| e.in_field("TpmtSymDef", "mode"))?;
        Ok(Self {
            algorithm,
            key_bits,
            mode,
        })
    }
}

/// TPMS_PCR_SELECTION - PCR selection for a single hash algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    pub pcr_select: Vec<u8>, // Bitmap of selected PCRs
}

impl TpmsPcrSelection {
    pub fn new(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        // At least 3 bytes, enough for PCR 0-23
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        let mut pcr_select = vec![0u8; size];

        for &pcr in pcrs {
            pcr_select[(pcr / 8) as usize] |= 1 << (pcr % 8);
        }

        Self { hash, pcr_select }
    }

    pub fn sha256(pcrs: &[u32]) -> Self {
        Self::new(TpmAlgId::Sha256, pcrs)
    }

    /// Indices of the selected PCRs
    pub fn selected(&self) -> Vec<u32> {
        self.pcr_select
            .iter()
            .enumerate()
            .flat_map(|(i, byte)| {
                (0..8)
                    .filter(move |bit| byte & (1 << bit) != 0)
                    .map(move |bit| (i * 8 + bit) as u32)
            })
            .collect()
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        self.hash.marshal(buf)?;
        buf.put_sized8(|inner| {
            inner.put_bytes(&self.pcr_select);
            Ok(())
        })
        .map_err(|e| e.in_field("TpmsPcrSelection", "pcr_select"))
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash = TpmAlgId::unmarshal(buf).map_err(|e| e.in_field("TpmsPcrSelection", "hash"))?;
        let pcr_select = buf
            .get_sized8_bytes()
            .map_err(|e| e.in_field("TpmsPcrSelection", "pcr_select"))?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION - List of PCR selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn new(selections: Vec<TpmsPcrSelection>) -> Self {
        Self {
            pcr_selections: selections,
        }
    }

    pub fn single(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        Self {
            pcr_selections: vec![TpmsPcrSelection::new(hash, pcrs)],
        }
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_list(&self.pcr_selections)
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            pcr_selections: buf.get_list()?,
        })
    }
}

/// TPML_DIGEST - List of digests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlDigest {
    pub digests: Vec<Tpm2bDigest>,
}

impl Marshal for TpmlDigest {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_list(&self.digests)
    }
}

impl Unmarshal for TpmlDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            digests: buf.get_list()?,
        })
    }
}

crate::tpm_struct! {
    /// TPMS_NV_PUBLIC - NV index public area
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TpmsNvPublic {
        pub nv_index: u32,
        pub name_alg: TpmAlgId,
        pub attributes: TpmaNv,
        pub auth_policy: Tpm2bDigest,
        pub data_size: u16,
    }
}

impl TpmsNvPublic {
    pub fn new(nv_index: u32, data_size: u16, attributes: TpmaNv) -> Self {
        Self {
            nv_index,
            name_alg: TpmAlgId::Sha256,
            attributes,
            auth_policy: Tpm2bDigest::empty(),
            data_size,
        }
    }

    /// Name of the index: `nameAlg || H(TPMS_NV_PUBLIC)`
    pub fn name(&self) -> Result<Tpm2bName> {
        let digest = crypto::hash(self.name_alg, &[&self.to_bytes()?])?;
        let mut name = self.name_alg.to_u16().to_be_bytes().to_vec();
        name.extend(digest);
        Ok(Tpm2bName::new(name))
    }
}

/// TPM2B_NV_PUBLIC - NV public with size prefix
pub type Tpm2bNvPublic = Tpm2b<TpmsNvPublic>;

/// TPMT_HA - Hash value with algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtHa {
    pub hash_alg: TpmAlgId,
    pub digest: Vec<u8>,
}

impl TpmtHa {
    pub fn sha256(digest: Vec<u8>) -> Self {
        Self {
            hash_alg: TpmAlgId::Sha256,
            digest,
        }
    }
}

impl Marshal for TpmtHa {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        let size = crypto::digest_size(self.hash_alg)?;
        if self.digest.len() != size {
            return Err(Error::SizeOverflow {
                len: self.digest.len(),
                max: size,
            }
            .in_field("TpmtHa", "digest"));
        }
        self.hash_alg.marshal(buf)?;
        buf.put_bytes(&self.digest);
        Ok(())
    }
}

impl Unmarshal for TpmtHa {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash_alg = TpmAlgId::unmarshal(buf).map_err(|e| e.in_field("TpmtHa", "hash_alg"))?;
        let size = crypto::digest_size(hash_alg)?;
        let digest = buf
            .get_bytes(size)
            .map_err(|e| e.in_field("TpmtHa", "digest"))?;
        Ok(Self { hash_alg, digest })
    }
}

/// TPML_DIGEST_VALUES - List of digest values for PCR extend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlDigestValues {
    pub digests: Vec<TpmtHa>,
}

impl TpmlDigestValues {
    pub fn single(digest: TpmtHa) -> Self {
        Self {
            digests: vec![digest],
        }
    }
}

impl Marshal for TpmlDigestValues {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_list(&self.digests)
    }
}

impl Unmarshal for TpmlDigestValues {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            digests: buf.get_list()?,
        })
    }
}

/// TPMT_TK_AUTH - Ticket returned by PolicySigned/PolicySecret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtTkAuth {
    pub tag: u16,
    pub hierarchy: u32,
    pub digest: Tpm2bDigest,
}

impl Marshal for TpmtTkAuth {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u16(self.tag);
        buf.put_u32(nullable_handle(self.hierarchy));
        self.digest.marshal(buf)
    }
}

impl Unmarshal for TpmtTkAuth {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            tag: buf.get_u16()?,
            hierarchy: buf.get_u32()?,
            digest: Tpm2bDigest::unmarshal(buf)?,
        })
    }
}

// ==================== Handles ====================

/// A bare TPM handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TpmHandle(pub u32);

impl TpmHandle {
    pub const NULL: TpmHandle = TpmHandle(tpm_rh::NULL);

    pub fn value(self) -> u32 {
        self.0
    }

    /// Name of handles whose Name is the handle itself: PCRs, sessions and
    /// permanent handles. Other handle types need an explicit Name.
    pub fn known_name(self) -> Option<Tpm2bName> {
        match TpmHt::of(self.0)? {
            TpmHt::Pcr | TpmHt::HmacSession | TpmHt::PolicySession | TpmHt::Permanent => {
                Some(Tpm2bName::new(self.0.to_be_bytes().to_vec()))
            }
            _ => None,
        }
    }
}

impl From<u32> for TpmHandle {
    fn from(handle: u32) -> Self {
        Self(handle)
    }
}

impl Marshal for TpmHandle {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u32(self.0);
        Ok(())
    }
}

impl Unmarshal for TpmHandle {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        buf.get_u32().map(Self)
    }
}

/// A handle together with its Name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedHandle {
    pub handle: u32,
    pub name: Tpm2bName,
}

impl NamedHandle {
    pub fn new(handle: u32, name: Tpm2bName) -> Self {
        Self { handle, name }
    }
}

/// A handle that must be authorized by a caller-supplied session
pub struct AuthHandle<'a> {
    pub handle: u32,
    /// Required unless the handle type has a known Name
    pub name: Option<Tpm2bName>,
    pub auth: Option<&'a mut dyn Session>,
}

impl<'a> AuthHandle<'a> {
    pub fn new(handle: u32, auth: &'a mut dyn Session) -> Self {
        Self {
            handle,
            name: None,
            auth: Some(auth),
        }
    }

    pub fn with_name(mut self, name: Tpm2bName) -> Self {
        self.name = Some(name);
        self
    }
}

impl fmt::Debug for AuthHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthHandle")
            .field("handle", &format_args!("0x{:08x}", self.handle))
            .field("name", &self.name)
            .field("auth", &self.auth.as_ref().map(|s| s.handle()))
            .finish()
    }
}

/// A handle in an authorization slot of a command.
///
/// Bare and named handles are authorized with an empty password; an
/// [`AuthHandle`] must carry its own session.
#[derive(Debug)]
pub enum AuthEntity<'a> {
    Handle(TpmHandle),
    Named(NamedHandle),
    Authorized(AuthHandle<'a>),
}

impl AuthEntity<'_> {
    pub fn handle(&self) -> u32 {
        match self {
            AuthEntity::Handle(h) => h.0,
            AuthEntity::Named(h) => h.handle,
            AuthEntity::Authorized(h) => h.handle,
        }
    }
}

impl From<u32> for AuthEntity<'_> {
    fn from(handle: u32) -> Self {
        AuthEntity::Handle(TpmHandle(handle))
    }
}

impl From<TpmHandle> for AuthEntity<'_> {
    fn from(handle: TpmHandle) -> Self {
        AuthEntity::Handle(handle)
    }
}

impl From<NamedHandle> for AuthEntity<'_> {
    fn from(handle: NamedHandle) -> Self {
        AuthEntity::Named(handle)
    }
}

impl<'a> From<AuthHandle<'a>> for AuthEntity<'a> {
    fn from(handle: AuthHandle<'a>) -> Self {
        AuthEntity::Authorized(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sym_def_aes_round_trip() {
        let def = TpmtSymDef::aes_128_cfb();
        let bytes = def.to_bytes().unwrap();
        assert_eq!(bytes, vec![0x00, 0x06, 0x00, 0x80, 0x00, 0x43]);
        assert_eq!(TpmtSymDef::from_bytes(&bytes).unwrap(), def);
    }

    #[test]
    fn test_sym_def_null_skips_union() {
        let bytes = TpmtSymDef::null().to_bytes().unwrap();
        assert_eq!(bytes, vec![0x00, 0x10]);

        // Zero is normalized to TPM_ALG_NULL
        let zero = TpmtSymDef {
            algorithm: 0,
            key_bits: TpmuSymKeyBits::Null,
            mode: TpmuSymMode::Null,
        };
        assert_eq!(zero.to_bytes().unwrap(), vec![0x00, 0x10]);

        let decoded = TpmtSymDef::from_bytes(&[0x00, 0x10]).unwrap();
        assert!(decoded.is_null());
        assert_eq!(decoded.key_bits, TpmuSymKeyBits::Null);
    }

    #[test]
    fn test_sym_def_xor_has_empty_mode() {
        let bytes = [0x00, 0x0A, 0x00, 0x0B];
        let def = TpmtSymDef::from_bytes(&bytes).unwrap();
        assert_eq!(def.key_bits, TpmuSymKeyBits::Xor(0x000B));
        assert_eq!(def.mode, TpmuSymMode::Xor);
        assert_eq!(def.to_bytes().unwrap(), bytes.to_vec());
    }

    #[test]
    fn test_sym_def_unknown_selector() {
        let err = TpmtSymDef::from_bytes(&[0x00, 0x99, 0x00, 0x80]).unwrap_err();
        assert!(matches!(
            err.root(),
            Error::UnknownSelector {
                union: "TPMU_SYM_KEY_BITS",
                selector: 0x99
            }
        ));
    }

    #[test]
    fn test_sym_def_member_mismatch() {
        let def = TpmtSymDef {
            algorithm: TpmAlgId::Xor.to_u16(),
            key_bits: TpmuSymKeyBits::Aes(128),
            mode: TpmuSymMode::Xor,
        };
        let err = def.to_bytes().unwrap_err();
        assert!(matches!(
            err,
            Error::Field {
                field: "key_bits",
                ..
            }
        ));
        assert!(matches!(err.root(), Error::SelectorMismatch { .. }));
    }

    #[test]
    fn test_session_attributes_keep_reserved_bits() {
        for byte in [0x00u8, 0x01, 0x18, 0xFF, 0x61] {
            let attrs = TpmaSession::from_byte(byte);
            assert_eq!(attrs.to_byte(), byte);
        }
        let attrs = TpmaSession::from_byte(0x61);
        assert!(attrs.continue_session);
        assert!(attrs.decrypt);
        assert!(attrs.encrypt);
        assert!(!attrs.audit);
        assert_eq!(attrs.reserved, 0);
        assert_eq!(TpmaSession::from_byte(0x18).reserved, 0x18);
    }

    #[test]
    fn test_auth_command_layout() {
        let auth = TpmsAuthCommand {
            handle: tpm_rh::PW,
            nonce: Tpm2bNonce::empty(),
            attributes: TpmaSession::new().with_continue_session(),
            hmac: Tpm2bAuth::new(b"pw".to_vec()),
        };
        let bytes = auth.to_bytes().unwrap();
        assert_eq!(hex::encode(&bytes), "4000000900000100027077");
        assert_eq!(TpmsAuthCommand::from_bytes(&bytes).unwrap(), auth);
    }

    #[test]
    fn test_pcr_selection_layout() {
        let sel = TpmlPcrSelection::single(TpmAlgId::Sha256, &[0, 7, 16]);
        let bytes = sel.to_bytes().unwrap();
        assert_eq!(hex::encode(&bytes), "00000001000b03810001");
        let decoded = TpmlPcrSelection::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.pcr_selections[0].selected(), vec![0, 7, 16]);
    }

    #[test]
    fn test_nv_public_name() {
        let public = TpmsNvPublic::new(
            0x01500000,
            32,
            TpmaNv::new()
                .with_owner_write()
                .with_auth_write()
                .with_owner_read()
                .with_auth_read(),
        );
        assert_eq!(public.attributes.0, 0x00060006);
        let name = public.name().unwrap();
        assert_eq!(
            hex::encode(name.as_bytes()),
            "000b187425a52cd543c84831180cf6cf0c203f71e615cd8257b56275161e4b2dee17"
        );

        let boxed: Tpm2bNvPublic = Tpm2b::new(public.clone());
        let wire = boxed.to_bytes().unwrap();
        assert_eq!(wire[..2], [0x00, 0x0E]);
        let decoded = Tpm2bNvPublic::from_bytes(&wire).unwrap();
        assert_eq!(decoded.contents().unwrap(), &public);
    }

    #[test]
    fn test_known_names() {
        assert_eq!(
            TpmHandle(tpm_rh::OWNER).known_name().unwrap().as_bytes(),
            &[0x40, 0x00, 0x00, 0x01]
        );
        assert!(TpmHandle(0x00000007).known_name().is_some());
        assert!(TpmHandle(0x02000000).known_name().is_some());
        assert!(TpmHandle(0x81000001).known_name().is_none());
        assert!(TpmHandle(0x01500000).known_name().is_none());
    }

    #[test]
    fn test_tpmt_ha_rejects_wrong_size() {
        let ha = TpmtHa::sha256(vec![0u8; 20]);
        assert!(ha.to_bytes().is_err());
        let ha = TpmtHa::sha256(vec![0xAB; 32]);
        let bytes = ha.to_bytes().unwrap();
        assert_eq!(bytes.len(), 34);
        assert_eq!(TpmtHa::from_bytes(&bytes).unwrap(), ha);
    }
}
