// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants and command codes

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TpmCc {
    NvUndefineSpace = 0x00000122,
    NvDefineSpace = 0x0000012A,
    NvWrite = 0x00000137,
    PolicyNv = 0x00000149,
    NvRead = 0x0000014E,
    PolicySecret = 0x00000151,
    Hmac = 0x00000155,
    PolicySigned = 0x00000160,
    FlushContext = 0x00000165,
    NvReadPublic = 0x00000169,
    PolicyAuthorize = 0x0000016A,
    PolicyAuthValue = 0x0000016B,
    PolicyCommandCode = 0x0000016C,
    PolicyCpHash = 0x0000016E,
    PolicyOr = 0x00000171,
    StartAuthSession = 0x00000176,
    GetRandom = 0x0000017B,
    PcrRead = 0x0000017E,
    PolicyPcr = 0x0000017F,
    PolicyRestart = 0x00000180,
    PcrExtend = 0x00000182,
    PolicyGetDigest = 0x00000189,
    PolicyPassword = 0x0000018C,
    PolicyNvWritten = 0x0000018F,
    PolicyAuthorizeNv = 0x00000192,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        const ALL: &[TpmCc] = &[
            TpmCc::NvUndefineSpace,
            TpmCc::NvDefineSpace,
            TpmCc::NvWrite,
            TpmCc::PolicyNv,
            TpmCc::NvRead,
            TpmCc::PolicySecret,
            TpmCc::Hmac,
            TpmCc::PolicySigned,
            TpmCc::FlushContext,
            TpmCc::NvReadPublic,
            TpmCc::PolicyAuthorize,
            TpmCc::PolicyAuthValue,
            TpmCc::PolicyCommandCode,
            TpmCc::PolicyCpHash,
            TpmCc::PolicyOr,
            TpmCc::StartAuthSession,
            TpmCc::GetRandom,
            TpmCc::PcrRead,
            TpmCc::PolicyPcr,
            TpmCc::PolicyRestart,
            TpmCc::PcrExtend,
            TpmCc::PolicyGetDigest,
            TpmCc::PolicyPassword,
            TpmCc::PolicyNvWritten,
            TpmCc::PolicyAuthorizeNv,
        ];
        ALL.iter().copied().find(|cc| cc.to_u32() == v)
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TpmAlgId {
    Rsa = 0x0001,
    Sha1 = 0x0004,
    Hmac = 0x0005,
    Aes = 0x0006,
    KeyedHash = 0x0008,
    Xor = 0x000A,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Null = 0x0010,
    RsaSsa = 0x0014,
    RsaPss = 0x0016,
    EcDsa = 0x0018,
    Ecc = 0x0023,
    SymCipher = 0x0025,
    Cfb = 0x0043,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0001 => Some(TpmAlgId::Rsa),
            0x0004 => Some(TpmAlgId::Sha1),
            0x0005 => Some(TpmAlgId::Hmac),
            0x0006 => Some(TpmAlgId::Aes),
            0x0008 => Some(TpmAlgId::KeyedHash),
            0x000A => Some(TpmAlgId::Xor),
            0x000B => Some(TpmAlgId::Sha256),
            0x000C => Some(TpmAlgId::Sha384),
            0x000D => Some(TpmAlgId::Sha512),
            0x0010 => Some(TpmAlgId::Null),
            0x0014 => Some(TpmAlgId::RsaSsa),
            0x0016 => Some(TpmAlgId::RsaPss),
            0x0018 => Some(TpmAlgId::EcDsa),
            0x0023 => Some(TpmAlgId::Ecc),
            0x0025 => Some(TpmAlgId::SymCipher),
            0x0043 => Some(TpmAlgId::Cfb),
            _ => None,
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            TpmAlgId::Sha384 => 48,
            TpmAlgId::Sha512 => 64,
            _ => 0,
        }
    }
}

/// TPM 2.0 Handle Types (most significant octet of a handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmHt {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
}

impl TpmHt {
    pub fn of(handle: u32) -> Option<Self> {
        match (handle >> 24) as u8 {
            0x00 => Some(TpmHt::Pcr),
            0x01 => Some(TpmHt::NvIndex),
            0x02 => Some(TpmHt::HmacSession),
            0x03 => Some(TpmHt::PolicySession),
            0x40 => Some(TpmHt::Permanent),
            0x80 => Some(TpmHt::Transient),
            0x81 => Some(TpmHt::Persistent),
            _ => None,
        }
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const PW: u32 = 0x40000009; // Password authorization
    pub const LOCKOUT: u32 = 0x4000000A;
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PLATFORM: u32 = 0x4000000C;
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

/// TPM command/response header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    RspCommand = 0x00C4,
    NoSessions = 0x8001,
    Sessions = 0x8002,
    Creation = 0x8021,
    Hashcheck = 0x8024,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x00C4 => Some(TpmSt::RspCommand),
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x8021 => Some(TpmSt::Creation),
            0x8024 => Some(TpmSt::Hashcheck),
            _ => None,
        }
    }
}

/// TPM_EO operand comparisons used by PolicyNV
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmEo {
    Eq = 0x0000,
    Neq = 0x0001,
    SignedGt = 0x0002,
    UnsignedGt = 0x0003,
    SignedLt = 0x0004,
    UnsignedLt = 0x0005,
    SignedGe = 0x0006,
    UnsignedGe = 0x0007,
    SignedLe = 0x0008,
    UnsignedLe = 0x0009,
    BitSet = 0x000A,
    BitClear = 0x000B,
}

impl TpmEo {
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// TPM 2.0 NV Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaNv(pub u32);

impl TpmaNv {
    pub const PP_WRITE: u32 = 1 << 0;
    pub const OWNER_WRITE: u32 = 1 << 1;
    pub const AUTH_WRITE: u32 = 1 << 2;
    pub const POLICY_WRITE: u32 = 1 << 3;
    pub const PP_READ: u32 = 1 << 16;
    pub const OWNER_READ: u32 = 1 << 17;
    pub const AUTH_READ: u32 = 1 << 18;
    pub const POLICY_READ: u32 = 1 << 19;
    pub const NO_DA: u32 = 1 << 25;
    pub const ORDERLY: u32 = 1 << 26;
    pub const WRITTEN: u32 = 1 << 29;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_owner_write(mut self) -> Self {
        self.0 |= Self::OWNER_WRITE;
        self
    }

    pub fn with_owner_read(mut self) -> Self {
        self.0 |= Self::OWNER_READ;
        self
    }

    pub fn with_auth_write(mut self) -> Self {
        self.0 |= Self::AUTH_WRITE;
        self
    }

    pub fn with_auth_read(mut self) -> Self {
        self.0 |= Self::AUTH_READ;
        self
    }

    pub fn with_no_da(mut self) -> Self {
        self.0 |= Self::NO_DA;
        self
    }
}
