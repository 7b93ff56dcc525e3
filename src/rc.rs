// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 response codes (TPM_RC) and their classification
//!
//! Format-one codes carry the index of the handle, parameter or session the
//! TPM rejected. [`TpmRc::classify`] splits that off so callers can match on
//! the canonical code and still report which argument was at fault.

use std::fmt;

const RC_VER1: u32 = 0x100;
const RC_FMT1: u32 = 0x080;
const RC_WARN: u32 = 0x900;
const RC_P: u32 = 0x040;
const RC_S: u32 = 0x800;

/// Raw TPM response code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TpmRc(pub u32);

/// What a format-one response code refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcSubject {
    Handle,
    Parameter,
    Session,
}

impl fmt::Display for RcSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RcSubject::Handle => write!(f, "handle"),
            RcSubject::Parameter => write!(f, "parameter"),
            RcSubject::Session => write!(f, "session"),
        }
    }
}

/// Classified response code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcKind {
    Success,
    /// Format-zero error, not tied to any argument
    General,
    /// Format-one error about a specific handle, parameter or session.
    /// `index` is 1-based as reported by the TPM; 0 means unspecified.
    Argument { subject: RcSubject, index: u8 },
    /// Transient condition; the command may succeed if retried
    Warning,
    /// Vendor or TPM 1.2 code
    Other,
}

impl TpmRc {
    pub const SUCCESS: TpmRc = TpmRc(0x000);

    // Format-zero errors
    pub const INITIALIZE: TpmRc = TpmRc(RC_VER1);
    pub const FAILURE: TpmRc = TpmRc(RC_VER1 + 0x001);
    pub const SEQUENCE: TpmRc = TpmRc(RC_VER1 + 0x003);
    pub const DISABLED: TpmRc = TpmRc(RC_VER1 + 0x020);
    pub const EXCLUSIVE: TpmRc = TpmRc(RC_VER1 + 0x021);
    pub const AUTH_TYPE: TpmRc = TpmRc(RC_VER1 + 0x024);
    pub const AUTH_MISSING: TpmRc = TpmRc(RC_VER1 + 0x025);
    pub const POLICY: TpmRc = TpmRc(RC_VER1 + 0x026);
    pub const PCR: TpmRc = TpmRc(RC_VER1 + 0x027);
    pub const PCR_CHANGED: TpmRc = TpmRc(RC_VER1 + 0x028);
    pub const AUTH_UNAVAILABLE: TpmRc = TpmRc(RC_VER1 + 0x02F);
    pub const COMMAND_SIZE: TpmRc = TpmRc(RC_VER1 + 0x042);
    pub const COMMAND_CODE: TpmRc = TpmRc(RC_VER1 + 0x043);
    pub const AUTHSIZE: TpmRc = TpmRc(RC_VER1 + 0x044);
    pub const AUTH_CONTEXT: TpmRc = TpmRc(RC_VER1 + 0x045);
    pub const NV_RANGE: TpmRc = TpmRc(RC_VER1 + 0x046);
    pub const NV_LOCKED: TpmRc = TpmRc(RC_VER1 + 0x048);
    pub const NV_AUTHORIZATION: TpmRc = TpmRc(RC_VER1 + 0x049);
    pub const NV_SPACE: TpmRc = TpmRc(RC_VER1 + 0x04B);
    pub const NV_DEFINED: TpmRc = TpmRc(RC_VER1 + 0x04C);
    pub const CPHASH: TpmRc = TpmRc(RC_VER1 + 0x051);

    // Format-one errors (canonical form, no index bits)
    pub const ATTRIBUTES: TpmRc = TpmRc(RC_FMT1 + 0x002);
    pub const HASH: TpmRc = TpmRc(RC_FMT1 + 0x003);
    pub const VALUE: TpmRc = TpmRc(RC_FMT1 + 0x004);
    pub const HANDLE: TpmRc = TpmRc(RC_FMT1 + 0x00B);
    pub const AUTH_FAIL: TpmRc = TpmRc(RC_FMT1 + 0x00E);
    pub const NONCE: TpmRc = TpmRc(RC_FMT1 + 0x00F);
    pub const SIZE: TpmRc = TpmRc(RC_FMT1 + 0x015);
    pub const SYMMETRIC: TpmRc = TpmRc(RC_FMT1 + 0x016);
    pub const POLICY_FAIL: TpmRc = TpmRc(RC_FMT1 + 0x01D);
    pub const BAD_AUTH: TpmRc = TpmRc(RC_FMT1 + 0x022);
    pub const EXPIRED: TpmRc = TpmRc(RC_FMT1 + 0x023);
    pub const POLICY_CC: TpmRc = TpmRc(RC_FMT1 + 0x024);

    // Warnings
    pub const CONTEXT_GAP: TpmRc = TpmRc(RC_WARN + 0x001);
    pub const SESSION_MEMORY: TpmRc = TpmRc(RC_WARN + 0x003);
    pub const MEMORY: TpmRc = TpmRc(RC_WARN + 0x004);
    pub const SESSION_HANDLES: TpmRc = TpmRc(RC_WARN + 0x005);
    pub const YIELDED: TpmRc = TpmRc(RC_WARN + 0x008);
    pub const CANCELED: TpmRc = TpmRc(RC_WARN + 0x009);
    pub const TESTING: TpmRc = TpmRc(RC_WARN + 0x00A);
    pub const NV_RATE: TpmRc = TpmRc(RC_WARN + 0x020);
    pub const LOCKOUT: TpmRc = TpmRc(RC_WARN + 0x021);
    pub const RETRY: TpmRc = TpmRc(RC_WARN + 0x022);
    pub const NV_UNAVAILABLE: TpmRc = TpmRc(RC_WARN + 0x023);

    pub fn to_u32(self) -> u32 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    fn is_fmt1(self) -> bool {
        self.0 & RC_FMT1 == RC_FMT1
    }

    fn is_fmt0(self) -> bool {
        self.0 & RC_VER1 == RC_VER1 && self.0 & RC_WARN != RC_WARN
    }

    /// Returns true for transient conditions where retrying may succeed
    pub fn is_warning(self) -> bool {
        !self.is_fmt1() && self.0 & RC_VER1 == RC_VER1 && self.0 & RC_WARN == RC_WARN
    }

    /// Strip the subject and index bits of a format-one code
    pub fn canonical(self) -> TpmRc {
        if !self.is_fmt1() {
            return self;
        }
        let mut r = self.0;
        if r & RC_P == RC_P {
            r ^= RC_P;
        } else if r & RC_S == RC_S {
            r ^= RC_S;
        }
        TpmRc(r & 0xFFFF_F0FF)
    }

    pub fn classify(self) -> RcKind {
        if self.is_success() {
            return RcKind::Success;
        }
        if self.is_fmt1() {
            let (subject, r) = if self.0 & RC_P == RC_P {
                (RcSubject::Parameter, self.0 ^ RC_P)
            } else if self.0 & RC_S == RC_S {
                (RcSubject::Session, self.0 ^ RC_S)
            } else {
                (RcSubject::Handle, self.0)
            };
            let index = ((r & 0xF00) >> 8) as u8;
            return RcKind::Argument { subject, index };
        }
        if self.is_fmt0() {
            return RcKind::General;
        }
        if self.is_warning() {
            return RcKind::Warning;
        }
        RcKind::Other
    }

    /// Compare against a canonical code, ignoring format-one index bits
    pub fn matches(self, canonical: TpmRc) -> bool {
        self.canonical() == canonical
    }

    /// TPM_RC_* name and description, if known
    pub fn describe(self) -> Option<(&'static str, &'static str)> {
        let code = self.canonical().0;
        DESCRIPTIONS
            .iter()
            .find(|(c, _, _)| *c == code)
            .map(|(_, name, desc)| (*name, *desc))
    }
}

impl From<u32> for TpmRc {
    fn from(v: u32) -> Self {
        TpmRc(v)
    }
}

impl fmt::Display for TpmRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.classify(), self.describe()) {
            (RcKind::Success, _) => write!(f, "TPM_RC_SUCCESS"),
            (RcKind::Argument { subject, index }, Some((name, desc))) => {
                write!(f, "{name} ({subject} {index}): {desc}")
            }
            (RcKind::Argument { subject, index }, None) => write!(
                f,
                "unknown format-1 error: {subject} {index} (0x{:x})",
                self.canonical().0
            ),
            (RcKind::General | RcKind::Warning, Some((name, desc))) => {
                write!(f, "{name}: {desc}")
            }
            (RcKind::General, None) => write!(f, "unknown format-0 error code (0x{:x})", self.0),
            (RcKind::Warning, None) => write!(f, "unknown warning (0x{:x})", self.0),
            (RcKind::Other, _) => write!(f, "unrecognized error code (0x{:x})", self.0),
        }
    }
}

const DESCRIPTIONS: &[(u32, &str, &str)] = &[
    (0x100, "TPM_RC_INITIALIZE", "TPM not initialized by TPM2_Startup or already initialized"),
    (0x101, "TPM_RC_FAILURE", "commands not being accepted because of a TPM failure"),
    (0x103, "TPM_RC_SEQUENCE", "improper use of a sequence handle"),
    (0x10B, "TPM_RC_PRIVATE", "not currently used"),
    (0x119, "TPM_RC_HMAC", "not currently used"),
    (0x120, "TPM_RC_DISABLED", "the command is disabled"),
    (0x121, "TPM_RC_EXCLUSIVE", "command failed because audit sequence required exclusivity"),
    (0x124, "TPM_RC_AUTH_TYPE", "authorization handle is not correct for command"),
    (0x125, "TPM_RC_AUTH_MISSING", "command requires an authorization session for handle and it is not present"),
    (0x126, "TPM_RC_POLICY", "policy failure in math operation or an invalid authPolicy value"),
    (0x127, "TPM_RC_PCR", "PCR check fail"),
    (0x128, "TPM_RC_PCR_CHANGED", "PCR have changed since checked"),
    (0x12D, "TPM_RC_UPGRADE", "TPM is in field upgrade mode"),
    (0x12E, "TPM_RC_TOO_MANY_CONTEXTS", "context ID counter is at maximum"),
    (0x12F, "TPM_RC_AUTH_UNAVAILABLE", "authValue or authPolicy is not available for selected entity"),
    (0x130, "TPM_RC_REBOOT", "a _TPM_Init and Startup(CLEAR) is required before the TPM can resume operation"),
    (0x131, "TPM_RC_UNBALANCED", "the protection algorithms (hash and symmetric) are not reasonably balanced"),
    (0x142, "TPM_RC_COMMAND_SIZE", "command commandSize value is inconsistent with contents of the command buffer"),
    (0x143, "TPM_RC_COMMAND_CODE", "command code not supported"),
    (0x144, "TPM_RC_AUTHSIZE", "the value of authorizationSize is out of range or the number of octets in the Authorization Area is greater than required"),
    (0x145, "TPM_RC_AUTH_CONTEXT", "use of an authorization session with a context command or another command that cannot have an authorization session"),
    (0x146, "TPM_RC_NV_RANGE", "NV offset+size is out of range"),
    (0x147, "TPM_RC_NV_SIZE", "requested allocation size is larger than allowed"),
    (0x148, "TPM_RC_NV_LOCKED", "NV access locked"),
    (0x149, "TPM_RC_NV_AUTHORIZATION", "NV access authorization fails in command actions"),
    (0x14A, "TPM_RC_NV_UNINITIALIZED", "an NV Index is used before being initialized or the state saved by TPM2_Shutdown(STATE) could not be restored"),
    (0x14B, "TPM_RC_NV_SPACE", "insufficient space for NV allocation"),
    (0x14C, "TPM_RC_NV_DEFINED", "NV Index or persistent object already defined"),
    (0x150, "TPM_RC_BAD_CONTEXT", "context in TPM2_ContextLoad() is not valid"),
    (0x151, "TPM_RC_CPHASH", "cpHash value already set or not correct for use"),
    (0x152, "TPM_RC_PARENT", "handle for parent is not a valid parent"),
    (0x153, "TPM_RC_NEEDS_TEST", "some function needs testing"),
    (0x154, "TPM_RC_NO_RESULT", "returned when an internal function cannot process a request due to an unspecified problem"),
    (0x155, "TPM_RC_SENSITIVE", "the sensitive area did not unmarshal correctly after decryption"),
    (0x081, "TPM_RC_ASYMMETRIC", "asymmetric algorithm not supported or not correct"),
    (0x082, "TPM_RC_ATTRIBUTES", "inconsistent attributes"),
    (0x083, "TPM_RC_HASH", "hash algorithm not supported or not appropriate"),
    (0x084, "TPM_RC_VALUE", "value is out of range or is not correct for the context"),
    (0x085, "TPM_RC_HIERARCHY", "hierarchy is not enabled or is not correct for the use"),
    (0x087, "TPM_RC_KEY_SIZE", "key size is not supported"),
    (0x088, "TPM_RC_MGF", "mask generation function not supported"),
    (0x089, "TPM_RC_MODE", "mode of operation not supported"),
    (0x08A, "TPM_RC_TYPE", "the type of the value is not appropriate for the use"),
    (0x08B, "TPM_RC_HANDLE", "the handle is not correct for the use"),
    (0x08C, "TPM_RC_KDF", "unsupported key derivation function or function not appropriate for use"),
    (0x08D, "TPM_RC_RANGE", "value was out of allowed range"),
    (0x08E, "TPM_RC_AUTH_FAIL", "the authorization HMAC check failed and DA counter incremented"),
    (0x08F, "TPM_RC_NONCE", "invalid nonce size or nonce value mismatch"),
    (0x090, "TPM_RC_PP", "authorization requires assertion of PP"),
    (0x092, "TPM_RC_SCHEME", "unsupported or incompatible scheme"),
    (0x095, "TPM_RC_SIZE", "structure is the wrong size"),
    (0x096, "TPM_RC_SYMMETRIC", "unsupported symmetric algorithm or key size, or not appropriate for instance"),
    (0x097, "TPM_RC_TAG", "incorrect structure tag"),
    (0x098, "TPM_RC_SELECTOR", "union selector is incorrect"),
    (0x09A, "TPM_RC_INSUFFICIENT", "the TPM was unable to unmarshal a value because there were not enough octets in the input buffer"),
    (0x09B, "TPM_RC_SIGNATURE", "the signature is not valid"),
    (0x09C, "TPM_RC_KEY", "key fields are not compatible with the selected use"),
    (0x09D, "TPM_RC_POLICY_FAIL", "a policy check failed"),
    (0x09F, "TPM_RC_INTEGRITY", "integrity check failed"),
    (0x0A0, "TPM_RC_TICKET", "invalid ticket"),
    (0x0A1, "TPM_RC_RESERVED_BITS", "reserved bits not set to zero as required"),
    (0x0A2, "TPM_RC_BAD_AUTH", "authorization failure without DA implications"),
    (0x0A3, "TPM_RC_EXPIRED", "the policy has expired"),
    (0x0A4, "TPM_RC_POLICY_CC", "the commandCode in the policy is not the commandCode of the command or the command code in a policy command references a command that is not implemented"),
    (0x0A5, "TPM_RC_BINDING", "public and sensitive portions of an object are not cryptographically bound"),
    (0x0A6, "TPM_RC_CURVE", "curve not supported"),
    (0x0A7, "TPM_RC_ECC_POINT", "point is not on the required curve"),
    (0x901, "TPM_RC_CONTEXT_GAP", "gap for context ID is too large"),
    (0x902, "TPM_RC_OBJECT_MEMORY", "out of memory for object contexts"),
    (0x903, "TPM_RC_SESSION_MEMORY", "out of memory for session contexts"),
    (0x904, "TPM_RC_MEMORY", "out of shared object/session memory or need space for internal operations"),
    (0x905, "TPM_RC_SESSION_HANDLES", "out of session handles; a session must be flushed before a new session may be created"),
    (0x906, "TPM_RC_OBJECT_HANDLES", "out of object handles"),
    (0x907, "TPM_RC_LOCALITY", "bad locality"),
    (0x908, "TPM_RC_YIELDED", "the TPM has suspended operation on the command; forward progress was made and the command may be retried"),
    (0x909, "TPM_RC_CANCELED", "the command was canceled"),
    (0x90A, "TPM_RC_TESTING", "TPM is performing self-tests"),
    (0x910, "TPM_RC_REFERENCE_H0", "the 1st handle in the handle area references a transient object or session that is not loaded"),
    (0x911, "TPM_RC_REFERENCE_H1", "the 2nd handle in the handle area references a transient object or session that is not loaded"),
    (0x912, "TPM_RC_REFERENCE_H2", "the 3rd handle in the handle area references a transient object or session that is not loaded"),
    (0x918, "TPM_RC_REFERENCE_S0", "the 1st authorization session handle references a session that is not loaded"),
    (0x919, "TPM_RC_REFERENCE_S1", "the 2nd authorization session handle references a session that is not loaded"),
    (0x91A, "TPM_RC_REFERENCE_S2", "the 3rd authorization session handle references a session that is not loaded"),
    (0x920, "TPM_RC_NV_RATE", "the TPM is rate-limiting accesses to prevent wearout of NV"),
    (0x921, "TPM_RC_LOCKOUT", "authorizations for objects subject to DA protection are not allowed at this time because the TPM is in DA lockout mode"),
    (0x922, "TPM_RC_RETRY", "the TPM was not able to start the command"),
    (0x923, "TPM_RC_NV_UNAVAILABLE", "the command may require writing of NV and NV is not current accessible"),
];
