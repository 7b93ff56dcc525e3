// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command records and the high-level context
//!
//! Each record implements [`Command`] with a matching [`Response`]; policy
//! commands also implement [`PolicyUpdate`] so a policy can be computed
//! offline with the same records that satisfy it on the TPM.

use anyhow::Context;
use tracing::debug;

use super::constants::*;
use super::crypto;
use super::device::*;
use super::error::{Error, Result};
use super::execute::{execute, Command, CommandParts, HandleEntry, Response};
use super::marshal::*;
use super::policy::{PolicyCalculator, PolicyUpdate};
use super::session::*;
use super::tpm2b::Tpm2b;
use super::types::*;

macro_rules! params {
    ($($field:expr),* $(,)?) => {
        vec![$(&$field as &dyn Marshal),*]
    };
}

/// Response records whose parameters are plain field-order TPM records
macro_rules! response {
    ($name:ident, $sized:expr $(, $field:ident)*) => {
        impl Response for $name {
            const FIRST_PARAM_SIZED: Option<bool> = $sized;

            fn from_parts(_handles: &[u32], params: &mut ResponseBuffer) -> Result<Self> {
                Self::unmarshal(params)
            }

            fn parameters(&self) -> Vec<&dyn Marshal> {
                params![$(self.$field),*]
            }
        }
    };
}

/// Name of the entity in an authorization slot
fn entity_name(entity: &AuthEntity<'_>) -> Result<Tpm2bName> {
    let name = match entity {
        AuthEntity::Handle(h) => h.known_name(),
        AuthEntity::Named(h) => Some(h.name.clone()),
        AuthEntity::Authorized(h) => h
            .name
            .clone()
            .or_else(|| TpmHandle(h.handle).known_name()),
    };
    name.ok_or(Error::MissingName { index: 0 })
}

// ==================== Sessions ====================

/// TPM2_StartAuthSession
#[derive(Debug, Clone)]
pub struct StartAuthSession {
    /// Key used to decrypt the salt, or `TPM_RH_NULL`
    pub tpm_key: TpmHandle,
    /// Entity whose auth value is bound into the session key, or `TPM_RH_NULL`
    pub bind: TpmHandle,
    pub nonce_caller: Tpm2bNonce,
    pub encrypted_salt: Tpm2bEncryptedSecret,
    pub session_type: TpmSe,
    pub symmetric: TpmtSymDef,
    pub auth_hash: TpmAlgId,
}

impl Command for StartAuthSession {
    type Response = StartAuthSessionResponse;
    const COMMAND_CODE: TpmCc = TpmCc::StartAuthSession;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![
                HandleEntry::nullable(self.tpm_key.0),
                HandleEntry::nullable(self.bind.0),
            ],
            parameters: params![
                self.nonce_caller,
                self.encrypted_salt,
                self.session_type,
                self.symmetric,
                self.auth_hash,
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartAuthSessionResponse {
    pub session_handle: u32,
    pub nonce_tpm: Tpm2bNonce,
}

impl Response for StartAuthSessionResponse {
    const NUM_HANDLES: usize = 1;
    const FIRST_PARAM_SIZED: Option<bool> = Some(true);

    fn from_parts(handles: &[u32], params: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            session_handle: handles[0],
            nonce_tpm: Tpm2bNonce::unmarshal(params)
                .map_err(|e| e.in_field("StartAuthSessionResponse", "nonce_tpm"))?,
        })
    }

    fn parameters(&self) -> Vec<&dyn Marshal> {
        params![self.nonce_tpm]
    }
}

/// TPM2_FlushContext
#[derive(Debug, Clone)]
pub struct FlushContext {
    pub flush_handle: TpmHandle,
}

impl Command for FlushContext {
    type Response = FlushContextResponse;
    const COMMAND_CODE: TpmCc = TpmCc::FlushContext;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![],
            parameters: params![self.flush_handle],
        }
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct FlushContextResponse {}
}
response!(FlushContextResponse, None);

// ==================== Random ====================

/// TPM2_GetRandom
#[derive(Debug, Clone)]
pub struct GetRandom {
    pub bytes_requested: u16,
}

impl Command for GetRandom {
    type Response = GetRandomResponse;
    const COMMAND_CODE: TpmCc = TpmCc::GetRandom;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![],
            parameters: params![self.bytes_requested],
        }
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct GetRandomResponse {
        pub random_bytes: Tpm2bDigest,
    }
}
response!(GetRandomResponse, Some(true), random_bytes);

// ==================== HMAC ====================

/// TPM2_HMAC
#[derive(Debug)]
pub struct Hmac<'a> {
    /// HMAC key, authorized with USER role
    pub handle: AuthEntity<'a>,
    pub buffer: Tpm2bMaxBuffer,
    /// `TPM_ALG_NULL` selects the key's default scheme
    pub hash_alg: TpmAlgId,
}

impl<'a> Command for Hmac<'a> {
    type Response = HmacResponse;
    const COMMAND_CODE: TpmCc = TpmCc::Hmac;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![HandleEntry::authorized(&mut self.handle)],
            parameters: params![self.buffer, self.hash_alg],
        }
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct HmacResponse {
        pub out_hmac: Tpm2bDigest,
    }
}
response!(HmacResponse, Some(true), out_hmac);

// ==================== NV ====================

/// TPM2_NV_DefineSpace
#[derive(Debug)]
pub struct NvDefineSpace<'a> {
    /// `TPM_RH_OWNER` or `TPM_RH_PLATFORM`
    pub auth_handle: AuthEntity<'a>,
    pub auth: Tpm2bAuth,
    pub public_info: Tpm2bNvPublic,
}

impl<'a> Command for NvDefineSpace<'a> {
    type Response = NvDefineSpaceResponse;
    const COMMAND_CODE: TpmCc = TpmCc::NvDefineSpace;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![HandleEntry::authorized(&mut self.auth_handle)],
            parameters: params![self.auth, self.public_info],
        }
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct NvDefineSpaceResponse {}
}
response!(NvDefineSpaceResponse, None);

/// TPM2_NV_UndefineSpace
#[derive(Debug)]
pub struct NvUndefineSpace<'a> {
    pub auth_handle: AuthEntity<'a>,
    pub nv_index: NamedHandle,
}

impl<'a> Command for NvUndefineSpace<'a> {
    type Response = NvUndefineSpaceResponse;
    const COMMAND_CODE: TpmCc = TpmCc::NvUndefineSpace;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![
                HandleEntry::authorized(&mut self.auth_handle),
                HandleEntry::named(&self.nv_index),
            ],
            parameters: vec![],
        }
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct NvUndefineSpaceResponse {}
}
response!(NvUndefineSpaceResponse, None);

/// TPM2_NV_Write
#[derive(Debug)]
pub struct NvWrite<'a> {
    pub auth_handle: AuthEntity<'a>,
    pub nv_index: NamedHandle,
    pub data: Tpm2bMaxNvBuffer,
    pub offset: u16,
}

impl<'a> Command for NvWrite<'a> {
    type Response = NvWriteResponse;
    const COMMAND_CODE: TpmCc = TpmCc::NvWrite;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![
                HandleEntry::authorized(&mut self.auth_handle),
                HandleEntry::named(&self.nv_index),
            ],
            parameters: params![self.data, self.offset],
        }
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct NvWriteResponse {}
}
response!(NvWriteResponse, None);

/// TPM2_NV_Read
#[derive(Debug)]
pub struct NvRead<'a> {
    pub auth_handle: AuthEntity<'a>,
    pub nv_index: NamedHandle,
    pub size: u16,
    pub offset: u16,
}

impl<'a> Command for NvRead<'a> {
    type Response = NvReadResponse;
    const COMMAND_CODE: TpmCc = TpmCc::NvRead;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![
                HandleEntry::authorized(&mut self.auth_handle),
                HandleEntry::named(&self.nv_index),
            ],
            parameters: params![self.size, self.offset],
        }
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct NvReadResponse {
        pub data: Tpm2bMaxNvBuffer,
    }
}
response!(NvReadResponse, Some(true), data);

/// TPM2_NV_ReadPublic
#[derive(Debug, Clone)]
pub struct NvReadPublic {
    pub nv_index: TpmHandle,
}

impl Command for NvReadPublic {
    type Response = NvReadPublicResponse;
    const COMMAND_CODE: TpmCc = TpmCc::NvReadPublic;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![HandleEntry::plain(self.nv_index.0)],
            parameters: vec![],
        }
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone)]
    pub struct NvReadPublicResponse {
        pub nv_public: Tpm2bNvPublic,
        pub nv_name: Tpm2bName,
    }
}
response!(NvReadPublicResponse, Some(true), nv_public, nv_name);

// ==================== PCR ====================

/// TPM2_PCR_Read
#[derive(Debug, Clone)]
pub struct PcrRead {
    pub pcr_selection_in: TpmlPcrSelection,
}

impl Command for PcrRead {
    type Response = PcrReadResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PcrRead;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![],
            parameters: params![self.pcr_selection_in],
        }
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct PcrReadResponse {
        pub pcr_update_counter: u32,
        pub pcr_selection_out: TpmlPcrSelection,
        pub pcr_values: TpmlDigest,
    }
}
response!(
    PcrReadResponse,
    Some(false),
    pcr_update_counter,
    pcr_selection_out,
    pcr_values
);

impl PcrReadResponse {
    /// Pair each returned digest with its PCR index
    pub fn values(&self) -> Vec<(u32, Vec<u8>)> {
        let indices = self
            .pcr_selection_out
            .pcr_selections
            .iter()
            .flat_map(|sel| sel.selected());
        indices
            .zip(&self.pcr_values.digests)
            .map(|(pcr, digest)| (pcr, digest.buffer.clone()))
            .collect()
    }
}

/// TPM2_PCR_Extend
#[derive(Debug)]
pub struct PcrExtend<'a> {
    pub pcr_handle: AuthEntity<'a>,
    pub digests: TpmlDigestValues,
}

impl<'a> Command for PcrExtend<'a> {
    type Response = PcrExtendResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PcrExtend;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![HandleEntry::authorized(&mut self.pcr_handle)],
            parameters: params![self.digests],
        }
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct PcrExtendResponse {}
}
response!(PcrExtendResponse, None);

// ==================== Policy ====================

/// TPM2_PolicySigned
#[derive(Debug, Clone)]
pub struct PolicySigned {
    pub auth_object: NamedHandle,
    pub policy_session: TpmHandle,
    pub nonce_tpm: Tpm2bNonce,
    pub cp_hash_a: Tpm2bDigest,
    pub policy_ref: Tpm2bNonce,
    pub expiration: i32,
    /// Marshalled TPMT_SIGNATURE
    pub auth: Vec<u8>,
}

impl Command for PolicySigned {
    type Response = PolicySignedResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PolicySigned;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![
                HandleEntry::named(&self.auth_object),
                HandleEntry::plain(self.policy_session.0),
            ],
            parameters: params![
                self.nonce_tpm,
                self.cp_hash_a,
                self.policy_ref,
                self.expiration,
                self.auth,
            ],
        }
    }
}

impl PolicyUpdate for PolicySigned {
    fn update(&self, policy: &mut PolicyCalculator) -> Result<()> {
        policy_update(
            policy,
            TpmCc::PolicySigned,
            self.auth_object.name.as_bytes(),
            self.policy_ref.as_bytes(),
        )
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone)]
    pub struct PolicySignedResponse {
        pub timeout: Tpm2bTimeout,
        pub policy_ticket: TpmtTkAuth,
    }
}
response!(PolicySignedResponse, Some(true), timeout, policy_ticket);

/// TPM2_PolicySecret
#[derive(Debug)]
pub struct PolicySecret<'a> {
    pub auth_handle: AuthEntity<'a>,
    pub policy_session: TpmHandle,
    pub nonce_tpm: Tpm2bNonce,
    pub cp_hash_a: Tpm2bDigest,
    pub policy_ref: Tpm2bNonce,
    pub expiration: i32,
}

impl<'a> Command for PolicySecret<'a> {
    type Response = PolicySecretResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PolicySecret;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![
                HandleEntry::authorized(&mut self.auth_handle),
                HandleEntry::plain(self.policy_session.0),
            ],
            parameters: params![
                self.nonce_tpm,
                self.cp_hash_a,
                self.policy_ref,
                self.expiration,
            ],
        }
    }
}

impl PolicyUpdate for PolicySecret<'_> {
    fn update(&self, policy: &mut PolicyCalculator) -> Result<()> {
        let name = entity_name(&self.auth_handle)?;
        policy_update(
            policy,
            TpmCc::PolicySecret,
            name.as_bytes(),
            self.policy_ref.as_bytes(),
        )
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone)]
    pub struct PolicySecretResponse {
        pub timeout: Tpm2bTimeout,
        pub policy_ticket: TpmtTkAuth,
    }
}
response!(PolicySecretResponse, Some(true), timeout, policy_ticket);

/// PolicyUpdate(cc, arg2, arg3) of TPM 2.0 Part 3, 23.2.3
fn policy_update(policy: &mut PolicyCalculator, cc: TpmCc, arg2: &[u8], arg3: &[u8]) -> Result<()> {
    policy.update(&[&cc.to_u32().to_be_bytes(), arg2])?;
    policy.update(&[arg3])
}

/// TPM2_PolicyOR
#[derive(Debug, Clone)]
pub struct PolicyOr {
    pub policy_session: TpmHandle,
    pub p_hash_list: TpmlDigest,
}

impl Command for PolicyOr {
    type Response = PolicyOrResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PolicyOr;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![HandleEntry::plain(self.policy_session.0)],
            parameters: params![self.p_hash_list],
        }
    }
}

impl PolicyUpdate for PolicyOr {
    fn update(&self, policy: &mut PolicyCalculator) -> Result<()> {
        policy.reset();
        let cc = TpmCc::PolicyOr.to_u32().to_be_bytes();
        let mut parts: Vec<&[u8]> = vec![&cc];
        parts.extend(self.p_hash_list.digests.iter().map(|d| d.as_bytes()));
        policy.update(&parts)
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct PolicyOrResponse {}
}
response!(PolicyOrResponse, None);

/// TPM2_PolicyPCR
#[derive(Debug, Clone)]
pub struct PolicyPcr {
    pub policy_session: TpmHandle,
    /// Expected digest of the selected PCRs; may be empty
    pub pcr_digest: Tpm2bDigest,
    pub pcrs: TpmlPcrSelection,
}

impl Command for PolicyPcr {
    type Response = PolicyPcrResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PolicyPcr;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![HandleEntry::plain(self.policy_session.0)],
            parameters: params![self.pcr_digest, self.pcrs],
        }
    }
}

impl PolicyUpdate for PolicyPcr {
    fn update(&self, policy: &mut PolicyCalculator) -> Result<()> {
        policy.update(&[
            &TpmCc::PolicyPcr.to_u32().to_be_bytes(),
            &self.pcrs.to_bytes()?,
            self.pcr_digest.as_bytes(),
        ])
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct PolicyPcrResponse {}
}
response!(PolicyPcrResponse, None);

/// TPM2_PolicyNV
#[derive(Debug)]
pub struct PolicyNv<'a> {
    pub auth_handle: AuthEntity<'a>,
    pub nv_index: NamedHandle,
    pub policy_session: TpmHandle,
    pub operand_b: Tpm2bOperand,
    pub offset: u16,
    pub operation: TpmEo,
}

impl<'a> Command for PolicyNv<'a> {
    type Response = PolicyNvResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PolicyNv;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![
                HandleEntry::authorized(&mut self.auth_handle),
                HandleEntry::named(&self.nv_index),
                HandleEntry::plain(self.policy_session.0),
            ],
            parameters: params![self.operand_b, self.offset, self.operation],
        }
    }
}

impl PolicyUpdate for PolicyNv<'_> {
    fn update(&self, policy: &mut PolicyCalculator) -> Result<()> {
        let args = crypto::hash(
            policy.alg(),
            &[
                self.operand_b.as_bytes(),
                &self.offset.to_be_bytes(),
                &self.operation.to_u16().to_be_bytes(),
            ],
        )?;
        policy.update(&[
            &TpmCc::PolicyNv.to_u32().to_be_bytes(),
            &args,
            self.nv_index.name.as_bytes(),
        ])
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct PolicyNvResponse {}
}
response!(PolicyNvResponse, None);

/// TPM2_PolicyCommandCode
#[derive(Debug, Clone)]
pub struct PolicyCommandCode {
    pub policy_session: TpmHandle,
    pub code: TpmCc,
}

impl Command for PolicyCommandCode {
    type Response = PolicyCommandCodeResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PolicyCommandCode;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![HandleEntry::plain(self.policy_session.0)],
            parameters: params![self.code],
        }
    }
}

impl PolicyUpdate for PolicyCommandCode {
    fn update(&self, policy: &mut PolicyCalculator) -> Result<()> {
        policy.update(&[
            &TpmCc::PolicyCommandCode.to_u32().to_be_bytes(),
            &self.code.to_u32().to_be_bytes(),
        ])
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct PolicyCommandCodeResponse {}
}
response!(PolicyCommandCodeResponse, None);

/// TPM2_PolicyCpHash
#[derive(Debug, Clone)]
pub struct PolicyCpHash {
    pub policy_session: TpmHandle,
    pub cp_hash_a: Tpm2bDigest,
}

impl Command for PolicyCpHash {
    type Response = PolicyCpHashResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PolicyCpHash;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![HandleEntry::plain(self.policy_session.0)],
            parameters: params![self.cp_hash_a],
        }
    }
}

impl PolicyUpdate for PolicyCpHash {
    fn update(&self, policy: &mut PolicyCalculator) -> Result<()> {
        policy.update(&[
            &TpmCc::PolicyCpHash.to_u32().to_be_bytes(),
            self.cp_hash_a.as_bytes(),
        ])
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct PolicyCpHashResponse {}
}
response!(PolicyCpHashResponse, None);

/// TPM2_PolicyAuthorize
#[derive(Debug, Clone)]
pub struct PolicyAuthorize {
    pub policy_session: TpmHandle,
    pub approved_policy: Tpm2bDigest,
    pub policy_ref: Tpm2bDigest,
    /// Name of the key that signed the approved policy
    pub key_sign: Tpm2bName,
    /// TPMT_TK_VERIFIED for the approved policy
    pub check_ticket: TpmtTkAuth,
}

impl Command for PolicyAuthorize {
    type Response = PolicyAuthorizeResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PolicyAuthorize;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![HandleEntry::plain(self.policy_session.0)],
            parameters: params![
                self.approved_policy,
                self.policy_ref,
                self.key_sign,
                self.check_ticket,
            ],
        }
    }
}

impl PolicyUpdate for PolicyAuthorize {
    fn update(&self, policy: &mut PolicyCalculator) -> Result<()> {
        policy_update(
            policy,
            TpmCc::PolicyAuthorize,
            self.key_sign.as_bytes(),
            self.policy_ref.as_bytes(),
        )
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct PolicyAuthorizeResponse {}
}
response!(PolicyAuthorizeResponse, None);

/// TPM2_PolicyAuthValue
#[derive(Debug, Clone)]
pub struct PolicyAuthValue {
    pub policy_session: TpmHandle,
}

impl Command for PolicyAuthValue {
    type Response = PolicyAuthValueResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PolicyAuthValue;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![HandleEntry::plain(self.policy_session.0)],
            parameters: vec![],
        }
    }
}

impl PolicyUpdate for PolicyAuthValue {
    fn update(&self, policy: &mut PolicyCalculator) -> Result<()> {
        policy.update(&[&TpmCc::PolicyAuthValue.to_u32().to_be_bytes()])
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct PolicyAuthValueResponse {}
}
response!(PolicyAuthValueResponse, None);

/// TPM2_PolicyPassword
#[derive(Debug, Clone)]
pub struct PolicyPassword {
    pub policy_session: TpmHandle,
}

impl Command for PolicyPassword {
    type Response = PolicyPasswordResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PolicyPassword;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![HandleEntry::plain(self.policy_session.0)],
            parameters: vec![],
        }
    }
}

impl PolicyUpdate for PolicyPassword {
    // Same digest as PolicyAuthValue
    fn update(&self, policy: &mut PolicyCalculator) -> Result<()> {
        policy.update(&[&TpmCc::PolicyAuthValue.to_u32().to_be_bytes()])
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct PolicyPasswordResponse {}
}
response!(PolicyPasswordResponse, None);

/// TPM2_PolicyGetDigest
#[derive(Debug, Clone)]
pub struct PolicyGetDigest {
    pub policy_session: TpmHandle,
}

impl Command for PolicyGetDigest {
    type Response = PolicyGetDigestResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PolicyGetDigest;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![HandleEntry::plain(self.policy_session.0)],
            parameters: vec![],
        }
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct PolicyGetDigestResponse {
        pub policy_digest: Tpm2bDigest,
    }
}
response!(PolicyGetDigestResponse, Some(true), policy_digest);

/// TPM2_PolicyNvWritten
#[derive(Debug, Clone)]
pub struct PolicyNvWritten {
    pub policy_session: TpmHandle,
    pub written_set: bool,
}

impl Command for PolicyNvWritten {
    type Response = PolicyNvWrittenResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PolicyNvWritten;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![HandleEntry::plain(self.policy_session.0)],
            parameters: params![self.written_set],
        }
    }
}

impl PolicyUpdate for PolicyNvWritten {
    fn update(&self, policy: &mut PolicyCalculator) -> Result<()> {
        policy.update(&[
            &TpmCc::PolicyNvWritten.to_u32().to_be_bytes(),
            &[self.written_set as u8],
        ])
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct PolicyNvWrittenResponse {}
}
response!(PolicyNvWrittenResponse, None);

/// TPM2_PolicyAuthorizeNV
#[derive(Debug)]
pub struct PolicyAuthorizeNv<'a> {
    pub auth_handle: AuthEntity<'a>,
    pub nv_index: NamedHandle,
    pub policy_session: TpmHandle,
}

impl<'a> Command for PolicyAuthorizeNv<'a> {
    type Response = PolicyAuthorizeNvResponse;
    const COMMAND_CODE: TpmCc = TpmCc::PolicyAuthorizeNv;

    fn parts(&mut self) -> CommandParts<'_> {
        CommandParts {
            handles: vec![
                HandleEntry::authorized(&mut self.auth_handle),
                HandleEntry::named(&self.nv_index),
                HandleEntry::plain(self.policy_session.0),
            ],
            parameters: vec![],
        }
    }
}

impl PolicyUpdate for PolicyAuthorizeNv<'_> {
    fn update(&self, policy: &mut PolicyCalculator) -> Result<()> {
        policy.reset();
        policy.update(&[
            &TpmCc::PolicyAuthorizeNv.to_u32().to_be_bytes(),
            self.nv_index.name.as_bytes(),
        ])
    }
}

crate::tpm_struct! {
    #[derive(Debug, Clone, Default)]
    pub struct PolicyAuthorizeNvResponse {}
}
response!(PolicyAuthorizeNvResponse, None);

// ==================== Context ====================

/// Largest NV chunk moved per NV_Read/NV_Write
const MAX_NV_CHUNK: usize = 1024;

/// NV offsets are 16-bit on the wire
fn nv_offset(offset: usize) -> Result<u16> {
    u16::try_from(offset).map_err(|_| Error::InvalidValue {
        what: "NV offset",
        value: offset as u64,
    })
}

/// Pure Rust TPM context
pub struct TpmContext {
    device: TpmDevice,
}

impl TpmContext {
    /// Open the given device spec, or auto-detect the TPM
    pub fn new(device_spec: Option<&str>) -> anyhow::Result<Self> {
        let device = match device_spec {
            Some(spec) => TpmDevice::open(spec)?,
            None => TpmDevice::detect()?,
        };

        Ok(Self { device })
    }

    /// Get the device path
    pub fn device_path(&self) -> &str {
        self.device.path()
    }

    /// Transport for running commands directly
    pub fn transport(&mut self) -> &mut TpmDevice {
        &mut self.device
    }

    /// Execute a command record
    pub fn execute<C: Command>(
        &mut self,
        cmd: &mut C,
        sessions: &mut [&mut dyn Session],
    ) -> Result<C::Response> {
        execute(&mut self.device, cmd, sessions)
    }

    // ==================== Sessions ====================

    /// Start a reusable HMAC session
    pub fn hmac_session(&mut self, hash: TpmAlgId, opts: SessionOptions) -> Result<HmacSession> {
        HmacSession::open(&mut self.device, hash, DEFAULT_NONCE_SIZE, opts)
    }

    /// Start a reusable policy session
    pub fn policy_session(
        &mut self,
        hash: TpmAlgId,
        opts: SessionOptions,
    ) -> Result<PolicySession> {
        PolicySession::open(&mut self.device, hash, DEFAULT_NONCE_SIZE, opts)
    }

    /// Current policy digest of a policy session
    pub fn policy_get_digest(&mut self, session: &dyn Session) -> Result<Vec<u8>> {
        let mut cmd = PolicyGetDigest {
            policy_session: TpmHandle(session.handle()),
        };
        Ok(self.execute(&mut cmd, &mut [])?.policy_digest.buffer)
    }

    /// Flush a context (handle)
    pub fn flush_context(&mut self, handle: u32) -> anyhow::Result<()> {
        let mut cmd = FlushContext {
            flush_handle: TpmHandle(handle),
        };
        self.execute(&mut cmd, &mut [])
            .context("FlushContext failed")?;
        Ok(())
    }

    // ==================== Random Number Generation ====================

    /// Generate random bytes using the TPM's hardware RNG
    pub fn get_random(&mut self, num_bytes: usize) -> anyhow::Result<Vec<u8>> {
        let mut result = Vec::with_capacity(num_bytes);

        // TPM may return fewer bytes than requested, so loop
        while result.len() < num_bytes {
            let remaining = num_bytes - result.len();
            let mut cmd = GetRandom {
                bytes_requested: remaining.min(48) as u16, // TPM typically limits to 48-64 bytes
            };

            let rsp = self.execute(&mut cmd, &mut []).context("GetRandom failed")?;
            if rsp.random_bytes.is_empty() {
                anyhow::bail!("TPM returned no random bytes");
            }
            result.extend_from_slice(rsp.random_bytes.as_bytes());
        }

        result.truncate(num_bytes);
        Ok(result)
    }

    // ==================== NV Operations ====================

    /// Read the NV public area and the index Name
    pub fn nv_read_public(&mut self, index: u32) -> anyhow::Result<(TpmsNvPublic, Tpm2bName)> {
        let mut cmd = NvReadPublic {
            nv_index: TpmHandle(index),
        };
        let rsp = self
            .execute(&mut cmd, &mut [])
            .with_context(|| format!("NV_ReadPublic failed for 0x{:08x}", index))?;
        let public = rsp.nv_public.into_contents()?;
        Ok((public, rsp.nv_name))
    }

    /// Read an NV index, authorizing with the owner hierarchy and falling
    /// back to the index's own (empty) auth value
    pub fn nv_read(&mut self, index: u32) -> anyhow::Result<Vec<u8>> {
        let (public, name) = self.nv_read_public(index)?;
        let total_size = public.data_size as usize;
        let nv_index = NamedHandle::new(index, name);

        let mut result = Vec::with_capacity(total_size);
        while result.len() < total_size {
            let offset = nv_offset(result.len())?;
            let size = (total_size - result.len()).min(MAX_NV_CHUNK) as u16;

            let mut cmd = NvRead {
                auth_handle: tpm_rh::OWNER.into(),
                nv_index: nv_index.clone(),
                size,
                offset,
            };
            let rsp = match self.execute(&mut cmd, &mut []) {
                Ok(rsp) => rsp,
                Err(Error::Tpm(rc)) => {
                    debug!("owner read of 0x{:08x} failed ({}), retrying with index auth", index, rc);
                    let mut cmd = NvRead {
                        auth_handle: nv_index.clone().into(),
                        nv_index: nv_index.clone(),
                        size,
                        offset,
                    };
                    self.execute(&mut cmd, &mut [])
                        .with_context(|| format!("NV_Read failed at offset {}", offset))?
                }
                Err(e) => return Err(anyhow::Error::new(e).context("NV_Read failed")),
            };
            if rsp.data.is_empty() {
                anyhow::bail!("NV_Read returned no data at offset {}", offset);
            }
            result.extend_from_slice(rsp.data.as_bytes());
        }

        debug!("read {} bytes from NV index 0x{:08x}", result.len(), index);
        Ok(result)
    }

    /// Write data to an NV index with owner authorization
    pub fn nv_write(&mut self, index: u32, data: &[u8]) -> anyhow::Result<()> {
        let (_, name) = self.nv_read_public(index)?;
        let nv_index = NamedHandle::new(index, name);

        for (i, chunk) in data.chunks(MAX_NV_CHUNK).enumerate() {
            let offset = nv_offset(i * MAX_NV_CHUNK)?;
            let mut cmd = NvWrite {
                auth_handle: tpm_rh::OWNER.into(),
                nv_index: nv_index.clone(),
                data: Tpm2bMaxNvBuffer::from(chunk),
                offset,
            };
            self.execute(&mut cmd, &mut [])
                .with_context(|| format!("NV_Write failed at offset {}", offset))?;
        }

        debug!("wrote {} bytes to NV index 0x{:08x}", data.len(), index);
        Ok(())
    }

    /// Define a new NV index in the owner hierarchy
    pub fn nv_define(&mut self, index: u32, size: u16, attributes: TpmaNv) -> anyhow::Result<()> {
        let mut cmd = NvDefineSpace {
            auth_handle: tpm_rh::OWNER.into(),
            auth: Tpm2bAuth::empty(),
            public_info: Tpm2b::new(TpmsNvPublic::new(index, size, attributes)),
        };
        self.execute(&mut cmd, &mut [])
            .with_context(|| format!("NV_DefineSpace failed for 0x{:08x}", index))?;

        debug!("defined NV index 0x{:08x} with size {}", index, size);
        Ok(())
    }

    /// Undefine (delete) an NV index
    pub fn nv_undefine(&mut self, index: u32) -> anyhow::Result<()> {
        let (_, name) = self.nv_read_public(index)?;
        let mut cmd = NvUndefineSpace {
            auth_handle: tpm_rh::OWNER.into(),
            nv_index: NamedHandle::new(index, name),
        };
        self.execute(&mut cmd, &mut [])
            .with_context(|| format!("NV_UndefineSpace failed for 0x{:08x}", index))?;

        debug!("undefined NV index 0x{:08x}", index);
        Ok(())
    }

    // ==================== PCR Operations ====================

    /// Read PCR values for the given selection
    pub fn pcr_read(
        &mut self,
        pcr_selection: &TpmlPcrSelection,
    ) -> anyhow::Result<Vec<(u32, Vec<u8>)>> {
        let mut cmd = PcrRead {
            pcr_selection_in: pcr_selection.clone(),
        };
        let rsp = self.execute(&mut cmd, &mut []).context("PCR_Read failed")?;
        Ok(rsp.values())
    }

    /// Extend a PCR with a hash value
    pub fn pcr_extend(&mut self, pcr: u32, hash: &[u8], hash_alg: TpmAlgId) -> anyhow::Result<()> {
        let mut cmd = PcrExtend {
            pcr_handle: pcr.into(),
            digests: TpmlDigestValues::single(TpmtHa {
                hash_alg,
                digest: hash.to_vec(),
            }),
        };
        self.execute(&mut cmd, &mut [])
            .with_context(|| format!("PCR_Extend failed for PCR {}", pcr))?;

        debug!("extended PCR {}", pcr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::tests::{response, MockTransport};

    #[test]
    fn test_policy_pcr_digest() {
        let pcr0 = crypto::hash(TpmAlgId::Sha256, &[&[0u8; 32]]).unwrap();
        let cmd = PolicyPcr {
            policy_session: TpmHandle(0x03000000),
            pcr_digest: Tpm2bDigest::new(pcr0),
            pcrs: TpmlPcrSelection::single(TpmAlgId::Sha256, &[0]),
        };
        let mut policy = PolicyCalculator::new(TpmAlgId::Sha256).unwrap();
        cmd.update(&mut policy).unwrap();
        assert_eq!(
            hex::encode(policy.hash()),
            "093ceb41181d47808862d7946268ee6a17a10e3d1b79b32351bc56e4beaceff0"
        );
    }

    #[test]
    fn test_policy_auth_value_and_command_code() {
        let mut policy = PolicyCalculator::new(TpmAlgId::Sha256).unwrap();
        PolicyAuthValue {
            policy_session: TpmHandle(0x03000000),
        }
        .update(&mut policy)
        .unwrap();
        let after_auth_value = policy.hash().to_vec();

        PolicyCommandCode {
            policy_session: TpmHandle(0x03000000),
            code: TpmCc::NvRead,
        }
        .update(&mut policy)
        .unwrap();
        assert_eq!(
            hex::encode(policy.hash()),
            "da3aa62b14e08f7b0080da325d01836991866c5396dc84905c4528192f509244"
        );

        // PolicyPassword produces the same digest as PolicyAuthValue
        let mut password = PolicyCalculator::new(TpmAlgId::Sha256).unwrap();
        PolicyPassword {
            policy_session: TpmHandle(0x03000000),
        }
        .update(&mut password)
        .unwrap();
        assert_eq!(password.hash(), after_auth_value.as_slice());
    }

    #[test]
    fn test_policy_or_resets_first() {
        let branches = TpmlDigest {
            digests: vec![
                Tpm2bDigest::new(vec![0x01; 32]),
                Tpm2bDigest::new(vec![0x02; 32]),
            ],
        };
        let cmd = PolicyOr {
            policy_session: TpmHandle(0x03000000),
            p_hash_list: branches,
        };

        let mut fresh = PolicyCalculator::new(TpmAlgId::Sha256).unwrap();
        cmd.update(&mut fresh).unwrap();

        let mut dirty = PolicyCalculator::new(TpmAlgId::Sha256).unwrap();
        dirty.update(&[b"earlier state".as_slice()]).unwrap();
        cmd.update(&mut dirty).unwrap();
        assert_eq!(fresh.hash(), dirty.hash());

        let expected = crypto::hash(
            TpmAlgId::Sha256,
            &[&[0u8; 32], &[0x00, 0x00, 0x01, 0x71], &[0x01; 32], &[0x02; 32]],
        )
        .unwrap();
        assert_eq!(fresh.hash(), expected.as_slice());
    }

    #[test]
    fn test_policy_secret_needs_name() {
        let cmd = PolicySecret {
            auth_handle: AuthEntity::Handle(TpmHandle(0x80000001)),
            policy_session: TpmHandle(0x03000000),
            nonce_tpm: Tpm2bNonce::empty(),
            cp_hash_a: Tpm2bDigest::empty(),
            policy_ref: Tpm2bNonce::empty(),
            expiration: 0,
        };
        let mut policy = PolicyCalculator::new(TpmAlgId::Sha256).unwrap();
        assert!(matches!(
            cmd.update(&mut policy),
            Err(Error::MissingName { .. })
        ));

        // Permanent handles are their own Name
        let cmd = PolicySecret {
            auth_handle: tpm_rh::OWNER.into(),
            ..cmd
        };
        cmd.update(&mut policy).unwrap();
        let step1 = crypto::hash(
            TpmAlgId::Sha256,
            &[&[0u8; 32], &[0x00, 0x00, 0x01, 0x51], &[0x40, 0x00, 0x00, 0x01]],
        )
        .unwrap();
        let expected = crypto::hash(TpmAlgId::Sha256, &[&step1]).unwrap();
        assert_eq!(policy.hash(), expected.as_slice());
    }

    #[test]
    fn test_policy_nv_args_hash() {
        let nv_name = Tpm2bName::new(vec![0x00, 0x0B, 0x01, 0x02]);
        let cmd = PolicyNv {
            auth_handle: tpm_rh::OWNER.into(),
            nv_index: NamedHandle::new(0x01500000, nv_name.clone()),
            policy_session: TpmHandle(0x03000000),
            operand_b: Tpm2bOperand::new(vec![0xAB]),
            offset: 4,
            operation: TpmEo::Eq,
        };
        let mut policy = PolicyCalculator::new(TpmAlgId::Sha256).unwrap();
        cmd.update(&mut policy).unwrap();

        let args = crypto::hash(TpmAlgId::Sha256, &[&[0xAB, 0x00, 0x04, 0x00, 0x00]]).unwrap();
        let expected = crypto::hash(
            TpmAlgId::Sha256,
            &[&[0u8; 32], &[0x00, 0x00, 0x01, 0x49], &args, nv_name.as_bytes()],
        )
        .unwrap();
        assert_eq!(policy.hash(), expected.as_slice());
    }

    #[test]
    fn test_start_auth_session_wire() {
        let mut cmd = StartAuthSession {
            tpm_key: TpmHandle(0),
            bind: TpmHandle::NULL,
            nonce_caller: Tpm2bNonce::new(vec![0x11; 16]),
            encrypted_salt: Tpm2bEncryptedSecret::empty(),
            session_type: TpmSe::Policy,
            symmetric: TpmtSymDef::aes_128_cfb(),
            auth_hash: TpmAlgId::Sha256,
        };
        let mut body = 0x03000000u32.to_be_bytes().to_vec();
        body.extend([0x00, 0x10]);
        body.extend([0x22; 16]);
        let mut tpm = MockTransport::new(vec![response(0x8001, 0, &body)]);

        let rsp = execute(&mut tpm, &mut cmd, &mut []).unwrap();
        assert_eq!(rsp.session_handle, 0x03000000);
        assert_eq!(rsp.nonce_tpm.as_bytes(), &[0x22; 16]);

        // A zero key handle is sent as TPM_RH_NULL
        assert_eq!(
            hex::encode(&tpm.commands[0]),
            "80010000002f000001764000000740000007\
             001011111111111111111111111111111111\
             000001000600800043000b"
        );
    }

    #[test]
    fn test_nv_read_public_response() {
        let public = TpmsNvPublic::new(
            0x01500000,
            32,
            TpmaNv::new().with_owner_write().with_owner_read(),
        );
        let name = public.name().unwrap();
        let mut body = Tpm2b::new(public.clone()).to_bytes().unwrap();
        body.extend(name.to_bytes().unwrap());
        let mut tpm = MockTransport::new(vec![response(0x8001, 0, &body)]);

        let mut cmd = NvReadPublic {
            nv_index: TpmHandle(0x01500000),
        };
        let rsp = execute(&mut tpm, &mut cmd, &mut []).unwrap();
        assert_eq!(rsp.nv_public.contents().unwrap(), &public);
        assert_eq!(rsp.nv_name, name);
        assert_eq!(hex::encode(&tpm.commands[0]), "80010000000e0000016901500000");
    }

    #[test]
    fn test_pcr_read_values() {
        let rsp = PcrReadResponse {
            pcr_update_counter: 7,
            pcr_selection_out: TpmlPcrSelection::single(TpmAlgId::Sha256, &[0, 7]),
            pcr_values: TpmlDigest {
                digests: vec![
                    Tpm2bDigest::new(vec![0x00; 32]),
                    Tpm2bDigest::new(vec![0x07; 32]),
                ],
            },
        };
        let mut tpm = MockTransport::new(vec![response(
            0x8001,
            0,
            &rsp.to_bytes().unwrap(),
        )]);
        let mut cmd = PcrRead {
            pcr_selection_in: TpmlPcrSelection::single(TpmAlgId::Sha256, &[0, 7]),
        };
        let decoded = execute(&mut tpm, &mut cmd, &mut []).unwrap();
        assert_eq!(decoded.pcr_update_counter, 7);
        assert_eq!(
            decoded.values(),
            vec![(0, vec![0x00; 32]), (7, vec![0x07; 32])]
        );
    }

    #[test]
    fn test_nv_offset_range() {
        assert_eq!(nv_offset(64 * MAX_NV_CHUNK - 1).unwrap(), u16::MAX);
        assert!(matches!(
            nv_offset(64 * MAX_NV_CHUNK),
            Err(Error::InvalidValue {
                what: "NV offset",
                value: 65536
            })
        ));
    }

    #[test]
    fn test_pcr_selection() {
        let sel = TpmsPcrSelection::sha256(&[0, 1, 2, 7]);
        assert_eq!(sel.hash, TpmAlgId::Sha256);
        // PCR 0, 1, 2, 7 = bits 0, 1, 2, 7 = 0b10000111 = 0x87
        assert_eq!(sel.pcr_select[0], 0x87);
    }
}
