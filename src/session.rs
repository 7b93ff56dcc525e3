// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 authorization sessions
//!
//! Three kinds of session authorize commands: the password pseudo-session,
//! HMAC sessions and policy sessions. HMAC and policy sessions are started
//! lazily on first use (one-shot) or eagerly with `open` (reusable, flushed by
//! the caller).

use tracing::debug;
use zeroize::Zeroizing;

use super::commands::{FlushContext, StartAuthSession};
use super::constants::*;
use super::crypto;
use super::device::Transport;
use super::error::{Error, Result};
use super::execute::execute;
use super::rc::TpmRc;
use super::types::*;

/// Nonce size used when the caller has no preference
pub const DEFAULT_NONCE_SIZE: usize = 16;

/// An authorization session usable by the command pipeline
pub trait Session {
    /// Start the session on the TPM if it is not active yet
    fn init(&mut self, tpm: &mut dyn Transport) -> Result<()>;
    /// Flush a one-shot session after a failed command
    fn cleanup_failure(&mut self, tpm: &mut dyn Transport) -> Result<()>;
    /// Last nonce received from the TPM
    fn nonce_tpm(&self) -> &[u8];
    /// Draw a fresh caller nonce for the next command
    fn new_nonce_caller(&mut self) -> Result<()>;
    /// Build the authorization block for a command.
    ///
    /// `auth_index` is the zero-based position of this session.
    fn authorize(
        &mut self,
        cc: TpmCc,
        parms: &[u8],
        add_nonces: &[u8],
        names: &[Tpm2bName],
        auth_index: usize,
    ) -> Result<TpmsAuthCommand>;
    /// Check the TPM's authorization block for a response
    fn validate(
        &mut self,
        rc: TpmRc,
        cc: TpmCc,
        parms: &[u8],
        names: &[Tpm2bName],
        auth_index: usize,
        auth: &TpmsAuthResponse,
    ) -> Result<()>;
    /// True if the session encrypts the first response parameter
    fn is_encryption(&self) -> bool;
    /// True if the session encrypts the first command parameter
    fn is_decryption(&self) -> bool;
    /// Encrypt an outgoing parameter in place (decrypt sessions only)
    fn encrypt(&mut self, parameter: &mut [u8]) -> Result<()>;
    /// Decrypt an incoming parameter in place (encrypt sessions only)
    fn decrypt(&mut self, parameter: &mut [u8]) -> Result<()>;
    /// Session handle, `TPM_RH_NULL` if not started
    fn handle(&self) -> u32;
}

/// cpHash = H(commandCode || names || parameters)
pub fn compute_cp_hash(
    alg: TpmAlgId,
    cc: TpmCc,
    names: &[Tpm2bName],
    parms: &[u8],
) -> Result<Vec<u8>> {
    let cc_bytes = cc.to_u32().to_be_bytes();
    let mut parts: Vec<&[u8]> = Vec::with_capacity(names.len() + 2);
    parts.push(&cc_bytes);
    parts.extend(names.iter().map(|n| n.as_bytes()));
    parts.push(parms);
    crypto::hash(alg, &parts)
}

/// rpHash = H(responseCode || commandCode || parameters)
pub fn compute_rp_hash(alg: TpmAlgId, rc: TpmRc, cc: TpmCc, parms: &[u8]) -> Result<Vec<u8>> {
    crypto::hash(
        alg,
        &[
            &rc.to_u32().to_be_bytes(),
            &cc.to_u32().to_be_bytes(),
            parms,
        ],
    )
}

/// Strip trailing zero octets from an auth value before it keys an HMAC
/// (TPM 2.0 Part 1, 19.6.5 Note 2)
pub fn trim_auth(auth: &[u8]) -> &[u8] {
    let end = auth.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &auth[..end]
}

// ==================== Password ====================

/// Password pseudo-session (`TPM_RS_PW`)
#[derive(Clone, Default)]
pub struct PasswordSession {
    auth: Zeroizing<Vec<u8>>,
}

impl PasswordSession {
    pub fn new(auth: &[u8]) -> Self {
        Self {
            auth: Zeroizing::new(auth.to_vec()),
        }
    }

    /// Empty password
    pub fn empty() -> Self {
        Self::default()
    }
}

impl Session for PasswordSession {
    fn init(&mut self, _tpm: &mut dyn Transport) -> Result<()> {
        Ok(())
    }

    fn cleanup_failure(&mut self, _tpm: &mut dyn Transport) -> Result<()> {
        Ok(())
    }

    fn nonce_tpm(&self) -> &[u8] {
        &[]
    }

    fn new_nonce_caller(&mut self) -> Result<()> {
        Ok(())
    }

    fn authorize(
        &mut self,
        _cc: TpmCc,
        _parms: &[u8],
        _add_nonces: &[u8],
        _names: &[Tpm2bName],
        _auth_index: usize,
    ) -> Result<TpmsAuthCommand> {
        Ok(TpmsAuthCommand {
            handle: tpm_rh::PW,
            nonce: Tpm2bNonce::empty(),
            attributes: TpmaSession::new(),
            hmac: Tpm2bAuth::new(self.auth.to_vec()),
        })
    }

    fn validate(
        &mut self,
        _rc: TpmRc,
        _cc: TpmCc,
        _parms: &[u8],
        _names: &[Tpm2bName],
        _auth_index: usize,
        auth: &TpmsAuthResponse,
    ) -> Result<()> {
        if !auth.nonce.is_empty() {
            return Err(Error::UnexpectedPasswordResponse(format!(
                "expected empty nonce in response auth to PW session, got {}",
                hex::encode(auth.nonce.as_bytes())
            )));
        }
        if auth.attributes != TpmaSession::new().with_continue_session() {
            return Err(Error::UnexpectedPasswordResponse(format!(
                "expected only ContinueSession in response auth to PW session, got 0x{:02x}",
                auth.attributes.to_byte()
            )));
        }
        if !auth.hmac.is_empty() {
            return Err(Error::UnexpectedPasswordResponse(format!(
                "expected empty HMAC in response auth to PW session, got {}",
                hex::encode(auth.hmac.as_bytes())
            )));
        }
        Ok(())
    }

    fn is_encryption(&self) -> bool {
        false
    }

    fn is_decryption(&self) -> bool {
        false
    }

    fn encrypt(&mut self, _parameter: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn decrypt(&mut self, _parameter: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn handle(&self) -> u32 {
        tpm_rh::PW
    }
}

// ==================== Options ====================

/// Produces the salt of a salted session and its encryption to the TPM key
/// named by [`SessionOptions::salted`]
pub trait SaltEncapsulator {
    /// Return `(salt, encryptedSalt)`
    fn encapsulate(&mut self) -> Result<(Zeroizing<Vec<u8>>, Tpm2bEncryptedSecret)>;
}

/// Direction of session-based parameter encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterEncryption {
    /// Encrypt the first command parameter (decrypt session)
    EncryptIn,
    /// Encrypt the first response parameter (encrypt session)
    EncryptOut,
    EncryptInOut,
}

struct Bind {
    handle: u32,
    name: Tpm2bName,
    auth: Zeroizing<Vec<u8>>,
}

struct Salt {
    handle: u32,
    encapsulator: Box<dyn SaltEncapsulator>,
}

/// Configuration of an HMAC or policy session
#[derive(Default)]
pub struct SessionOptions {
    auth: Zeroizing<Vec<u8>>,
    password: bool,
    bind: Option<Bind>,
    salt: Option<Salt>,
    attrs: TpmaSession,
    symmetric: TpmtSymDef,
    trial: bool,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prove knowledge of the authorized object's auth value
    pub fn auth(mut self, auth: &[u8]) -> Self {
        self.auth = Zeroizing::new(auth.to_vec());
        self
    }

    /// Policy sessions send the auth value in place of the HMAC.
    /// HMAC sessions treat this like [`auth`](Self::auth).
    pub fn password(mut self, auth: &[u8]) -> Self {
        self.auth = Zeroizing::new(auth.to_vec());
        self.password = true;
        self
    }

    /// Derive the session key from the auth value of `handle`
    pub fn bound(mut self, handle: u32, name: Tpm2bName, auth: &[u8]) -> Self {
        self.bind = Some(Bind {
            handle,
            name,
            auth: Zeroizing::new(auth.to_vec()),
        });
        self
    }

    /// Derive the session key from a salt encrypted to the loaded key `handle`
    pub fn salted(mut self, handle: u32, encapsulator: Box<dyn SaltEncapsulator>) -> Self {
        self.salt = Some(Salt {
            handle,
            encapsulator,
        });
        self
    }

    /// Use AES-CFB parameter encryption with the given key size
    pub fn aes_encryption(mut self, key_bits: u16, direction: ParameterEncryption) -> Self {
        use ParameterEncryption::*;
        self.attrs.decrypt = matches!(direction, EncryptIn | EncryptInOut);
        self.attrs.encrypt = matches!(direction, EncryptOut | EncryptInOut);
        self.symmetric = TpmtSymDef::aes_cfb(key_bits);
        self
    }

    pub fn audit(mut self) -> Self {
        self.attrs.audit = true;
        self
    }

    /// Audit, and assert that no other command was audited in between
    pub fn audit_exclusive(mut self) -> Self {
        self.attrs.audit = true;
        self.attrs.audit_exclusive = true;
        self
    }

    /// Start policy sessions in trial mode. No effect on HMAC sessions.
    pub fn trial(mut self) -> Self {
        self.trial = true;
        self
    }
}

// ==================== Shared session state ====================

pub(crate) type NonceSource = fn(usize) -> Result<Vec<u8>>;

/// State shared by HMAC and policy sessions
struct SessionCore {
    opts: SessionOptions,
    hash: TpmAlgId,
    nonce_size: usize,
    handle: u32,
    session_key: Zeroizing<Vec<u8>>,
    nonce_caller: Vec<u8>,
    nonce_tpm: Vec<u8>,
    nonce_source: NonceSource,
}

impl SessionCore {
    fn new(hash: TpmAlgId, nonce_size: usize, opts: SessionOptions) -> Self {
        Self {
            opts,
            hash,
            nonce_size,
            handle: tpm_rh::NULL,
            session_key: Zeroizing::new(Vec::new()),
            nonce_caller: Vec::new(),
            nonce_tpm: Vec::new(),
            nonce_source: crypto::random_bytes,
        }
    }

    fn is_active(&self) -> bool {
        self.handle != tpm_rh::NULL
    }

    /// TPM2_StartAuthSession and session key derivation (Part 1, 19.6)
    fn start(&mut self, tpm: &mut dyn Transport, session_type: TpmSe) -> Result<()> {
        self.nonce_caller = (self.nonce_source)(self.nonce_size)?;

        let (salt, encrypted_salt) = match self.opts.salt.as_mut() {
            Some(salt) => salt.encapsulator.encapsulate()?,
            None => (Zeroizing::new(Vec::new()), Tpm2bEncryptedSecret::empty()),
        };

        let mut cmd = StartAuthSession {
            tpm_key: TpmHandle(self.opts.salt.as_ref().map_or(tpm_rh::NULL, |s| s.handle)),
            bind: TpmHandle(self.opts.bind.as_ref().map_or(tpm_rh::NULL, |b| b.handle)),
            nonce_caller: Tpm2bNonce::new(self.nonce_caller.clone()),
            encrypted_salt,
            session_type,
            symmetric: self.opts.symmetric,
            auth_hash: self.hash,
        };
        let rsp = execute(tpm, &mut cmd, &mut [])?;
        self.handle = rsp.session_handle;
        self.nonce_tpm = rsp.nonce_tpm.buffer;

        debug!(
            "started {:?} session 0x{:08x} ({:?})",
            session_type, self.handle, self.hash
        );

        if self.opts.bind.is_some() || !salt.is_empty() {
            let mut auth_salt = Zeroizing::new(Vec::new());
            if let Some(bind) = &self.opts.bind {
                auth_salt.extend_from_slice(&bind.auth);
            }
            auth_salt.extend_from_slice(&salt);
            let bits = crypto::digest_size(self.hash)? as u32 * 8;
            self.session_key = Zeroizing::new(crypto::kdfa(
                self.hash,
                &auth_salt,
                "ATH",
                &self.nonce_tpm,
                &self.nonce_caller,
                bits,
            )?);
        }
        Ok(())
    }

    fn cleanup_failure(&mut self, tpm: &mut dyn Transport) -> Result<()> {
        if self.opts.attrs.continue_session || !self.is_active() {
            return Ok(());
        }
        flush_handle(tpm, self.handle)?;
        self.handle = tpm_rh::NULL;
        Ok(())
    }

    fn new_nonce_caller(&mut self) -> Result<()> {
        self.nonce_caller = (self.nonce_source)(self.nonce_caller.len())?;
        Ok(())
    }

    /// sessionKey || trimmed auth, unless the auth is left out
    fn hmac_key(&self, with_auth: bool) -> Zeroizing<Vec<u8>> {
        let mut key = Zeroizing::new(self.session_key.to_vec());
        if with_auth {
            key.extend_from_slice(trim_auth(&self.opts.auth));
        }
        key
    }

    fn command_hmac(
        &self,
        key: &[u8],
        cc: TpmCc,
        parms: &[u8],
        add_nonces: &[u8],
        names: &[Tpm2bName],
    ) -> Result<Vec<u8>> {
        let cp_hash = compute_cp_hash(self.hash, cc, names, parms)?;
        crypto::hmac(
            self.hash,
            key,
            &[
                &cp_hash,
                &self.nonce_caller,
                &self.nonce_tpm,
                add_nonces,
                &[self.opts.attrs.to_byte()],
            ],
        )
    }

    fn check_response_hmac(
        &self,
        key: &[u8],
        rc: TpmRc,
        cc: TpmCc,
        parms: &[u8],
        auth: &TpmsAuthResponse,
    ) -> Result<()> {
        let rp_hash = compute_rp_hash(self.hash, rc, cc, parms)?;
        let mac = crypto::hmac(
            self.hash,
            key,
            &[
                &rp_hash,
                &self.nonce_tpm,
                &self.nonce_caller,
                &[auth.attributes.to_byte()],
            ],
        )?;
        if !crypto::constant_time_eq(&mac, auth.hmac.as_bytes()) {
            return Err(Error::AuthMismatch);
        }
        Ok(())
    }

    fn auth_command(&self, hmac: Vec<u8>) -> TpmsAuthCommand {
        TpmsAuthCommand {
            handle: self.handle,
            nonce: Tpm2bNonce::new(self.nonce_caller.clone()),
            attributes: self.opts.attrs,
            hmac: Tpm2bAuth::new(hmac),
        }
    }

    /// Record the TPM's new nonce and whether it kept the session alive
    fn track_response(&mut self, auth: &TpmsAuthResponse) {
        self.nonce_tpm = auth.nonce.buffer.clone();
        if !auth.attributes.continue_session {
            self.handle = tpm_rh::NULL;
        }
    }

    /// Derive the CFB key and IV (Part 1, 21.1)
    fn parameter_key(&self, newer: &[u8], older: &[u8]) -> Result<(Zeroizing<Vec<u8>>, usize)> {
        let key_bits = match self.opts.symmetric.key_bits {
            TpmuSymKeyBits::Aes(bits) => bits,
            _ => return Err(Error::UnsupportedAlgorithm(self.opts.symmetric.algorithm)),
        };
        if !matches!(key_bits, 128 | 192 | 256) {
            return Err(Error::UnsupportedKeyBits(key_bits));
        }
        let key_bytes = key_bits as usize / 8;
        let mut session_value = Zeroizing::new(self.session_key.to_vec());
        session_value.extend_from_slice(&self.opts.auth);
        let key_iv = crypto::kdfa(
            self.hash,
            &session_value,
            "CFB",
            newer,
            older,
            ((key_bytes + crypto::AES_BLOCK_SIZE) * 8) as u32,
        )?;
        Ok((Zeroizing::new(key_iv), key_bytes))
    }

    fn encrypt(&self, parameter: &mut [u8]) -> Result<()> {
        if !self.opts.attrs.decrypt {
            return Ok(());
        }
        let (key_iv, n) = self.parameter_key(&self.nonce_caller, &self.nonce_tpm)?;
        crypto::cfb_encrypt(&key_iv[..n], &key_iv[n..], parameter)
    }

    fn decrypt(&self, parameter: &mut [u8]) -> Result<()> {
        if !self.opts.attrs.encrypt {
            return Ok(());
        }
        let (key_iv, n) = self.parameter_key(&self.nonce_tpm, &self.nonce_caller)?;
        crypto::cfb_decrypt(&key_iv[..n], &key_iv[n..], parameter)
    }

    fn flush(&mut self, tpm: &mut dyn Transport) -> Result<()> {
        if self.is_active() {
            flush_handle(tpm, self.handle)?;
            self.handle = tpm_rh::NULL;
        }
        Ok(())
    }
}

fn flush_handle(tpm: &mut dyn Transport, handle: u32) -> Result<()> {
    let mut cmd = FlushContext {
        flush_handle: TpmHandle(handle),
    };
    execute(tpm, &mut cmd, &mut [])?;
    debug!("flushed session 0x{:08x}", handle);
    Ok(())
}

// ==================== HMAC ====================

/// HMAC authorization session
pub struct HmacSession {
    core: SessionCore,
}

impl HmacSession {
    /// One-shot session, started on first use and flushed by the TPM after it
    pub fn new(hash: TpmAlgId, nonce_size: usize, opts: SessionOptions) -> Self {
        Self {
            core: SessionCore::new(hash, nonce_size, opts),
        }
    }

    /// Reusable session, started immediately. Close it with [`flush`](Self::flush).
    pub fn open(
        tpm: &mut dyn Transport,
        hash: TpmAlgId,
        nonce_size: usize,
        opts: SessionOptions,
    ) -> Result<Self> {
        let mut session = Self::new(hash, nonce_size, opts);
        session.core.opts.attrs.continue_session = true;
        session.init(tpm)?;
        Ok(session)
    }

    /// Flush the session from the TPM
    pub fn flush(mut self, tpm: &mut dyn Transport) -> Result<()> {
        self.core.flush(tpm)
    }

    #[cfg(test)]
    pub(crate) fn with_nonce_source(mut self, source: NonceSource) -> Self {
        self.core.nonce_source = source;
        self
    }

    /// The auth value is left out of the HMAC key when authorizing the
    /// entity the session is bound to
    fn includes_auth(&self, names: &[Tpm2bName], auth_index: usize) -> bool {
        match &self.core.opts.bind {
            Some(bind) if !bind.name.is_empty() => names
                .get(auth_index)
                .map_or(true, |name| name.as_bytes() != bind.name.as_bytes()),
            _ => true,
        }
    }
}

impl Session for HmacSession {
    fn init(&mut self, tpm: &mut dyn Transport) -> Result<()> {
        if self.core.is_active() {
            return Ok(());
        }
        self.core.start(tpm, TpmSe::Hmac)
    }

    fn cleanup_failure(&mut self, tpm: &mut dyn Transport) -> Result<()> {
        self.core.cleanup_failure(tpm)
    }

    fn nonce_tpm(&self) -> &[u8] {
        &self.core.nonce_tpm
    }

    fn new_nonce_caller(&mut self) -> Result<()> {
        self.core.new_nonce_caller()
    }

    fn authorize(
        &mut self,
        cc: TpmCc,
        parms: &[u8],
        add_nonces: &[u8],
        names: &[Tpm2bName],
        auth_index: usize,
    ) -> Result<TpmsAuthCommand> {
        if !self.core.is_active() {
            return Err(Error::SessionNotInitialized);
        }
        let key = self.core.hmac_key(self.includes_auth(names, auth_index));
        let hmac = self.core.command_hmac(&key, cc, parms, add_nonces, names)?;
        Ok(self.core.auth_command(hmac))
    }

    fn validate(
        &mut self,
        rc: TpmRc,
        cc: TpmCc,
        parms: &[u8],
        names: &[Tpm2bName],
        auth_index: usize,
        auth: &TpmsAuthResponse,
    ) -> Result<()> {
        self.core.track_response(auth);
        let key = self.core.hmac_key(self.includes_auth(names, auth_index));
        self.core.check_response_hmac(&key, rc, cc, parms, auth)
    }

    fn is_encryption(&self) -> bool {
        self.core.opts.attrs.encrypt
    }

    fn is_decryption(&self) -> bool {
        self.core.opts.attrs.decrypt
    }

    fn encrypt(&mut self, parameter: &mut [u8]) -> Result<()> {
        self.core.encrypt(parameter)
    }

    fn decrypt(&mut self, parameter: &mut [u8]) -> Result<()> {
        self.core.decrypt(parameter)
    }

    fn handle(&self) -> u32 {
        self.core.handle
    }
}

// ==================== Policy ====================

/// Runs the policy commands of a freshly started policy session.
///
/// Receives the transport, the session handle and the session's nonceTPM.
pub type PolicyCallback = Box<dyn FnMut(&mut dyn Transport, u32, &[u8]) -> Result<()>>;

/// Policy authorization session
pub struct PolicySession {
    core: SessionCore,
    callback: Option<PolicyCallback>,
}

impl PolicySession {
    /// One-shot session; `callback` satisfies the policy each time the
    /// session is started
    pub fn new(
        hash: TpmAlgId,
        nonce_size: usize,
        callback: PolicyCallback,
        opts: SessionOptions,
    ) -> Self {
        Self {
            core: SessionCore::new(hash, nonce_size, opts),
            callback: Some(callback),
        }
    }

    /// Reusable session, started immediately. The caller runs policy
    /// commands against [`handle`](Session::handle) and closes it with
    /// [`flush`](Self::flush). The TPM resets the policy after each use.
    pub fn open(
        tpm: &mut dyn Transport,
        hash: TpmAlgId,
        nonce_size: usize,
        opts: SessionOptions,
    ) -> Result<Self> {
        let mut session = Self {
            core: SessionCore::new(hash, nonce_size, opts),
            callback: None,
        };
        session.core.opts.attrs.continue_session = true;
        session.init(tpm)?;
        Ok(session)
    }

    /// Flush the session from the TPM
    pub fn flush(mut self, tpm: &mut dyn Transport) -> Result<()> {
        self.core.flush(tpm)
    }
}

impl Session for PolicySession {
    fn init(&mut self, tpm: &mut dyn Transport) -> Result<()> {
        if self.core.is_active() {
            return Ok(());
        }
        let session_type = if self.core.opts.trial {
            TpmSe::Trial
        } else {
            TpmSe::Policy
        };
        self.core.start(tpm, session_type)?;

        if let Some(callback) = self.callback.as_mut() {
            callback(tpm, self.core.handle, &self.core.nonce_tpm)
                .map_err(|e| Error::Policy(Box::new(e)))?;
        }
        Ok(())
    }

    fn cleanup_failure(&mut self, tpm: &mut dyn Transport) -> Result<()> {
        self.core.cleanup_failure(tpm)
    }

    fn nonce_tpm(&self) -> &[u8] {
        &self.core.nonce_tpm
    }

    fn new_nonce_caller(&mut self) -> Result<()> {
        self.core.new_nonce_caller()
    }

    fn authorize(
        &mut self,
        cc: TpmCc,
        parms: &[u8],
        add_nonces: &[u8],
        names: &[Tpm2bName],
        _auth_index: usize,
    ) -> Result<TpmsAuthCommand> {
        if !self.core.is_active() {
            return Err(Error::SessionNotInitialized);
        }
        let hmac = if self.core.opts.password {
            self.core.opts.auth.to_vec()
        } else {
            let key = self.core.hmac_key(true);
            self.core.command_hmac(&key, cc, parms, add_nonces, names)?
        };
        Ok(self.core.auth_command(hmac))
    }

    fn validate(
        &mut self,
        rc: TpmRc,
        cc: TpmCc,
        parms: &[u8],
        _names: &[Tpm2bName],
        _auth_index: usize,
        auth: &TpmsAuthResponse,
    ) -> Result<()> {
        self.core.track_response(auth);
        if self.core.opts.password {
            if !auth.nonce.is_empty() {
                return Err(Error::UnexpectedPasswordResponse(format!(
                    "expected empty nonce in response auth to PW policy, got {}",
                    hex::encode(auth.nonce.as_bytes())
                )));
            }
            if !auth.hmac.is_empty() {
                return Err(Error::UnexpectedPasswordResponse(format!(
                    "expected empty HMAC in response auth to PW policy, got {}",
                    hex::encode(auth.hmac.as_bytes())
                )));
            }
            return Ok(());
        }
        let key = self.core.hmac_key(true);
        self.core.check_response_hmac(&key, rc, cc, parms, auth)
    }

    fn is_encryption(&self) -> bool {
        self.core.opts.attrs.encrypt
    }

    fn is_decryption(&self) -> bool {
        self.core.opts.attrs.decrypt
    }

    fn encrypt(&mut self, parameter: &mut [u8]) -> Result<()> {
        self.core.encrypt(parameter)
    }

    fn decrypt(&mut self, parameter: &mut [u8]) -> Result<()> {
        self.core.decrypt(parameter)
    }

    fn handle(&self) -> u32 {
        self.core.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Put a session into the active state without talking to a TPM
    fn activate(core: &mut SessionCore, handle: u32) {
        core.handle = handle;
        core.nonce_caller = vec![0x11; 16];
        core.nonce_tpm = vec![0x22; 16];
    }

    fn key_name() -> Tpm2bName {
        let mut name = vec![0x00, 0x0B];
        name.extend([0xAA; 32]);
        Tpm2bName::new(name)
    }

    const HMAC_PARMS: [u8; 8] = [0x00, 0x04, b'a', b'b', b'c', b'd', 0x00, 0x0B];

    #[test]
    fn test_trim_auth() {
        assert_eq!(trim_auth(b"abc\0\0"), b"abc");
        assert_eq!(trim_auth(b"a\0b"), b"a\0b");
        assert_eq!(trim_auth(b"a\0b\0"), b"a\0b");
        assert_eq!(trim_auth(b"\0\0"), b"");
        assert_eq!(trim_auth(b""), b"");
    }

    #[test]
    fn test_hmac_session_known_vector() {
        let mut session = HmacSession::new(
            TpmAlgId::Sha256,
            16,
            SessionOptions::new().auth(b"secret"),
        );
        activate(&mut session.core, 0x02000000);

        let auth = session
            .authorize(TpmCc::Hmac, &HMAC_PARMS, &[], &[key_name()], 0)
            .unwrap();
        assert_eq!(auth.handle, 0x02000000);
        assert_eq!(auth.nonce.as_bytes(), &[0x11; 16]);
        assert_eq!(auth.attributes.to_byte(), 0x00);
        assert_eq!(
            hex::encode(auth.hmac.as_bytes()),
            "3cecc7375118a7c431e761533aa554b4fc4d2c0617c285d605962a4b5b8a05cf"
        );
    }

    #[test]
    fn test_auth_trailing_zeros_ignored() {
        let mut plain = HmacSession::new(TpmAlgId::Sha256, 16, SessionOptions::new().auth(b"secret"));
        let mut padded = HmacSession::new(
            TpmAlgId::Sha256,
            16,
            SessionOptions::new().auth(b"secret\0\0"),
        );
        activate(&mut plain.core, 0x02000000);
        activate(&mut padded.core, 0x02000000);
        let a = plain
            .authorize(TpmCc::Hmac, &HMAC_PARMS, &[], &[key_name()], 0)
            .unwrap();
        let b = padded
            .authorize(TpmCc::Hmac, &HMAC_PARMS, &[], &[key_name()], 0)
            .unwrap();
        assert_eq!(a.hmac, b.hmac);
    }

    #[test]
    fn test_bound_session_omits_auth_for_bind_target() {
        let opts = SessionOptions::new()
            .auth(b"secret")
            .bound(0x81000001, key_name(), b"secret");
        let mut bound = HmacSession::new(TpmAlgId::Sha256, 16, opts);
        activate(&mut bound.core, 0x02000001);
        let mut unbound = HmacSession::new(TpmAlgId::Sha256, 16, SessionOptions::new());
        activate(&mut unbound.core, 0x02000001);

        // Same (empty) session key, auth left out for the bind target
        let a = bound
            .authorize(TpmCc::Hmac, &HMAC_PARMS, &[], &[key_name()], 0)
            .unwrap();
        let b = unbound
            .authorize(TpmCc::Hmac, &HMAC_PARMS, &[], &[key_name()], 0)
            .unwrap();
        assert_eq!(a.hmac, b.hmac);

        // Any other entity includes the auth
        let other = Tpm2bName::new(vec![0x40, 0x00, 0x00, 0x01]);
        let c = bound
            .authorize(TpmCc::Hmac, &HMAC_PARMS, &[], &[other.clone()], 0)
            .unwrap();
        let d = unbound
            .authorize(TpmCc::Hmac, &HMAC_PARMS, &[], &[other], 0)
            .unwrap();
        assert_ne!(c.hmac, d.hmac);
    }

    #[test]
    fn test_uninitialized_session_cannot_authorize() {
        let mut session = HmacSession::new(TpmAlgId::Sha256, 16, SessionOptions::new());
        let err = session
            .authorize(TpmCc::Hmac, &[], &[], &[], 0)
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotInitialized));
    }

    #[test]
    fn test_nonce_rotation() {
        let mut session = HmacSession::new(TpmAlgId::Sha256, 16, SessionOptions::new());
        activate(&mut session.core, 0x02000000);
        session.core.opts.attrs.continue_session = true;

        session.new_nonce_caller().unwrap();
        assert_eq!(session.core.nonce_caller.len(), 16);
        assert_ne!(session.core.nonce_caller, vec![0x11; 16]);

        let rp_hash = compute_rp_hash(TpmAlgId::Sha256, TpmRc::SUCCESS, TpmCc::Hmac, &[]).unwrap();
        let new_nonce = vec![0x44; 16];
        let attrs = TpmaSession::new().with_continue_session();
        let hmac = crypto::hmac(
            TpmAlgId::Sha256,
            &[],
            &[
                &rp_hash,
                &new_nonce,
                &session.core.nonce_caller,
                &[attrs.to_byte()],
            ],
        )
        .unwrap();
        let response = TpmsAuthResponse {
            nonce: Tpm2bNonce::new(new_nonce.clone()),
            attributes: attrs,
            hmac: Tpm2bAuth::new(hmac),
        };
        session
            .validate(TpmRc::SUCCESS, TpmCc::Hmac, &[], &[], 0, &response)
            .unwrap();
        assert_eq!(session.nonce_tpm(), new_nonce.as_slice());
        assert_eq!(session.handle(), 0x02000000);
    }

    #[test]
    fn test_validate_wrong_hmac_and_auto_flush() {
        let mut session = HmacSession::new(TpmAlgId::Sha256, 16, SessionOptions::new());
        activate(&mut session.core, 0x02000000);
        let response = TpmsAuthResponse {
            nonce: Tpm2bNonce::new(vec![0x44; 16]),
            attributes: TpmaSession::new(),
            hmac: Tpm2bAuth::new(vec![0u8; 32]),
        };
        let err = session
            .validate(TpmRc::SUCCESS, TpmCc::Hmac, &[], &[], 0, &response)
            .unwrap_err();
        assert!(err.is_auth_mismatch());
        // continueSession was clear, so the TPM flushed the session
        assert_eq!(session.handle(), tpm_rh::NULL);
    }

    #[test]
    fn test_password_validate_rejects_unexpected_fields() {
        let mut pw = PasswordSession::new(b"pw");
        let good = TpmsAuthResponse {
            nonce: Tpm2bNonce::empty(),
            attributes: TpmaSession::new().with_continue_session(),
            hmac: Tpm2bAuth::empty(),
        };
        pw.validate(TpmRc::SUCCESS, TpmCc::NvRead, &[], &[], 0, &good)
            .unwrap();

        let cases = [
            TpmsAuthResponse {
                nonce: Tpm2bNonce::new(vec![1]),
                ..good.clone()
            },
            TpmsAuthResponse {
                attributes: TpmaSession {
                    audit: true,
                    ..good.attributes
                },
                ..good.clone()
            },
            TpmsAuthResponse {
                attributes: TpmaSession::new(),
                ..good.clone()
            },
            TpmsAuthResponse {
                hmac: Tpm2bAuth::new(vec![0xFF]),
                ..good.clone()
            },
        ];
        for response in &cases {
            let err = pw
                .validate(TpmRc::SUCCESS, TpmCc::NvRead, &[], &[], 0, response)
                .unwrap_err();
            assert!(matches!(err, Error::UnexpectedPasswordResponse(_)));
        }
    }

    #[test]
    fn test_password_authorize() {
        let mut pw = PasswordSession::new(b"owner");
        let auth = pw.authorize(TpmCc::NvRead, &[], &[], &[], 0).unwrap();
        assert_eq!(auth.handle, tpm_rh::PW);
        assert!(auth.nonce.is_empty());
        assert_eq!(auth.attributes.to_byte(), 0);
        assert_eq!(auth.hmac.as_bytes(), b"owner");
    }

    #[test]
    fn test_policy_password_mode() {
        let mut session = PolicySession::new(
            TpmAlgId::Sha256,
            16,
            Box::new(|_: &mut dyn Transport, _: u32, _: &[u8]| Ok(())),
            SessionOptions::new().password(b"pw"),
        );
        activate(&mut session.core, 0x03000000);
        let auth = session
            .authorize(TpmCc::NvRead, &[], &[], &[], 0)
            .unwrap();
        assert_eq!(auth.hmac.as_bytes(), b"pw");

        let response = TpmsAuthResponse {
            nonce: Tpm2bNonce::new(vec![0x01]),
            attributes: TpmaSession::new(),
            hmac: Tpm2bAuth::empty(),
        };
        assert!(matches!(
            session.validate(TpmRc::SUCCESS, TpmCc::NvRead, &[], &[], 0, &response),
            Err(Error::UnexpectedPasswordResponse(_))
        ));
    }

    #[test]
    fn test_parameter_encryption_inverts() {
        let opts = SessionOptions::new()
            .auth(b"secret")
            .aes_encryption(128, ParameterEncryption::EncryptInOut);
        let mut session = HmacSession::new(TpmAlgId::Sha256, 16, opts);
        activate(&mut session.core, 0x02000000);
        assert!(session.is_encryption());
        assert!(session.is_decryption());

        let plain = b"sensitive parameter".to_vec();
        let mut data = plain.clone();
        session.encrypt(&mut data).unwrap();
        assert_ne!(data, plain);

        // The TPM decrypts with the nonces in command order; a response
        // keyed with the roles swapped reverses the command encryption.
        std::mem::swap(&mut session.core.nonce_caller, &mut session.core.nonce_tpm);
        session.decrypt(&mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn test_parameter_encryption_requires_aes() {
        let mut session = HmacSession::new(
            TpmAlgId::Sha256,
            16,
            SessionOptions::new().aes_encryption(100, ParameterEncryption::EncryptIn),
        );
        activate(&mut session.core, 0x02000000);
        let mut data = [0u8; 4];
        assert!(matches!(
            session.encrypt(&mut data),
            Err(Error::UnsupportedKeyBits(100))
        ));
        // Not an encrypt session, so responses are left alone
        session.decrypt(&mut data).unwrap();
        assert_eq!(data, [0u8; 4]);
    }

    #[test]
    fn test_options() {
        let opts = SessionOptions::new().audit_exclusive().trial();
        assert!(opts.attrs.audit);
        assert!(opts.attrs.audit_exclusive);
        assert!(opts.trial);
        assert!(opts.symmetric.is_null());
        assert!(opts.bind.is_none());
        assert!(opts.salt.is_none());
    }
}
