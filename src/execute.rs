// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command execution pipeline
//!
//! Commands describe their handles and parameters through [`Command::parts`];
//! [`execute`] collects sessions, marshals and authorizes the command, sends
//! it and validates and unmarshals the response.

use tracing::{debug, trace, warn};

use super::constants::*;
use super::device::{finalize_command, put_command_header, ResponseHeader, Transport, HEADER_SIZE};
use super::error::{Error, Result};
use super::marshal::*;
use super::rc::TpmRc;
use super::session::{compute_cp_hash, PasswordSession, Session};
use super::types::*;

/// Maximum number of sessions in one command
pub const MAX_SESSIONS: usize = 3;

/// How a command handle is authorized
pub enum HandleAuth<'a> {
    /// Not an authorization slot
    None,
    /// Empty password
    Implicit,
    Session(&'a mut dyn Session),
    /// Authorization slot with no session supplied
    Missing,
}

/// A handle in the command's handle area
pub struct HandleEntry<'a> {
    pub value: u32,
    /// Zero is sent as `TPM_RH_NULL`
    pub nullable: bool,
    /// Explicit Name; handles with a known Name may leave this empty
    pub name: Option<Tpm2bName>,
    pub auth: HandleAuth<'a>,
}

impl<'a> HandleEntry<'a> {
    pub fn plain(handle: u32) -> Self {
        Self {
            value: handle,
            nullable: false,
            name: None,
            auth: HandleAuth::None,
        }
    }

    pub fn nullable(handle: u32) -> Self {
        Self {
            nullable: true,
            ..Self::plain(handle)
        }
    }

    pub fn named(handle: &NamedHandle) -> Self {
        Self {
            name: Some(handle.name.clone()),
            ..Self::plain(handle.handle)
        }
    }

    /// An authorization slot
    pub fn authorized(entity: &'a mut AuthEntity<'_>) -> Self {
        match entity {
            AuthEntity::Handle(h) => Self {
                auth: HandleAuth::Implicit,
                ..Self::plain(h.0)
            },
            AuthEntity::Named(h) => Self {
                auth: HandleAuth::Implicit,
                ..Self::named(h)
            },
            AuthEntity::Authorized(h) => Self {
                value: h.handle,
                nullable: false,
                name: h.name.clone(),
                auth: match h.auth.as_mut() {
                    Some(session) => HandleAuth::Session(&mut **session),
                    None => HandleAuth::Missing,
                },
            },
        }
    }
}

/// Borrowed view of a command's handle and parameter areas
pub struct CommandParts<'a> {
    pub handles: Vec<HandleEntry<'a>>,
    pub parameters: Vec<&'a dyn Marshal>,
}

/// A TPM command record
pub trait Command {
    type Response: Response;
    const COMMAND_CODE: TpmCc;

    /// Handles in field order, then parameters in field order
    fn parts(&mut self) -> CommandParts<'_>;
}

/// A TPM response record
pub trait Response: Sized {
    /// Number of handles in the response handle area
    const NUM_HANDLES: usize = 0;
    /// Whether the first response parameter is a sized buffer.
    /// `None` falls back to a length-plausibility check.
    const FIRST_PARAM_SIZED: Option<bool> = None;

    fn from_parts(handles: &[u32], params: &mut ResponseBuffer) -> Result<Self>;

    /// Response parameters in field order
    fn parameters(&self) -> Vec<&dyn Marshal>;
}

/// Session used by one execution: caller-owned or an implicit password
enum SessionSlot<'s> {
    Borrowed(&'s mut dyn Session),
    Implicit(PasswordSession),
}

impl SessionSlot<'_> {
    fn peek(&self) -> &dyn Session {
        match self {
            SessionSlot::Borrowed(session) => &**session,
            SessionSlot::Implicit(session) => session,
        }
    }

    fn get(&mut self) -> &mut dyn Session {
        match self {
            SessionSlot::Borrowed(session) => &mut **session,
            SessionSlot::Implicit(session) => session,
        }
    }
}

/// Handle area after nullable normalization
struct Handles {
    values: Vec<u32>,
    names: Vec<Option<Tpm2bName>>,
}

impl Handles {
    fn marshal(&self, buf: &mut CommandBuffer) {
        for value in &self.values {
            buf.put_u32(*value);
        }
    }

    fn names(&self) -> Result<Vec<Tpm2bName>> {
        self.names
            .iter()
            .enumerate()
            .map(|(index, name)| name.clone().ok_or(Error::MissingName { index }))
            .collect()
    }
}

/// Split command parts into normalized handles and the session list
fn collect<'a>(
    handles: Vec<HandleEntry<'a>>,
    sessions: &mut Vec<SessionSlot<'a>>,
) -> Result<Handles> {
    let mut out = Handles {
        values: Vec::with_capacity(handles.len()),
        names: Vec::with_capacity(handles.len()),
    };
    for (index, entry) in handles.into_iter().enumerate() {
        let value = if entry.nullable {
            nullable_handle(entry.value)
        } else {
            entry.value
        };
        out.values.push(value);
        out.names
            .push(entry.name.or_else(|| TpmHandle(value).known_name()));
        match entry.auth {
            HandleAuth::None => {}
            HandleAuth::Implicit => sessions.push(SessionSlot::Implicit(PasswordSession::empty())),
            HandleAuth::Session(session) => sessions.push(SessionSlot::Borrowed(session)),
            HandleAuth::Missing => return Err(Error::MissingAuth { index }),
        }
    }
    Ok(out)
}

/// At most one session may encrypt and one may decrypt, across all sessions
fn check_parameter_encryption(sessions: &[SessionSlot<'_>]) -> Result<()> {
    let mut encrypt = false;
    let mut decrypt = false;
    for slot in sessions {
        let session = slot.peek();
        if session.is_encryption() {
            if encrypt {
                return Err(Error::TooManyEncryptSessions);
            }
            encrypt = true;
        }
        if session.is_decryption() {
            if decrypt {
                return Err(Error::TooManyDecryptSessions);
            }
            decrypt = true;
        }
    }
    Ok(())
}

/// Marshal the parameter area, encrypting the first parameter if a decrypt
/// session is present
fn marshal_parameters(
    parameters: &[&dyn Marshal],
    sessions: &mut [SessionSlot<'_>],
) -> Result<Vec<u8>> {
    let Some((first, rest)) = parameters.split_first() else {
        return Ok(Vec::new());
    };

    let mut buf = CommandBuffer::new();
    first.marshal(&mut buf)?;

    let decrypt = sessions
        .iter_mut()
        .enumerate()
        .find(|(_, slot)| slot.peek().is_decryption());
    if let Some((i, slot)) = decrypt {
        if buf.len() < 2 {
            return Err(Error::FirstParameterNotSized);
        }
        slot.get()
            .encrypt(&mut buf.as_mut_bytes()[2..])
            .map_err(|e| e.in_session("encrypting with", i))?;
    }

    for parameter in rest {
        parameter.marshal(&mut buf)?;
    }
    Ok(buf.into_vec())
}

/// Build the authorization area, including its size prefix
fn marshal_sessions(
    sessions: &mut [SessionSlot<'_>],
    cc: TpmCc,
    names: &[Tpm2bName],
    parms: &[u8],
) -> Result<Vec<u8>> {
    // The first session's HMAC also covers the nonceTPM of any later
    // encrypt and decrypt sessions. A session doing both counts once.
    let mut enc_nonce: Option<Vec<u8>> = None;
    let mut dec_nonce: Option<Vec<u8>> = None;
    for slot in sessions.iter_mut().skip(1) {
        let session = slot.get();
        if session.is_encryption() {
            enc_nonce = Some(session.nonce_tpm().to_vec());
        } else if session.is_decryption() {
            dec_nonce = Some(session.nonce_tpm().to_vec());
        }
    }

    let mut buf = CommandBuffer::new();
    buf.put_u32(0); // Size placeholder
    for (i, slot) in sessions.iter_mut().enumerate() {
        let mut add_nonces = Vec::new();
        if i == 0 {
            add_nonces.extend(dec_nonce.iter().flatten());
            add_nonces.extend(enc_nonce.iter().flatten());
        }
        let auth = slot
            .get()
            .authorize(cc, parms, &add_nonces, names, i)
            .map_err(|e| e.in_session("authorizing", i))?;
        auth.marshal(&mut buf)?;
    }
    let size = (buf.len() - 4) as u32;
    buf.update_u32(0, size);
    Ok(buf.into_vec())
}

/// Decrypt the first response parameter with any encrypt session
fn decrypt_parameters<R: Response>(
    parms: &mut [u8],
    sessions: &mut [SessionSlot<'_>],
) -> Result<()> {
    if !sessions.iter_mut().any(|s| s.get().is_encryption()) {
        return Ok(());
    }
    let plausible = parms.len() >= 2 && {
        let len = u16::from_be_bytes([parms[0], parms[1]]) as usize;
        len + 2 <= parms.len()
    };
    let sized = match R::FIRST_PARAM_SIZED {
        Some(sized) => sized,
        None => {
            warn!(
                "response does not declare its first parameter shape, guessing sized={}",
                plausible
            );
            plausible
        }
    };
    if !sized {
        return Ok(());
    }
    if !plausible {
        return Err(Error::Underflow {
            what: "encrypted response parameter",
            needed: parms
                .get(..2)
                .map_or(2, |b| u16::from_be_bytes([b[0], b[1]]) as usize + 2),
            remaining: parms.len(),
        });
    }
    let len = u16::from_be_bytes([parms[0], parms[1]]) as usize;
    for (i, slot) in sessions.iter_mut().enumerate() {
        let session = slot.get();
        if session.is_encryption() {
            session
                .decrypt(&mut parms[2..2 + len])
                .map_err(|e| e.in_session("decrypting with", i))?;
        }
    }
    Ok(())
}

/// Execute a command, authorizing it with the sessions named by its handles
/// plus `extra` (audit or encryption sessions).
///
/// Any failure once sessions are in play gives one-shot sessions a
/// best-effort flush; cleanup errors are attached to the original error.
pub fn execute<C: Command>(
    tpm: &mut dyn Transport,
    cmd: &mut C,
    extra: &mut [&mut dyn Session],
) -> Result<C::Response> {
    let CommandParts {
        handles,
        parameters,
    } = cmd.parts();

    let mut sessions: Vec<SessionSlot<'_>> = Vec::new();
    let handles = collect(handles, &mut sessions)?;
    for session in extra.iter_mut() {
        sessions.push(SessionSlot::Borrowed(&mut **session));
    }
    if sessions.len() > MAX_SESSIONS {
        return Err(Error::TooManySessions(sessions.len()));
    }
    check_parameter_encryption(&sessions)?;

    match run::<C>(tpm, &handles, &parameters, &mut sessions) {
        Ok(rsp) => Ok(rsp),
        Err(err) => Err(cleanup_failure(tpm, &mut sessions, err)),
    }
}

/// Give every session a chance to release TPM resources after `err`
fn cleanup_failure(
    tpm: &mut dyn Transport,
    sessions: &mut [SessionSlot<'_>],
    err: Error,
) -> Error {
    let cleanup: Vec<Error> = sessions
        .iter_mut()
        .filter_map(|slot| slot.get().cleanup_failure(tpm).err())
        .collect();
    if cleanup.is_empty() {
        return err;
    }
    Error::WithCleanup {
        source: Box::new(err),
        cleanup,
    }
}

fn run<C: Command>(
    tpm: &mut dyn Transport,
    handles: &Handles,
    parameters: &[&dyn Marshal],
    sessions: &mut [SessionSlot<'_>],
) -> Result<C::Response> {
    let cc = C::COMMAND_CODE;
    let has_sessions = !sessions.is_empty();

    for (i, slot) in sessions.iter_mut().enumerate() {
        let session = slot.get();
        session
            .init(tpm)
            .map_err(|e| e.in_session("initializing", i))?;
        session
            .new_nonce_caller()
            .map_err(|e| e.in_session("initializing", i))?;
    }

    let parms = marshal_parameters(parameters, sessions)?;

    let mut names = Vec::new();
    let mut auth_area = Vec::new();
    if has_sessions {
        names = handles.names()?;
        auth_area = marshal_sessions(sessions, cc, &names, &parms)?;
    }

    let tag = if has_sessions {
        TpmSt::Sessions
    } else {
        TpmSt::NoSessions
    };
    let mut buf = CommandBuffer::with_capacity(HEADER_SIZE + auth_area.len() + parms.len() + 12);
    put_command_header(&mut buf, tag, cc);
    handles.marshal(&mut buf);
    buf.put_bytes(&auth_area);
    buf.put_bytes(&parms);
    let command = finalize_command(buf);

    debug!(
        "executing {:?} with {} session(s), {} bytes",
        cc,
        sessions.len(),
        command.len()
    );
    trace!("command: {}", hex::encode(&command));

    let response = tpm.send(&command)?;
    trace!("response: {}", hex::encode(&response));

    let header = ResponseHeader::parse(&response)?;
    if !header.is_success() {
        debug!("{:?} failed: {}", cc, header.response_code);
        return Err(Error::Tpm(header.response_code));
    }

    let mut rsp = ResponseBuffer::new(&response[HEADER_SIZE..]);
    let rsp_handles = (0..C::Response::NUM_HANDLES)
        .map(|_| rsp.get_u32())
        .collect::<Result<Vec<_>>>()?;

    let mut rsp_parms = if has_sessions {
        let declared = rsp.get_u32()?;
        if declared as usize > rsp.remaining() {
            return Err(Error::ParameterAreaOverflow {
                declared,
                available: rsp.remaining(),
            });
        }
        rsp.get_bytes(declared as usize)?
    } else {
        rsp.get_remaining()
    };

    for (i, slot) in sessions.iter_mut().enumerate() {
        let auth = TpmsAuthResponse::unmarshal(&mut rsp)
            .map_err(|e| e.in_session("reading auth", i))?;
        slot.get()
            .validate(TpmRc::SUCCESS, cc, &rsp_parms, &names, i, &auth)
            .map_err(|e| e.in_session("validating auth", i))?;
    }
    if !rsp.is_empty() {
        return Err(Error::TrailingResponseBytes(rsp.remaining()));
    }

    decrypt_parameters::<C::Response>(&mut rsp_parms, sessions)?;

    let mut params = ResponseBuffer::new(&rsp_parms);
    C::Response::from_parts(&rsp_handles, &mut params)
}

/// Handle Names and plaintext parameter area of a command
pub(crate) fn command_area<C: Command>(cmd: &mut C) -> Result<(Vec<Tpm2bName>, Vec<u8>)> {
    let CommandParts {
        handles,
        parameters,
    } = cmd.parts();
    let mut sessions = Vec::new();
    let handles = collect(handles, &mut sessions)?;
    let names = handles.names()?;
    let parms = marshal_parameters(&parameters, &mut [])?;
    Ok((names, parms))
}

/// cpHash of a command as it would be sent without parameter encryption.
///
/// Every handle must have a known or explicit Name.
pub fn cp_hash<C: Command>(alg: TpmAlgId, cmd: &mut C) -> Result<Vec<u8>> {
    let (names, parms) = command_area(cmd)?;
    compute_cp_hash(alg, C::COMMAND_CODE, &names, &parms)
}
