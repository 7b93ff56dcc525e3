// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error types

use thiserror::Error;

use super::rc::TpmRc;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    // ==================== Codec ====================
    #[error("buffer underflow reading {what}: need {needed} bytes, {remaining} remaining")]
    Underflow {
        what: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("{ty}.{field}: {source}")]
    Field {
        ty: &'static str,
        field: &'static str,
        source: Box<Error>,
    },
    #[error("no union member for tag 0x{selector:x} in {union}")]
    UnknownSelector { union: &'static str, selector: u64 },
    #[error("{union} does not hold the member for tag 0x{selector:x}")]
    SelectorMismatch { union: &'static str, selector: u64 },
    #[error("{extra} unexpected trailing bytes in sized {ty}")]
    TrailingBytes { ty: &'static str, extra: usize },
    #[error("list length {len} exceeds maximum of {max}")]
    ListTooLong { len: u32, max: u32 },
    #[error("{len} bytes do not fit a {max}-byte sized field")]
    SizeOverflow { len: usize, max: usize },
    #[error("invalid {what}: 0x{value:x}")]
    InvalidValue { what: &'static str, value: u64 },

    // ==================== Protocol ====================
    #[error("too many sessions: {0}")]
    TooManySessions(usize),
    #[error("too many encrypt sessions")]
    TooManyEncryptSessions,
    #[error("too many decrypt sessions")]
    TooManyDecryptSessions,
    #[error("missing auth for handle {index}")]
    MissingAuth { index: usize },
    #[error("missing Name for handle {index}")]
    MissingName { index: usize },
    #[error("session not initialized")]
    SessionNotInitialized,
    #[error("this command's first parameter is not a tpm2b")]
    FirstParameterNotSized,
    #[error("incorrect authorization HMAC")]
    AuthMismatch,
    #[error("unexpected response auth for password session: {0}")]
    UnexpectedPasswordResponse(String),
    #[error(
        "response indicated {declared} bytes of parameters but there were only {available} more bytes of response"
    )]
    ParameterAreaOverflow { declared: u32, available: usize },
    #[error("{0} unaccounted-for bytes at the end of the TPM response")]
    TrailingResponseBytes(usize),
    #[error("invalid response header: {0}")]
    InvalidResponseHeader(String),
    #[error("response size {declared} does not match {actual} bytes received")]
    ResponseSizeMismatch { declared: u32, actual: usize },
    #[error("{stage} session {index}: {source}")]
    Session {
        stage: &'static str,
        index: usize,
        source: Box<Error>,
    },
    #[error("executing policy: {0}")]
    Policy(#[source] Box<Error>),

    // ==================== TPM ====================
    #[error("{0}")]
    Tpm(TpmRc),
    #[error("{source} - additional errors encountered during cleanup: {}", join_errors(.cleanup))]
    WithCleanup {
        source: Box<Error>,
        cleanup: Vec<Error>,
    },

    // ==================== Crypto ====================
    #[error("unsupported algorithm: 0x{0:04x}")]
    UnsupportedAlgorithm(u16),
    #[error("unsupported symmetric key size: {0} bits")]
    UnsupportedKeyBits(u16),
    #[error("random source failed: {0}")]
    Random(#[from] rand::Error),

    // ==================== Transport ====================
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    pub(crate) fn in_field(self, ty: &'static str, field: &'static str) -> Self {
        Error::Field {
            ty,
            field,
            source: Box::new(self),
        }
    }

    pub(crate) fn in_session(self, stage: &'static str, index: usize) -> Self {
        Error::Session {
            stage,
            index,
            source: Box::new(self),
        }
    }

    /// The innermost error, past field/session/cleanup context
    pub fn root(&self) -> &Error {
        match self {
            Error::Field { source, .. }
            | Error::Session { source, .. }
            | Error::WithCleanup { source, .. }
            | Error::Policy(source) => source.root(),
            other => other,
        }
    }

    /// Response code if the TPM rejected the command
    pub fn response_code(&self) -> Option<TpmRc> {
        match self.root() {
            Error::Tpm(rc) => Some(*rc),
            _ => None,
        }
    }

    /// True if the TPM returned a warning and the command may be retried
    pub fn is_warning(&self) -> bool {
        self.response_code().is_some_and(|rc| rc.is_warning())
    }

    /// True if a response HMAC failed verification
    pub fn is_auth_mismatch(&self) -> bool {
        matches!(self.root(), Error::AuthMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_and_response_code() {
        let err = Error::WithCleanup {
            source: Box::new(Error::Tpm(TpmRc::RETRY)),
            cleanup: vec![Error::Tpm(TpmRc::HANDLE)],
        };
        assert_eq!(err.response_code(), Some(TpmRc::RETRY));
        assert!(err.is_warning());
        let msg = err.to_string();
        assert!(msg.starts_with("TPM_RC_RETRY"));
        assert!(msg.contains("additional errors encountered during cleanup: TPM_RC_HANDLE"));
    }

    #[test]
    fn test_nested_auth_mismatch() {
        let err = Error::AuthMismatch.in_session("validating auth", 0);
        assert!(err.is_auth_mismatch());
        assert_eq!(
            err.to_string(),
            "validating auth session 0: incorrect authorization HMAC"
        );
        assert!(err.response_code().is_none());
    }
}
