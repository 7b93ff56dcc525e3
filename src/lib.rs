// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 client protocol stack
//!
//! This crate marshals TPM 2.0 commands, authorizes them with password, HMAC
//! and policy sessions, and talks directly to the TPM device without C
//! library dependencies.
//!
//! ## Features
//!
//! - **Typed wire codec**: sized buffers, unions, bitfields and lists
//! - **Sessions**: salted/bound HMAC sessions, policy sessions, AES-CFB
//!   parameter encryption and response HMAC validation
//! - **Offline digests**: policy and command audit calculators
//! - **Direct device communication**: Talks directly to `/dev/tpmrm0`,
//!   `/dev/tpm0` or a simulator socket
//!
//! ## Example
//!
//! ```no_run
//! use tpm2_proto::{Hmac, SessionOptions, TpmAlgId, TpmContext, AuthHandle, Tpm2bMaxBuffer};
//!
//! let mut ctx = TpmContext::new(None)?; // Auto-detect TPM device
//! let random_bytes = ctx.get_random(32)?;
//!
//! let mut session = ctx.hmac_session(TpmAlgId::Sha256, SessionOptions::new().auth(b"key auth"))?;
//! # let key_name = tpm2_proto::Tpm2bName::empty();
//! let mut cmd = Hmac {
//!     handle: AuthHandle::new(0x80000001, &mut session).with_name(key_name).into(),
//!     buffer: Tpm2bMaxBuffer::new(random_bytes),
//!     hash_alg: TpmAlgId::Sha256,
//! };
//! let _mac = ctx.execute(&mut cmd, &mut [])?.out_hmac;
//! drop(cmd);
//! session.flush(ctx.transport())?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod audit;
pub mod commands;
mod constants;
pub mod crypto;
mod device;
mod error;
pub mod execute;
pub mod marshal;
pub mod policy;
mod rc;
pub mod session;
mod tpm2b;
mod types;

pub use audit::CommandAudit;
pub use commands::*;
pub use constants::*;
pub use device::{
    finalize_command, put_command_header, ResponseHeader, TpmDevice, Transport, HEADER_SIZE,
    TPM_MAX_COMMAND_SIZE,
};
pub use error::{Error, Result};
pub use execute::{cp_hash, execute, Command, CommandParts, HandleAuth, HandleEntry, Response};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use policy::{PolicyCalculator, PolicyUpdate};
pub use rc::{RcKind, RcSubject, TpmRc};
pub use session::{
    HmacSession, ParameterEncryption, PasswordSession, PolicyCallback, PolicySession,
    SaltEncapsulator, Session, SessionOptions, DEFAULT_NONCE_SIZE,
};
pub use tpm2b::Tpm2b;
pub use types::*;
