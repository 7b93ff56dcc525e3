// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command audit digest tracking

use tracing::trace;

use super::constants::{TpmAlgId, TpmCc};
use super::crypto;
use super::error::Result;
use super::execute::{command_area, Command, Response};
use super::marshal::*;
use super::rc::TpmRc;
use super::session::{compute_cp_hash, compute_rp_hash};
use super::types::Tpm2bName;

/// Software copy of an audit session's digest.
///
/// Each successful audited command extends it with
/// `H(digest || cpHash || rpHash)`.
#[derive(Debug, Clone)]
pub struct CommandAudit {
    alg: TpmAlgId,
    digest: Vec<u8>,
}

impl CommandAudit {
    pub fn new(alg: TpmAlgId) -> Result<Self> {
        let size = crypto::digest_size(alg)?;
        Ok(Self {
            alg,
            digest: vec![0; size],
        })
    }

    /// Extend with a command and its successful response
    pub fn update<C: Command>(&mut self, cmd: &mut C, rsp: &C::Response) -> Result<()> {
        let (names, cmd_parms) = command_area(cmd)?;
        let mut rsp_parms = CommandBuffer::new();
        for parameter in rsp.parameters() {
            parameter.marshal(&mut rsp_parms)?;
        }
        self.update_raw(C::COMMAND_CODE, &names, &cmd_parms, rsp_parms.as_bytes())
    }

    /// Extend from the marshalled parameter areas
    pub fn update_raw(
        &mut self,
        cc: TpmCc,
        names: &[Tpm2bName],
        cmd_parms: &[u8],
        rsp_parms: &[u8],
    ) -> Result<()> {
        let cp_hash = compute_cp_hash(self.alg, cc, names, cmd_parms)?;
        let rp_hash = compute_rp_hash(self.alg, TpmRc::SUCCESS, cc, rsp_parms)?;
        self.digest = crypto::hash(self.alg, &[&self.digest, &cp_hash, &rp_hash])?;
        trace!("audit digest after {:?}: {}", cc, hex::encode(&self.digest));
        Ok(())
    }

    /// Current digest
    pub fn digest(&self) -> &[u8] {
        &self.digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Hmac, HmacResponse};
    use crate::session::PasswordSession;
    use crate::types::*;
    use sha2::{Digest, Sha256};

    fn key_name() -> Tpm2bName {
        let mut name = vec![0x00, 0x0B];
        name.extend([0xAA; 32]);
        Tpm2bName::new(name)
    }

    fn sha256(parts: &[&[u8]]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().to_vec()
    }

    #[test]
    fn test_audit_chaining() {
        const TPM_CC_HMAC: [u8; 4] = [0x00, 0x00, 0x01, 0x55];

        let mut audit = CommandAudit::new(TpmAlgId::Sha256).unwrap();
        assert_eq!(audit.digest(), &[0u8; 32]);

        // digest = H(H(H(0 || m1) || m2) || m3), m = cpHash || rpHash
        let mut expected = vec![0u8; 32];
        for (i, data) in [b"abcd", b"efgh", b"ijkl"].iter().enumerate() {
            let mut session = PasswordSession::empty();
            let mut cmd = Hmac {
                handle: AuthHandle::new(0x80000001, &mut session)
                    .with_name(key_name())
                    .into(),
                buffer: Tpm2bMaxBuffer::new(data.to_vec()),
                hash_alg: TpmAlgId::Sha256,
            };
            let rsp = HmacResponse {
                out_hmac: Tpm2bDigest::new(vec![i as u8; 32]),
            };

            let mut cmd_parms = vec![0x00, 0x04];
            cmd_parms.extend(*data);
            cmd_parms.extend([0x00, 0x0B]);
            let mut rsp_parms = vec![0x00, 0x20];
            rsp_parms.extend([i as u8; 32]);

            let mut from_wire = audit.clone();
            from_wire
                .update_raw(TpmCc::Hmac, &[key_name()], &cmd_parms, &rsp_parms)
                .unwrap();
            audit.update(&mut cmd, &rsp).unwrap();

            let cp_hash = sha256(&[&TPM_CC_HMAC, key_name().as_bytes(), &cmd_parms]);
            let rp_hash = sha256(&[&[0x00; 4], &TPM_CC_HMAC, &rsp_parms]);
            expected = sha256(&[&expected, &cp_hash, &rp_hash]);
            assert_eq!(audit.digest(), expected.as_slice());
            assert_eq!(from_wire.digest(), expected.as_slice());
        }
    }
}
