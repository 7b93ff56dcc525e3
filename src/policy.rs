// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Software policy digest calculation

use super::constants::TpmAlgId;
use super::crypto;
use super::error::Result;

/// Computes a policy digest offline, the way a policy session extends its
/// policyDigest on the TPM
#[derive(Debug, Clone)]
pub struct PolicyCalculator {
    alg: TpmAlgId,
    state: Vec<u8>,
}

impl PolicyCalculator {
    /// Start from the all-zero digest
    pub fn new(alg: TpmAlgId) -> Result<Self> {
        let size = crypto::digest_size(alg)?;
        Ok(Self {
            alg,
            state: vec![0; size],
        })
    }

    pub fn alg(&self) -> TpmAlgId {
        self.alg
    }

    /// state = H(state || parts...)
    pub fn update(&mut self, parts: &[&[u8]]) -> Result<()> {
        let mut input: Vec<&[u8]> = Vec::with_capacity(parts.len() + 1);
        input.push(&self.state);
        input.extend_from_slice(parts);
        self.state = crypto::hash(self.alg, &input)?;
        Ok(())
    }

    /// Back to the all-zero digest
    pub fn reset(&mut self) {
        self.state.iter_mut().for_each(|b| *b = 0);
    }

    /// Current digest
    pub fn hash(&self) -> &[u8] {
        &self.state
    }
}

/// A policy command that can extend a [`PolicyCalculator`]
pub trait PolicyUpdate {
    fn update(&self, policy: &mut PolicyCalculator) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let policy = PolicyCalculator::new(TpmAlgId::Sha384).unwrap();
        assert_eq!(policy.hash(), &[0u8; 48]);
        assert!(PolicyCalculator::new(TpmAlgId::Aes).is_err());
    }

    #[test]
    fn test_update_and_reset() {
        let mut policy = PolicyCalculator::new(TpmAlgId::Sha256).unwrap();
        // TPM_CC_PolicyAuthValue
        policy.update(&[&0x0000016Bu32.to_be_bytes()]).unwrap();
        assert_eq!(
            hex::encode(policy.hash()),
            "8fcd2169ab92694e0c633f1ab772842b8241bbc20288981fc7ac1eddc1fddb0e"
        );

        // Parts are hashed as one concatenation
        let mut split = PolicyCalculator::new(TpmAlgId::Sha256).unwrap();
        split.update(&[&[0x00, 0x00], &[0x01, 0x6B]]).unwrap();
        assert_eq!(split.hash(), policy.hash());

        policy.reset();
        assert_eq!(policy.hash(), &[0u8; 32]);
    }
}
