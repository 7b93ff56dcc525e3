// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Hash, HMAC, KDFa and AES-CFB primitives used by sessions and accumulators

use aes::{Aes128, Aes192, Aes256};
use cipher::{AsyncStreamCipher, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

use crate::constants::TpmAlgId;
use crate::error::{Error, Result};

/// AES block size, also the CFB IV length
pub const AES_BLOCK_SIZE: usize = 16;

fn digest<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

/// Digest size in bytes, or an error for non-hash algorithms
pub fn digest_size(alg: TpmAlgId) -> Result<usize> {
    match alg.digest_size() {
        0 => Err(Error::UnsupportedAlgorithm(alg.to_u16())),
        n => Ok(n),
    }
}

/// Hash the concatenation of `parts`
pub fn hash(alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>> {
    match alg {
        TpmAlgId::Sha1 => Ok(digest::<Sha1>(parts)),
        TpmAlgId::Sha256 => Ok(digest::<Sha256>(parts)),
        TpmAlgId::Sha384 => Ok(digest::<Sha384>(parts)),
        TpmAlgId::Sha512 => Ok(digest::<Sha512>(parts)),
        other => Err(Error::UnsupportedAlgorithm(other.to_u16())),
    }
}

macro_rules! mac {
    ($digest:ty, $key:expr, $parts:expr) => {{
        let mut mac =
            <Hmac<$digest> as Mac>::new_from_slice($key).map_err(|_| Error::InvalidValue {
                what: "HMAC key length",
                value: $key.len() as u64,
            })?;
        for part in $parts {
            mac.update(part);
        }
        mac.finalize().into_bytes().to_vec()
    }};
}

/// HMAC over the concatenation of `parts`
pub fn hmac(alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    Ok(match alg {
        TpmAlgId::Sha1 => mac!(Sha1, key, parts),
        TpmAlgId::Sha256 => mac!(Sha256, key, parts),
        TpmAlgId::Sha384 => mac!(Sha384, key, parts),
        TpmAlgId::Sha512 => mac!(Sha512, key, parts),
        other => return Err(Error::UnsupportedAlgorithm(other.to_u16())),
    })
}

/// Constant-time equality for authorization values
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// KDFa (TPM 2.0 Part 1, 11.4.10.2): counter-mode HMAC key derivation.
///
/// Produces `ceil(bits / 8)` bytes. When `bits` is not a multiple of 8 the
/// unused high bits of the first byte are cleared.
pub fn kdfa(
    alg: TpmAlgId,
    key: &[u8],
    label: &str,
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Result<Vec<u8>> {
    let block = digest_size(alg)?;
    let len = bits.div_ceil(8) as usize;
    let bits_be = bits.to_be_bytes();
    let mut out = Vec::with_capacity(len + block);
    let mut counter: u32 = 0;
    while out.len() < len {
        counter += 1;
        out.extend(hmac(
            alg,
            key,
            &[
                &counter.to_be_bytes(),
                label.as_bytes(),
                &[0],
                context_u,
                context_v,
                &bits_be,
            ],
        )?);
    }
    out.truncate(len);
    if bits % 8 != 0 {
        if let Some(first) = out.first_mut() {
            *first &= (1u8 << (bits % 8)) - 1;
        }
    }
    Ok(out)
}

fn invalid_key(key: &[u8]) -> Error {
    Error::UnsupportedKeyBits((key.len() * 8) as u16)
}

/// AES-CFB encrypt `data` in place. The key length selects AES-128/192/256.
pub fn cfb_encrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    match key.len() {
        16 => cfb_mode::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|_| invalid_key(key))?
            .encrypt(data),
        24 => cfb_mode::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|_| invalid_key(key))?
            .encrypt(data),
        32 => cfb_mode::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| invalid_key(key))?
            .encrypt(data),
        _ => return Err(invalid_key(key)),
    }
    Ok(())
}

/// AES-CFB decrypt `data` in place
pub fn cfb_decrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    match key.len() {
        16 => cfb_mode::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|_| invalid_key(key))?
            .decrypt(data),
        24 => cfb_mode::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|_| invalid_key(key))?
            .decrypt(data),
        32 => cfb_mode::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| invalid_key(key))?
            .decrypt(data),
        _ => return Err(invalid_key(key)),
    }
    Ok(())
}

/// Fill a fresh buffer from the OS random source
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> (Vec<u8>, Vec<u8>) {
        ((0u8..16).collect(), (16u8..32).collect())
    }

    #[test]
    fn test_hmac_rfc4231_case2() {
        let mac = hmac(
            TpmAlgId::Sha256,
            b"Jefe",
            &[b"what do ya ".as_slice(), b"want for nothing?".as_slice()],
        )
        .unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_hash_sizes() {
        for alg in [
            TpmAlgId::Sha1,
            TpmAlgId::Sha256,
            TpmAlgId::Sha384,
            TpmAlgId::Sha512,
        ] {
            assert_eq!(hash(alg, &[b"abc".as_slice()]).unwrap().len(), alg.digest_size());
        }
        assert!(matches!(
            hash(TpmAlgId::Aes, &[b"abc".as_slice()]),
            Err(Error::UnsupportedAlgorithm(0x0006))
        ));
    }

    #[test]
    fn test_kdfa_vectors() {
        let (u, v) = ctx();
        let key = kdfa(TpmAlgId::Sha256, b"key", "ATH", &u, &v, 256).unwrap();
        assert_eq!(
            hex::encode(key),
            "547245819ab5966e0561ded3a6d6fb67a65d69c913bb81cf3d3449eea47e76fc"
        );

        // Spans three SHA-1 blocks
        let key_iv = kdfa(TpmAlgId::Sha1, b"key", "CFB", &u, &v, 384).unwrap();
        assert_eq!(
            hex::encode(key_iv),
            "2fc7b1c697f3a1984394e438eda3f54266738c82f7be2792\
             d0379a63b539bccc03c213468678292c906cbc26c55ab54c"
        );
    }

    #[test]
    fn test_kdfa_masks_partial_byte() {
        let (u, v) = ctx();
        let out = kdfa(TpmAlgId::Sha256, b"key", "ATH", &u, &v, 13).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(hex::encode(&out), "0da8");
        assert_eq!(out[0] & !0x1F, 0);
    }

    #[test]
    fn test_cfb_known_vector_and_inverse() {
        let key: Vec<u8> = (0u8..16).collect();
        let iv: Vec<u8> = (16u8..32).collect();
        let mut data = b"parameter bytes!xyz".to_vec();
        cfb_encrypt(&key, &iv, &mut data).unwrap();
        assert_eq!(hex::encode(&data), "779f9d158cb0770be22e8c68faf1e1b2d9808e");
        cfb_decrypt(&key, &iv, &mut data).unwrap();
        assert_eq!(data, b"parameter bytes!xyz");
    }

    #[test]
    fn test_cfb_rejects_bad_key() {
        let mut data = [0u8; 4];
        assert!(matches!(
            cfb_encrypt(&[0u8; 10], &[0u8; 16], &mut data),
            Err(Error::UnsupportedKeyBits(80))
        ));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
