// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{digest::hash_parts, error::TpmError, util::build_to_vec};
use aes::{Aes128, Aes192, Aes256};
use cfb_mode::{Decryptor, Encryptor};
use cipher::{AsyncStreamCipher, KeyIvInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use tpm2_protocol::data::{
    TpmAlgId, TpmsNvPublic, TpmtHa, TpmtPublic, TpmtSignature, TpmuHa, TpmuSignature,
};

/// Computes `HMAC(key, parts[0] || parts[1] || ...)`.
///
/// # Errors
///
/// Returns `TpmError::UnsupportedAlgorithm` for an unsupported hash.
pub fn crypto_hmac(alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, TpmError> {
    macro_rules! do_hmac {
        ($digest:ty) => {{
            let mut mac = <Hmac<$digest> as Mac>::new_from_slice(key)
                .map_err(|e| TpmError::InvalidParameter(format!("HMAC init error: {e}")))?;
            for part in parts {
                mac.update(part);
            }
            Ok(mac.finalize().into_bytes().to_vec())
        }};
    }

    match alg {
        TpmAlgId::Sha1 => do_hmac!(Sha1),
        TpmAlgId::Sha256 => do_hmac!(Sha256),
        TpmAlgId::Sha384 => do_hmac!(Sha384),
        TpmAlgId::Sha512 => do_hmac!(Sha512),
        _ => Err(TpmError::UnsupportedAlgorithm(alg)),
    }
}

/// Verifies an HMAC in constant time.
///
/// # Errors
///
/// Returns `TpmError::Integrity` on mismatch.
pub fn crypto_hmac_verify(
    alg: TpmAlgId,
    key: &[u8],
    parts: &[&[u8]],
    expected: &[u8],
) -> Result<(), TpmError> {
    macro_rules! do_verify {
        ($digest:ty) => {{
            let mut mac = <Hmac<$digest> as Mac>::new_from_slice(key)
                .map_err(|e| TpmError::InvalidParameter(format!("HMAC init error: {e}")))?;
            for part in parts {
                mac.update(part);
            }
            mac.verify_slice(expected)
                .map_err(|_| TpmError::Integrity("HMAC mismatch".to_string()))
        }};
    }

    match alg {
        TpmAlgId::Sha1 => do_verify!(Sha1),
        TpmAlgId::Sha256 => do_verify!(Sha256),
        TpmAlgId::Sha384 => do_verify!(Sha384),
        TpmAlgId::Sha512 => do_verify!(Sha512),
        _ => Err(TpmError::UnsupportedAlgorithm(alg)),
    }
}

/// SP 800-108 counter mode KDF with HMAC, as `KDFa` in the TPM 2.0
/// architecture specification.
///
/// # Errors
///
/// Returns `TpmError::UnsupportedAlgorithm` for an unsupported hash, and
/// `TpmError::InvalidParameter` if `bits` is zero.
pub fn crypto_kdfa(
    alg: TpmAlgId,
    key: &[u8],
    label: &str,
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Result<Vec<u8>, TpmError> {
    if bits == 0 {
        return Err(TpmError::InvalidParameter("KDFa: zero length".to_string()));
    }
    let len = usize::try_from(bits.div_ceil(8))
        .map_err(|_| TpmError::InvalidParameter("KDFa: length".to_string()))?;
    let mut out = Vec::with_capacity(len);
    let mut counter: u32 = 1;
    while out.len() < len {
        let block = crypto_hmac(
            alg,
            key,
            &[
                &counter.to_be_bytes(),
                label.as_bytes(),
                &[0],
                context_u,
                context_v,
                &bits.to_be_bytes(),
            ],
        )?;
        out.extend_from_slice(&block);
        counter += 1;
    }
    out.truncate(len);
    if bits % 8 != 0 {
        out[0] &= 0xff >> (8 - bits % 8);
    }
    Ok(out)
}

/// Computes the Name of an object: `nameAlg || H_nameAlg(TPMT_PUBLIC)`.
///
/// # Errors
///
/// Returns a `TpmError` if the public area cannot be marshalled or its name
/// algorithm is not supported.
pub fn crypto_make_name(public: &TpmtPublic) -> Result<Vec<u8>, TpmError> {
    let bytes = build_to_vec(public)?;
    make_name(public.name_alg, &bytes)
}

/// Computes the Name of an NV index: `nameAlg || H_nameAlg(TPMS_NV_PUBLIC)`.
///
/// # Errors
///
/// Returns a `TpmError` if the public area cannot be marshalled or its name
/// algorithm is not supported.
pub fn crypto_make_nv_name(public: &TpmsNvPublic) -> Result<Vec<u8>, TpmError> {
    let bytes = build_to_vec(public)?;
    make_name(public.name_alg, &bytes)
}

fn make_name(name_alg: TpmAlgId, bytes: &[u8]) -> Result<Vec<u8>, TpmError> {
    let digest = hash_parts(name_alg, &[bytes])?;
    let mut name = (name_alg as u16).to_be_bytes().to_vec();
    name.extend_from_slice(&digest);
    Ok(name)
}

/// Wraps an HMAC into a `TPMT_SIGNATURE`.
///
/// # Errors
///
/// Returns `TpmError::InvalidParameter` if the digest size does not match
/// the hash algorithm.
pub fn crypto_hmac_signature(hash_alg: TpmAlgId, digest: &[u8]) -> Result<TpmtSignature, TpmError> {
    let invalid = |_| TpmError::InvalidParameter(format!("HMAC size {}", digest.len()));
    let digest = match hash_alg {
        TpmAlgId::Sha1 => TpmuHa::Sha1(digest.try_into().map_err(invalid)?),
        TpmAlgId::Sha256 => TpmuHa::Sha256(digest.try_into().map_err(invalid)?),
        TpmAlgId::Sha384 => TpmuHa::Sha384(digest.try_into().map_err(invalid)?),
        TpmAlgId::Sha512 => TpmuHa::Sha512(digest.try_into().map_err(invalid)?),
        _ => return Err(TpmError::UnsupportedAlgorithm(hash_alg)),
    };
    Ok(TpmtSignature {
        sig_alg: TpmAlgId::Hmac,
        signature: TpmuSignature::Hmac(TpmtHa { hash_alg, digest }),
    })
}

/// Returns the hash algorithm and the digest of an HMAC signature, or `None`
/// for any other scheme.
#[must_use]
pub fn crypto_signature_hmac(signature: &TpmtSignature) -> Option<(TpmAlgId, Vec<u8>)> {
    let TpmuSignature::Hmac(ha) = &signature.signature else {
        return None;
    };
    if signature.sig_alg != TpmAlgId::Hmac {
        return None;
    }
    let digest: &[u8] = match &ha.digest {
        TpmuHa::Sha1(d) => d,
        TpmuHa::Sha256(d) => d,
        TpmuHa::Sha384(d) => d,
        TpmuHa::Sha512(d) => d,
        _ => return None,
    };
    Some((ha.hash_alg, digest.to_vec()))
}

/// Encrypts or decrypts a buffer in place with AES-CFB.
///
/// # Errors
///
/// Returns `TpmError::InvalidParameter` if the key or IV length is invalid.
pub fn crypto_aes_cfb(key: &[u8], iv: &[u8], buf: &mut [u8], encrypt: bool) -> Result<(), TpmError> {
    macro_rules! do_cfb {
        ($cipher:ty) => {{
            if encrypt {
                Encryptor::<$cipher>::new_from_slices(key, iv)
                    .map_err(|e| TpmError::InvalidParameter(format!("AES-CFB: {e}")))?
                    .encrypt(buf);
            } else {
                Decryptor::<$cipher>::new_from_slices(key, iv)
                    .map_err(|e| TpmError::InvalidParameter(format!("AES-CFB: {e}")))?
                    .decrypt(buf);
            }
            Ok(())
        }};
    }

    match key.len() {
        16 => do_cfb!(Aes128),
        24 => do_cfb!(Aes192),
        32 => do_cfb!(Aes256),
        len => Err(TpmError::InvalidParameter(format!(
            "AES-CFB: invalid key length {len}"
        ))),
    }
}

/// XORs a buffer with a `KDFa(..., "XOR", ...)` mask.
///
/// # Errors
///
/// Returns a `TpmError` if the mask cannot be derived.
pub fn crypto_xor_obfuscate(
    alg: TpmAlgId,
    key: &[u8],
    context_u: &[u8],
    context_v: &[u8],
    buf: &mut [u8],
) -> Result<(), TpmError> {
    if buf.is_empty() {
        return Ok(());
    }
    let bits = u32::try_from(buf.len() * 8)
        .map_err(|_| TpmError::InvalidParameter("XOR: buffer too large".to_string()))?;
    let mask = crypto_kdfa(
        alg,
        key,
        crate::constant::KDF_LABEL_XOR,
        context_u,
        context_v,
        bits,
    )?;
    for (byte, m) in buf.iter_mut().zip(mask) {
        *byte ^= m;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::sealed_data_template;
    use rstest::rstest;

    #[test]
    fn test_hmac_rfc4231_case2() {
        let mac = crypto_hmac(
            TpmAlgId::Sha256,
            b"Jefe",
            &[b"what do ya want ", b"for nothing?"],
        )
        .unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_hmac_verify_mismatch() {
        let mac = crypto_hmac(TpmAlgId::Sha256, b"key", &[b"data"]).unwrap();
        assert!(crypto_hmac_verify(TpmAlgId::Sha256, b"key", &[b"data"], &mac).is_ok());
        assert!(matches!(
            crypto_hmac_verify(TpmAlgId::Sha256, b"key", &[b"date"], &mac),
            Err(TpmError::Integrity(_))
        ));
    }

    #[test]
    fn test_kdfa_length_and_prefix() {
        let short = crypto_kdfa(TpmAlgId::Sha256, b"key", "ATH", b"u", b"v", 256).unwrap();
        let long = crypto_kdfa(TpmAlgId::Sha256, b"key", "ATH", b"u", b"v", 512).unwrap();
        assert_eq!(short.len(), 32);
        assert_eq!(long.len(), 64);
        // The bit count is part of every block, so outputs of different length
        // are unrelated.
        assert_ne!(short[..], long[..32]);
    }

    #[test]
    fn test_kdfa_first_block() {
        let out = crypto_kdfa(TpmAlgId::Sha256, b"key", "CFB", b"u", b"v", 256).unwrap();
        let expected = crypto_hmac(
            TpmAlgId::Sha256,
            b"key",
            &[&1u32.to_be_bytes(), b"CFB\0", b"u", b"v", &256u32.to_be_bytes()],
        )
        .unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_make_name() {
        let public = sealed_data_template(TpmAlgId::Sha256, &[]).unwrap();
        let name = crypto_make_name(&public).unwrap();
        assert_eq!(name.len(), 34);
        assert_eq!(&name[..2], &[0x00, 0x0b]);
        let digest = hash_parts(TpmAlgId::Sha256, &[&build_to_vec(&public).unwrap()]).unwrap();
        assert_eq!(&name[2..], &digest[..]);
    }

    #[test]
    fn test_aes_cfb() {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        let mut buf = b"parameter data".to_vec();
        crypto_aes_cfb(&key, &iv, &mut buf, true).unwrap();
        assert_ne!(buf, b"parameter data");
        crypto_aes_cfb(&key, &iv, &mut buf, false).unwrap();
        assert_eq!(buf, b"parameter data");
    }

    #[rstest]
    #[case(TpmAlgId::Sha1, 20)]
    #[case(TpmAlgId::Sha256, 32)]
    #[case(TpmAlgId::Sha512, 64)]
    fn test_hmac_signature(#[case] hash_alg: TpmAlgId, #[case] size: usize) {
        let digest = vec![0x5a; size];
        let signature = crypto_hmac_signature(hash_alg, &digest).unwrap();
        assert_eq!(crypto_signature_hmac(&signature), Some((hash_alg, digest)));
        assert!(matches!(
            crypto_hmac_signature(hash_alg, &[0; 8]),
            Err(TpmError::InvalidParameter(_))
        ));
    }
}
