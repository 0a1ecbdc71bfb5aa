// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use tpm2_protocol::{
    constant::TPM_MAX_COMMAND_SIZE,
    data::{TpmRc, TpmRcBase},
    TpmBuild, TpmErrorKind, TpmParse, TpmWriter,
};

/// A helper to build a `TpmBuild` type into a `Vec<u8>`.
///
/// # Errors
///
/// Returns a `TpmErrorKind` if the object cannot be serialized into the buffer.
pub fn build_to_vec<T: TpmBuild>(obj: &T) -> Result<Vec<u8>, TpmErrorKind> {
    let mut buf = [0u8; TPM_MAX_COMMAND_SIZE];
    let len = {
        let mut writer = TpmWriter::new(&mut buf);
        obj.build(&mut writer)?;
        writer.len()
    };
    Ok(buf[..len].to_vec())
}

/// Parses a `TpmParse` type that must consume all of `buf`.
///
/// # Errors
///
/// Returns `TpmErrorKind::TrailingData` if bytes are left over, or the error
/// of the underlying parser.
pub fn parse_exact<T: TpmParse>(buf: &[u8]) -> Result<T, TpmErrorKind> {
    let (value, rest) = T::parse(buf)?;
    if !rest.is_empty() {
        return Err(TpmErrorKind::TrailingData);
    }
    Ok(value)
}

/// Converts `TpmErrorKind` to `TpmRc`.
pub trait TpmErrorKindExt {
    fn to_tpm_rc(self) -> TpmRc;
}

impl TpmErrorKindExt for TpmErrorKind {
    fn to_tpm_rc(self) -> TpmRc {
        let base = match self {
            TpmErrorKind::Capacity(..)
            | TpmErrorKind::InvalidValue
            | TpmErrorKind::NotDiscriminant(..) => TpmRcBase::Value,
            TpmErrorKind::Underflow | TpmErrorKind::TrailingData => TpmRcBase::Size,
            TpmErrorKind::Unreachable => TpmRcBase::Failure,
        };
        TpmRc::from(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exact_trailing() {
        let bytes = build_to_vec(&0x1234_5678u32).unwrap();
        assert_eq!(parse_exact::<u32>(&bytes).unwrap(), 0x1234_5678);

        let mut longer = bytes.clone();
        longer.push(0);
        assert!(matches!(
            parse_exact::<u32>(&longer),
            Err(TpmErrorKind::TrailingData)
        ));
    }

    #[test]
    fn test_error_kind_to_rc() {
        assert_eq!(
            TpmErrorKind::Underflow.to_tpm_rc(),
            TpmRc::from(TpmRcBase::Size)
        );
        assert_eq!(
            TpmErrorKind::InvalidValue.to_tpm_rc(),
            TpmRc::from(TpmRcBase::Value)
        );
    }
}
