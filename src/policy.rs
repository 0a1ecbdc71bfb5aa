// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Offline replay of policy assertions.
//!
//! Every assertion extends the running digest as
//! `H(digest_old || TPM_CC || arguments)`, the same way a TPM extends the
//! digest of a policy session. Inputs are validated before the digest is
//! touched, so a failed assertion leaves the digest as it was.

use crate::{
    constant::{TPM_MAX_DIGEST_SIZE, TPM_POLICY_OR_MAX},
    digest::DigestAccumulator,
    error::TpmError,
    parser::{NvOperation, PolicyExpr},
    pcr::{pcr_composite_digest, pcr_selection_vec_from_str, pcr_selection_vec_to_tpml},
    resource::HandleType,
    session::TicketKind,
    util::build_to_vec,
};
use log::trace;
use tpm2_protocol::data::{TpmAlgId, TpmCc, TpmSt, TpmlPcrSelection};

/// A policy digest computed without a TPM.
#[derive(Debug, Clone)]
pub struct TrialPolicy {
    acc: DigestAccumulator,
    digest: Vec<u8>,
}

impl TrialPolicy {
    /// Creates a trial with a zero digest.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::UnsupportedAlgorithm` if `alg` is not a supported
    /// hash algorithm.
    pub fn new(alg: TpmAlgId) -> Result<Self, TpmError> {
        let acc = DigestAccumulator::new(alg)?;
        let digest = vec![0; acc.size()];
        Ok(Self { acc, digest })
    }

    /// Continues from a known digest.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::UnsupportedAlgorithm` for an unsupported hash and
    /// `TpmError::InvalidParameter` if the digest has the wrong size.
    pub fn with_digest(alg: TpmAlgId, digest: &[u8]) -> Result<Self, TpmError> {
        let mut trial = Self::new(alg)?;
        trial.check_digest_size("policy digest", digest)?;
        trial.digest = digest.to_vec();
        Ok(trial)
    }

    #[must_use]
    pub fn algorithm(&self) -> TpmAlgId {
        self.acc.algorithm()
    }

    #[must_use]
    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.digest.len()
    }

    /// Returns the digest to its zero state, as `TPM2_PolicyRestart` does.
    pub fn reset(&mut self) {
        self.digest.iter_mut().for_each(|b| *b = 0);
    }

    fn check_digest_size(&self, what: &str, digest: &[u8]) -> Result<(), TpmError> {
        if digest.len() == self.size() {
            Ok(())
        } else {
            Err(TpmError::InvalidParameter(format!(
                "{what}: expected {} bytes, got {}",
                self.size(),
                digest.len()
            )))
        }
    }

    fn extend(&mut self, cc: TpmCc, args: &[&[u8]]) {
        let mut acc = self.acc.clone();
        acc.extend(&self.digest);
        acc.extend(&(cc as u32).to_be_bytes());
        for arg in args {
            acc.extend(arg);
        }
        self.digest = acc.finalize();
        trace!("policy {cc:?}: {}", hex::encode(&self.digest));
    }

    fn policy_update(&mut self, cc: TpmCc, name: &[u8], policy_ref: &[u8]) -> Result<(), TpmError> {
        check_name(name)?;
        if policy_ref.len() > TPM_MAX_DIGEST_SIZE {
            return Err(TpmError::InvalidParameter(format!(
                "policyRef of {} bytes",
                policy_ref.len()
            )));
        }
        self.extend(cc, &[name]);
        let mut acc = self.acc.clone();
        acc.extend(&self.digest);
        acc.extend(policy_ref);
        self.digest = acc.finalize();
        Ok(())
    }

    /// Restricts the session to the command with the code `cc`. Any 32-bit
    /// code is accepted, including vendor and future commands.
    pub fn policy_command_code(&mut self, cc: u32) {
        self.extend(TpmCc::PolicyCommandCode, &[&cc.to_be_bytes()]);
    }

    /// Marks that the authorization value must be proven with an HMAC.
    pub fn policy_auth_value(&mut self) {
        self.extend(TpmCc::PolicyAuthValue, &[]);
    }

    /// Marks that the authorization value must be sent in the clear. The
    /// digest differs from `policy_auth_value`.
    pub fn policy_password(&mut self) {
        self.extend(TpmCc::PolicyPassword, &[]);
    }

    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` if `pcr_digest` is not digest-sized
    /// or the selection cannot be marshalled.
    pub fn policy_pcr(
        &mut self,
        pcr_digest: &[u8],
        selection: &TpmlPcrSelection,
    ) -> Result<(), TpmError> {
        self.check_digest_size("PCR digest", pcr_digest)?;
        let selection = build_to_vec(selection)
            .map_err(|e| TpmError::InvalidParameter(format!("PCR selection: {e}")))?;
        self.extend(TpmCc::PolicyPcr, &[&selection, pcr_digest]);
        Ok(())
    }

    /// Computes the composite digest of `values` and applies `policy_pcr`.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` if the values do not match the
    /// selection.
    pub fn policy_pcr_values(
        &mut self,
        selection: &TpmlPcrSelection,
        values: &[Vec<u8>],
    ) -> Result<(), TpmError> {
        let pcr_digest = pcr_composite_digest(self.algorithm(), selection, values)?;
        self.policy_pcr(&pcr_digest, selection)
    }

    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` if the name is empty or the
    /// reference is too long.
    pub fn policy_secret(&mut self, name: &[u8], policy_ref: &[u8]) -> Result<(), TpmError> {
        self.policy_update(TpmCc::PolicySecret, name, policy_ref)
    }

    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` if the name is empty or the
    /// reference is too long.
    pub fn policy_signed(&mut self, name: &[u8], policy_ref: &[u8]) -> Result<(), TpmError> {
        self.policy_update(TpmCc::PolicySigned, name, policy_ref)
    }

    /// Replays a ticket. The result equals the assertion the ticket was
    /// issued for.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` if the tag is not an authorization
    /// ticket tag.
    pub fn policy_ticket(
        &mut self,
        tag: TpmSt,
        name: &[u8],
        policy_ref: &[u8],
    ) -> Result<(), TpmError> {
        let kind = TicketKind::from_tag(tag)
            .ok_or_else(|| TpmError::InvalidParameter(format!("invalid ticket tag: {tag:?}")))?;
        self.policy_update(kind.command_code(), name, policy_ref)
    }

    /// Combines branch digests. Whether the current digest is one of the
    /// branches is not checked: the caller is responsible for making sure
    /// that a live session can actually reach one of them.
    ///
    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` unless there are 2 to 8 digests,
    /// each of the digest size.
    pub fn policy_or(&mut self, digests: &[Vec<u8>]) -> Result<(), TpmError> {
        if !(2..=TPM_POLICY_OR_MAX).contains(&digests.len()) {
            return Err(TpmError::InvalidParameter(format!(
                "PolicyOR takes 2 to {TPM_POLICY_OR_MAX} digests, got {}",
                digests.len()
            )));
        }
        for digest in digests {
            self.check_digest_size("PolicyOR branch", digest)?;
        }
        let concat = digests.concat();
        self.extend(TpmCc::PolicyOr, &[&concat]);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `TpmError::InvalidParameter` if the index name is empty.
    pub fn policy_nv(
        &mut self,
        index_name: &[u8],
        operand_b: &[u8],
        offset: u16,
        op: NvOperation,
    ) -> Result<(), TpmError> {
        check_name(index_name)?;
        if operand_b.len() > TPM_MAX_DIGEST_SIZE {
            return Err(TpmError::InvalidParameter(format!(
                "operandB of {} bytes",
                operand_b.len()
            )));
        }
        let mut acc = self.acc.clone();
        acc.extend(operand_b);
        acc.extend(&offset.to_be_bytes());
        acc.extend(&u16::from(op).to_be_bytes());
        let args = acc.finalize();
        self.extend(TpmCc::PolicyNv, &[&args, index_name]);
        Ok(())
    }

    /// Evaluates a parsed policy expression.
    ///
    /// `pcr(...)` assertions must carry a digest and every `tpm://` name must
    /// be a handle that names itself. Expressions referring to objects or NV
    /// indices are resolved against a device first.
    ///
    /// # Errors
    ///
    /// Returns a `TpmError` if an assertion rejects its arguments.
    pub fn apply(&mut self, expr: &PolicyExpr) -> Result<(), TpmError> {
        match expr {
            PolicyExpr::Pcr { selection, digest } => {
                let digest = digest.as_ref().ok_or_else(|| {
                    TpmError::InvalidParameter(format!("pcr({selection}) has no digest"))
                })?;
                let tpml = pcr_selection_vec_to_tpml(&pcr_selection_vec_from_str(selection)?)?;
                self.policy_pcr(digest, &tpml)
            }
            PolicyExpr::Secret { name, policy_ref } => {
                let policy_ref = ref_bytes(policy_ref.as_deref())?;
                self.policy_secret(&expr_name(name)?, &policy_ref)
            }
            PolicyExpr::Signed { name, policy_ref } => {
                let policy_ref = ref_bytes(policy_ref.as_deref())?;
                self.policy_signed(&expr_name(name)?, &policy_ref)
            }
            PolicyExpr::CommandCode(cc) => {
                self.policy_command_code(*cc);
                Ok(())
            }
            PolicyExpr::AuthValue => {
                self.policy_auth_value();
                Ok(())
            }
            PolicyExpr::Password => {
                self.policy_password();
                Ok(())
            }
            PolicyExpr::Nv {
                name,
                operand,
                offset,
                op,
            } => self.policy_nv(&expr_name(name)?, operand, *offset, *op),
            PolicyExpr::Or(branches) => {
                let digests = branches
                    .iter()
                    .map(|branch| {
                        let mut trial = Self::new(self.algorithm())?;
                        trial.apply(branch)?;
                        Ok(trial.digest)
                    })
                    .collect::<Result<Vec<_>, TpmError>>()?;
                self.policy_or(&digests)
            }
            PolicyExpr::All(items) => {
                let mut trial = self.clone();
                for item in items {
                    trial.apply(item)?;
                }
                *self = trial;
                Ok(())
            }
            PolicyExpr::TpmHandle(_) | PolicyExpr::Data { .. } => Err(
                TpmError::InvalidParameter(format!("not a policy assertion: {expr}")),
            ),
        }
    }
}

fn check_name(name: &[u8]) -> Result<(), TpmError> {
    if name.is_empty() {
        Err(TpmError::InvalidParameter("empty name".to_string()))
    } else {
        Ok(())
    }
}

/// Returns the name of a `tpm://` or `data://` expression. Only handles whose
/// name is the handle itself can be resolved without a device.
///
/// # Errors
///
/// Returns `TpmError::InvalidParameter` if the name cannot be resolved.
pub fn expr_name(expr: &PolicyExpr) -> Result<Vec<u8>, TpmError> {
    match expr {
        PolicyExpr::TpmHandle(handle) => match HandleType::from_handle(*handle) {
            Some(
                HandleType::Pcr
                | HandleType::HmacSession
                | HandleType::PolicySession
                | HandleType::Permanent,
            ) => Ok(handle.to_be_bytes().to_vec()),
            _ => Err(TpmError::InvalidParameter(format!(
                "name of {handle:#010x} requires a device"
            ))),
        },
        PolicyExpr::Data { .. } => Ok(expr.to_bytes()?),
        _ => Err(TpmError::InvalidParameter(format!("not a name: {expr}"))),
    }
}

fn ref_bytes(policy_ref: Option<&PolicyExpr>) -> Result<Vec<u8>, TpmError> {
    match policy_ref {
        Some(expr) => Ok(expr.to_bytes()?),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::hash_parts;
    use rstest::rstest;

    fn trial() -> TrialPolicy {
        TrialPolicy::new(TpmAlgId::Sha256).unwrap()
    }

    #[test]
    fn test_zero_initialized() {
        assert_eq!(trial().digest(), &[0u8; 32][..]);
        assert_eq!(
            TrialPolicy::new(TpmAlgId::Sha1).unwrap().digest(),
            &[0u8; 20][..]
        );
    }

    #[test]
    fn test_unsupported_algorithm() {
        assert!(matches!(
            TrialPolicy::new(TpmAlgId::Aes),
            Err(TpmError::UnsupportedAlgorithm(TpmAlgId::Aes))
        ));
    }

    #[test]
    fn test_command_code() {
        let mut t = trial();
        t.policy_command_code(TpmCc::Unseal as u32);
        let expected = hash_parts(
            TpmAlgId::Sha256,
            &[&[0; 32], &0x16cu32.to_be_bytes(), &0x15eu32.to_be_bytes()],
        )
        .unwrap();
        assert_eq!(t.digest(), &expected[..]);
    }

    #[rstest]
    #[case(0x0000_015d)]
    #[case(0x0000_014e)]
    #[case(0x2000_0001)]
    fn test_command_code_accepts_any_code(#[case] cc: u32) {
        let mut applied = trial();
        applied
            .apply(&crate::parser::parse_policy(&format!("cc({cc:#x})")).unwrap())
            .unwrap();
        let expected = hash_parts(
            TpmAlgId::Sha256,
            &[&[0; 32], &0x16cu32.to_be_bytes(), &cc.to_be_bytes()],
        )
        .unwrap();
        assert_eq!(applied.digest(), &expected[..]);
    }

    #[test]
    fn test_auth_value_and_password_differ() {
        let mut a = trial();
        let mut b = trial();
        a.policy_auth_value();
        b.policy_password();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_order_sensitive() {
        let mut a = trial();
        a.policy_auth_value();
        a.policy_command_code(TpmCc::Unseal as u32);
        let mut b = trial();
        b.policy_command_code(TpmCc::Unseal as u32);
        b.policy_auth_value();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_secret_two_steps() {
        let mut t = trial();
        t.policy_secret(&[0x40, 0, 0, 1], b"ref").unwrap();
        let d1 = hash_parts(
            TpmAlgId::Sha256,
            &[&[0; 32], &0x151u32.to_be_bytes(), &[0x40, 0, 0, 1]],
        )
        .unwrap();
        let d2 = hash_parts(TpmAlgId::Sha256, &[&d1, b"ref"]).unwrap();
        assert_eq!(t.digest(), &d2[..]);
    }

    #[rstest]
    #[case(TpmSt::AuthSecret, TpmCc::PolicySecret)]
    #[case(TpmSt::AuthSigned, TpmCc::PolicySigned)]
    fn test_ticket_equals_assertion(#[case] tag: TpmSt, #[case] cc: TpmCc) {
        let mut a = trial();
        a.policy_ticket(tag, b"name", b"ref").unwrap();
        let mut b = trial();
        b.policy_update(cc, b"name", b"ref").unwrap();
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_ticket_invalid_tag() {
        let mut t = trial();
        assert!(matches!(
            t.policy_ticket(TpmSt::Hashcheck, b"name", &[]),
            Err(TpmError::InvalidParameter(_))
        ));
        assert_eq!(t.digest(), &[0u8; 32][..]);
    }

    #[test]
    fn test_or_is_hash_of_concatenation() {
        let d1 = vec![0x11u8; 32];
        let d2 = vec![0x22u8; 32];
        let mut t = trial();
        t.policy_or(&[d1.clone(), d2.clone()]).unwrap();
        let expected = hash_parts(
            TpmAlgId::Sha256,
            &[&[0; 32], &0x171u32.to_be_bytes(), &d1, &d2],
        )
        .unwrap();
        assert_eq!(t.digest(), &expected[..]);
    }

    #[rstest]
    #[case(1, 32)]
    #[case(9, 32)]
    #[case(2, 20)]
    fn test_or_rejects(#[case] count: usize, #[case] size: usize) {
        let mut t = trial();
        let digests = vec![vec![0u8; size]; count];
        assert!(matches!(
            t.policy_or(&digests),
            Err(TpmError::InvalidParameter(_))
        ));
        assert_eq!(t.digest(), &[0u8; 32][..]);
    }

    #[test]
    fn test_pcr_rejects_wrong_size() {
        let mut t = trial();
        let tpml = pcr_selection_vec_to_tpml(&pcr_selection_vec_from_str("sha256:0").unwrap())
            .unwrap();
        assert!(t.policy_pcr(&[0; 20], &tpml).is_err());
        assert_eq!(t.digest(), &[0u8; 32][..]);
        assert!(t.policy_pcr(&[0; 32], &tpml).is_ok());
    }

    #[test]
    fn test_nv() {
        let mut t = trial();
        t.policy_nv(b"index", &[1, 2], 4, NvOperation::UnsignedLe).unwrap();
        let args = hash_parts(
            TpmAlgId::Sha256,
            &[&[1, 2], &4u16.to_be_bytes(), &9u16.to_be_bytes()],
        )
        .unwrap();
        let expected = hash_parts(
            TpmAlgId::Sha256,
            &[&[0; 32], &0x149u32.to_be_bytes(), &args, b"index"],
        )
        .unwrap();
        assert_eq!(t.digest(), &expected[..]);
    }

    #[test]
    fn test_reset() {
        let mut t = trial();
        t.policy_auth_value();
        t.reset();
        assert_eq!(t.digest(), &[0u8; 32][..]);
    }

    #[test]
    fn test_apply_or_of_sequences() {
        let expr = crate::parser::parse_policy(
            "or(all(authvalue(), cc(0x15e)), password())",
        )
        .unwrap();
        let mut t = trial();
        t.apply(&expr).unwrap();

        let mut b1 = trial();
        b1.policy_auth_value();
        b1.policy_command_code(TpmCc::Unseal as u32);
        let mut b2 = trial();
        b2.policy_password();
        let mut expected = trial();
        expected
            .policy_or(&[b1.digest().to_vec(), b2.digest().to_vec()])
            .unwrap();
        assert_eq!(t.digest(), expected.digest());
    }

    #[test]
    fn test_apply_failure_keeps_digest() {
        let expr = crate::parser::parse_policy("authvalue(); secret(tpm://0x81000001)").unwrap();
        let mut t = trial();
        assert!(t.apply(&expr).is_err());
        assert_eq!(t.digest(), &[0u8; 32][..]);
    }
}
