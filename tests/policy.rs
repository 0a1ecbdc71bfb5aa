// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use rstest::rstest;
use sha2::{Digest, Sha256};
use tpm2_protocol::data::{TpmAlgId, TpmCc};
use tpm2ctx::{
    parser::parse_policy,
    policy::{expr_name, TrialPolicy},
    TpmError,
};

fn digest_of(input: &str) -> Vec<u8> {
    let mut trial = TrialPolicy::new(TpmAlgId::Sha256).unwrap();
    trial.apply(&parse_policy(input).unwrap()).unwrap();
    trial.digest().to_vec()
}

fn extend(digest: &[u8], cc: TpmCc, args: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(digest);
    hasher.update((cc as u32).to_be_bytes());
    for arg in args {
        hasher.update(arg);
    }
    hasher.finalize().to_vec()
}

#[test]
fn test_auth_value_known_answer() {
    assert_eq!(
        digest_of("authvalue()"),
        extend(&[0; 32], TpmCc::PolicyAuthValue, &[])
    );
}

#[rstest]
#[case("authvalue()")]
#[case("cc(0x15e); password()")]
#[case("pcr(sha256:0, 0000000000000000000000000000000000000000000000000000000000000000)")]
#[case("secret(tpm://0x40000001, data://utf8,label)")]
#[case("or(authvalue(), password())")]
fn test_deterministic(#[case] input: &str) {
    assert_eq!(digest_of(input), digest_of(input));
}

#[rstest]
#[case(0x15d)]
#[case(0x14e)]
#[case(0x2000_0001)]
fn test_command_code_any_value(#[case] code: u32) {
    let expected = extend(
        &[0; 32],
        TpmCc::PolicyCommandCode,
        &[&code.to_be_bytes()],
    );
    assert_eq!(digest_of(&format!("cc({code:#x})")), expected);
}

#[test]
fn test_order_matters() {
    assert_ne!(
        digest_of("cc(0x15e); authvalue()"),
        digest_of("authvalue(); cc(0x15e)")
    );
}

#[test]
fn test_auth_value_is_not_password() {
    assert_ne!(digest_of("authvalue()"), digest_of("password()"));
}

#[test]
fn test_or_over_prior_digest() {
    let authvalue = extend(&[0; 32], TpmCc::PolicyAuthValue, &[]);
    let password = extend(&[0; 32], TpmCc::PolicyPassword, &[]);
    let code = (TpmCc::Unseal as u32).to_be_bytes();
    let prior = extend(&[0; 32], TpmCc::PolicyCommandCode, &[&code]);
    let expected = extend(&prior, TpmCc::PolicyOr, &[&authvalue, &password]);
    assert_eq!(
        digest_of("cc(0x15e); or(authvalue(), password())"),
        expected
    );
}

#[test]
fn test_sequence_equals_all() {
    assert_eq!(
        digest_of("cc(0x15e); authvalue()"),
        digest_of("all(cc(0x15e), authvalue())")
    );
}

#[test]
fn test_sha1_digest_size() {
    let mut trial = TrialPolicy::new(TpmAlgId::Sha1).unwrap();
    trial.apply(&parse_policy("authvalue()").unwrap()).unwrap();
    assert_eq!(trial.digest().len(), 20);
}

#[rstest]
#[case("pcr(sha256:0)")]
#[case("secret(tpm://0x81000001)")]
#[case("nv(tpm://0x01000001, 00, 0, eq)")]
#[case("or(authvalue())")]
#[case("pcr(sha256:0, 00ff)")]
fn test_offline_rejects(#[case] input: &str) {
    let mut trial = TrialPolicy::new(TpmAlgId::Sha256).unwrap();
    let before = trial.digest().to_vec();
    assert!(matches!(
        trial.apply(&parse_policy(input).unwrap()),
        Err(TpmError::InvalidParameter(_))
    ));
    assert_eq!(trial.digest(), before);
}

#[rstest]
#[case("tpm://0x40000001", Some(vec![0x40, 0x00, 0x00, 0x01]))]
#[case("tpm://0x03000000", Some(vec![0x03, 0x00, 0x00, 0x00]))]
#[case("data://hex,000bff", Some(vec![0x00, 0x0b, 0xff]))]
#[case("tpm://0x81000001", None)]
#[case("tpm://0x01000001", None)]
fn test_offline_names(#[case] input: &str, #[case] name: Option<Vec<u8>>) {
    let expr = parse_policy(input).unwrap();
    assert_eq!(expr_name(&expr).ok(), name);
}
