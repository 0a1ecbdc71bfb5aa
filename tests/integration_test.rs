// SPDX-License-Identifier: GPL-3-0-or-later
// Copyright (c) 2025 Opinsys Oy

use tpm2_protocol::{
    data::{
        Tpm2bDigest, TpmAlgId, TpmRc, TpmRcBase, TpmRh, TpmSe, TpmSt, TpmSu, TpmaSession,
        TpmsSensitiveCreate, TpmtSensitive, TpmtSignature, TpmuPublicId, TpmuSensitiveComposite,
    },
    TpmBuffer,
};
use tpm2ctx::{
    command::{hmac_key_template, sealed_data_template},
    crypto::{crypto_hmac, crypto_hmac_signature, crypto_make_name},
    device::TpmDevice,
    digest::hash_parts,
    mocktpm::{self, MockNvIndex},
    parser::{parse_policy, PolicyExpr},
    pcr::{pcr_selection_vec_from_str, pcr_selection_vec_to_tpml},
    resource::ResourceContext,
    session::{policy_signed_digest, SessionCipher},
    Authorization, Tpm, TpmError,
};

use rstest::{fixture, rstest};

const SECRET: &[u8] = b"sealed secret";
const AUTH: &[u8] = b"object auth";
const NV_INDEX: u32 = 0x0100_0001;
const PERSISTENT: u32 = 0x8100_0001;

#[fixture]
fn tpm() -> Tpm {
    let nv = MockNvIndex::new(NV_INDEX, TpmAlgId::Sha256, &[], vec![0, 0, 0, 0, 0, 0, 0, 5])
        .unwrap();
    let (_server, transport) = mocktpm::start(vec![nv]);
    Tpm::new(TpmDevice::new(Box::new(transport)))
}

fn rc_of(err: &TpmError) -> Option<TpmRc> {
    match err {
        TpmError::TpmRc(rc) => Some(*rc),
        _ => None,
    }
}

fn assert_rc(err: &TpmError, base: TpmRcBase) {
    assert_eq!(rc_of(err), Some(TpmRc::from(base)), "{err}");
}

fn sensitive(user_auth: &[u8], data: &[u8]) -> TpmsSensitiveCreate {
    TpmsSensitiveCreate {
        user_auth: user_auth.try_into().unwrap(),
        data: data.try_into().unwrap(),
    }
}

fn create_sealed(tpm: &mut Tpm, policy: Vec<u8>) -> u32 {
    let public = sealed_data_template(TpmAlgId::Sha256, &policy).unwrap();
    tpm.create_primary(
        TpmRh::Owner,
        Authorization::Password(b""),
        &public,
        &sensitive(AUTH, SECRET),
    )
    .unwrap()
}

fn start_session(tpm: &mut Tpm, session_type: TpmSe) -> u32 {
    tpm.start_auth_session(session_type, TpmAlgId::Sha256, SessionCipher::Null, None)
        .unwrap()
}

fn session_state(tpm: &Tpm, handle: u32) -> tpm2ctx::session::SessionContext {
    tpm.registry()
        .lookup(handle)
        .and_then(ResourceContext::as_session)
        .cloned()
        .expect("session is not tracked")
}

/// Drives a live policy session through the assertions of `expr`.
fn drive(tpm: &mut Tpm, session: u32, expr: &PolicyExpr) {
    match expr {
        PolicyExpr::Pcr { selection, digest } => {
            let tpml =
                pcr_selection_vec_to_tpml(&pcr_selection_vec_from_str(selection).unwrap()).unwrap();
            tpm.policy_pcr(session, digest.as_deref(), &tpml).unwrap();
        }
        PolicyExpr::Secret { policy_ref, .. } => {
            let policy_ref = policy_ref
                .as_ref()
                .map(|r| r.to_bytes().unwrap())
                .unwrap_or_default();
            tpm.policy_secret(
                TpmRh::Owner as u32,
                Authorization::Password(b""),
                session,
                &[],
                &policy_ref,
                0,
            )
            .unwrap();
        }
        PolicyExpr::CommandCode(cc) => {
            tpm.policy_command_code(session, *cc).unwrap();
        }
        PolicyExpr::AuthValue => tpm.policy_auth_value(session).unwrap(),
        PolicyExpr::Password => tpm.policy_password(session).unwrap(),
        PolicyExpr::Nv {
            operand,
            offset,
            op,
            ..
        } => {
            tpm.policy_nv(
                TpmRh::Owner as u32,
                Authorization::Password(b""),
                NV_INDEX,
                session,
                operand,
                *offset,
                *op,
            )
            .unwrap();
        }
        PolicyExpr::Or(branches) => {
            let digests: Vec<Vec<u8>> = branches
                .iter()
                .map(|branch| {
                    tpm.trial_policy(TpmAlgId::Sha256, branch)
                        .unwrap()
                        .digest()
                        .to_vec()
                })
                .collect();
            tpm.policy_or(session, &digests).unwrap();
        }
        PolicyExpr::All(items) => {
            for item in items {
                drive(tpm, session, item);
            }
        }
        other => panic!("not an assertion: {other}"),
    }
}

#[rstest]
fn test_unseal_with_password(mut tpm: Tpm) {
    let item = create_sealed(&mut tpm, Vec::new());
    assert_eq!(tpm.unseal(item, Authorization::Password(AUTH)).unwrap(), SECRET);

    let err = tpm
        .unseal(item, Authorization::Password(b"wrong"))
        .unwrap_err();
    assert_rc(&err, TpmRcBase::BadAuth);
}

#[rstest]
#[case(false)]
#[case(true)]
fn test_unseal_with_hmac_session(mut tpm: Tpm, #[case] bound: bool) {
    let item = create_sealed(&mut tpm, Vec::new());
    let bind = bound.then_some((item, AUTH));
    let session = tpm
        .start_auth_session(TpmSe::Hmac, TpmAlgId::Sha256, SessionCipher::Null, bind)
        .unwrap();
    let nonce_before = session_state(&tpm, session).nonce_tpm;

    for _ in 0..2 {
        let secret = tpm
            .unseal(item, Authorization::session(session, AUTH))
            .unwrap();
        assert_eq!(secret, SECRET);
    }
    assert_ne!(session_state(&tpm, session).nonce_tpm, nonce_before);

    // A session bound to the object leaves its authorization value out of
    // the HMAC key.
    let result = tpm.unseal(item, Authorization::session(session, b"wrong"));
    if bound {
        assert_eq!(result.unwrap(), SECRET);
    } else {
        assert_rc(&result.unwrap_err(), TpmRcBase::AuthFail);
    }
}

#[rstest]
fn test_session_closed_without_continue(mut tpm: Tpm) {
    let item = create_sealed(&mut tpm, Vec::new());
    let session = start_session(&mut tpm, TpmSe::Hmac);
    let auth = Authorization::Session {
        handle: session,
        auth_value: AUTH,
        attributes: TpmaSession::default(),
    };
    tpm.unseal(item, auth).unwrap();
    assert!(tpm.registry().lookup(session).is_none());
}

#[rstest]
#[case("authvalue()")]
#[case("password()")]
#[case("pcr(sha256:0,7); authvalue()")]
#[case("cc(0x15e); password()")]
#[case("secret(tpm://0x40000001, \"ref\"); authvalue()")]
#[case("nv(tpm://0x01000001, 0005, 6, uge); authvalue()")]
#[case("authvalue(); or(authvalue(), password())")]
fn test_policy_session_matches_trial(mut tpm: Tpm, #[case] input: &str) {
    let expr = parse_policy(input).unwrap();
    let trial = tpm.trial_policy(TpmAlgId::Sha256, &expr).unwrap();
    let item = create_sealed(&mut tpm, trial.digest().to_vec());

    let session = start_session(&mut tpm, TpmSe::Policy);
    drive(&mut tpm, session, &expr);
    assert_eq!(tpm.policy_get_digest(session).unwrap(), trial.digest());

    let secret = tpm
        .unseal(item, Authorization::session(session, AUTH))
        .unwrap();
    assert_eq!(secret, SECRET);
}

#[rstest]
fn test_trial_session_digest(mut tpm: Tpm) {
    let expr = parse_policy("pcr(sha256:0,7); cc(0x15e)").unwrap();
    let trial = tpm.trial_policy(TpmAlgId::Sha256, &expr).unwrap();
    let session = start_session(&mut tpm, TpmSe::Trial);
    drive(&mut tpm, session, &expr);
    assert_eq!(tpm.policy_get_digest(session).unwrap(), trial.digest());

    tpm.policy_restart(session).unwrap();
    assert_eq!(tpm.policy_get_digest(session).unwrap(), vec![0; 32]);
}

#[rstest]
fn test_auth_value_and_password_differ(mut tpm: Tpm) {
    let auth_value = start_session(&mut tpm, TpmSe::Trial);
    tpm.policy_auth_value(auth_value).unwrap();
    let password = start_session(&mut tpm, TpmSe::Trial);
    tpm.policy_password(password).unwrap();
    assert_ne!(
        tpm.policy_get_digest(auth_value).unwrap(),
        tpm.policy_get_digest(password).unwrap()
    );
}

#[rstest]
fn test_policy_mismatch(mut tpm: Tpm) {
    let expr = parse_policy("authvalue()").unwrap();
    let digest = tpm.trial_policy(TpmAlgId::Sha256, &expr).unwrap();
    let item = create_sealed(&mut tpm, digest.digest().to_vec());

    let session = start_session(&mut tpm, TpmSe::Policy);
    tpm.policy_password(session).unwrap();
    let err = tpm
        .unseal(item, Authorization::session(session, AUTH))
        .unwrap_err();
    assert_rc(&err, TpmRcBase::PolicyFail);

    let err = tpm.unseal(item, Authorization::Password(AUTH)).unwrap_err();
    assert_rc(&err, TpmRcBase::AuthUnavailable);
}

#[rstest]
fn test_policy_nv_comparison_fails(mut tpm: Tpm) {
    let session = start_session(&mut tpm, TpmSe::Policy);
    let err = tpm
        .policy_nv(
            TpmRh::Owner as u32,
            Authorization::Password(b""),
            NV_INDEX,
            session,
            &[0, 6],
            6,
            "uge".parse().unwrap(),
        )
        .unwrap_err();
    assert_rc(&err, TpmRcBase::Policy);
}

#[rstest]
#[case(-60, false)]
#[case(100, true)]
fn test_policy_secret_expiration(mut tpm: Tpm, #[case] expiration: i32, #[case] null: bool) {
    let session = start_session(&mut tpm, TpmSe::Policy);
    let (timeout, ticket) = tpm
        .policy_secret(
            TpmRh::Owner as u32,
            Authorization::Password(b""),
            session,
            &[],
            b"ref",
            expiration,
        )
        .unwrap();
    assert_eq!(timeout.is_empty(), null);
    assert_eq!(ticket.tag, TpmSt::AuthSecret);
    assert_eq!(ticket.hierarchy == TpmRh::Null, null);
}

#[rstest]
fn test_policy_ticket_reuse(mut tpm: Tpm) {
    let first = start_session(&mut tpm, TpmSe::Policy);
    let (timeout, ticket) = tpm
        .policy_secret(
            TpmRh::Owner as u32,
            Authorization::Password(b""),
            first,
            &[],
            b"ref",
            -60,
        )
        .unwrap();
    let expected = tpm.policy_get_digest(first).unwrap();
    let owner_name = (TpmRh::Owner as u32).to_be_bytes();

    for _ in 0..2 {
        let session = start_session(&mut tpm, TpmSe::Policy);
        tpm.policy_ticket(session, &timeout, &[], b"ref", &owner_name, &ticket)
            .unwrap();
        assert_eq!(tpm.policy_get_digest(session).unwrap(), expected);
    }

    let mut digest = ticket.digest.to_vec();
    digest[0] ^= 1;
    let mut forged = ticket.clone();
    forged.digest = Tpm2bDigest::try_from(digest.as_slice()).unwrap();
    let session = start_session(&mut tpm, TpmSe::Policy);
    let err = tpm
        .policy_ticket(session, &timeout, &[], b"ref", &owner_name, &forged)
        .unwrap_err();
    assert_rc(&err, TpmRcBase::Ticket);

    let err = tpm
        .policy_ticket(session, &timeout, &[], b"other", &owner_name, &ticket)
        .unwrap_err();
    assert_rc(&err, TpmRcBase::Ticket);
}

#[rstest]
fn test_policy_signed(mut tpm: Tpm) {
    let key = [0x5a; 32];
    let signer = tpm
        .create_primary(
            TpmRh::Owner,
            Authorization::Password(b""),
            &hmac_key_template(TpmAlgId::Sha256, &[]).unwrap(),
            &sensitive(&[], &key),
        )
        .unwrap();
    let name = tpm.name_of(signer).unwrap();
    let expr = parse_policy(&format!("signed(data://hex,{})", hex::encode(&name))).unwrap();
    let trial = tpm.trial_policy(TpmAlgId::Sha256, &expr).unwrap();

    let session = start_session(&mut tpm, TpmSe::Policy);
    let nonce = tpm.nonce_tpm(session).unwrap();
    let a_hash = policy_signed_digest(TpmAlgId::Sha256, &nonce, 0, &[], &[]).unwrap();
    let hmac = crypto_hmac(TpmAlgId::Sha256, &key, &[&a_hash]).unwrap();
    let signature = crypto_hmac_signature(TpmAlgId::Sha256, &hmac).unwrap();
    tpm.policy_signed(signer, session, &[], &[], 0, &signature)
        .unwrap();
    assert_eq!(tpm.policy_get_digest(session).unwrap(), trial.digest());

    let stale = start_session(&mut tpm, TpmSe::Policy);
    let err = tpm
        .policy_signed(signer, stale, &[], &[], 0, &signature)
        .unwrap_err();
    assert_rc(&err, TpmRcBase::Signature);
}

#[rstest]
fn test_session_save_load(mut tpm: Tpm) {
    let item = create_sealed(&mut tpm, Vec::new());
    let session = start_session(&mut tpm, TpmSe::Hmac);
    tpm.unseal(item, Authorization::session(session, AUTH))
        .unwrap();
    let before = session_state(&tpm, session);

    let saved = tpm.context_save(session).unwrap();
    assert!(!session_state(&tpm, session).usable);
    let err = tpm
        .unseal(item, Authorization::session(session, AUTH))
        .unwrap_err();
    assert!(matches!(err, TpmError::InvalidParameter(_)));

    let loaded = tpm.context_load(&saved).unwrap();
    assert_eq!(loaded, session);
    let after = session_state(&tpm, session);
    assert!(after.usable);
    assert_eq!(after.session_key, before.session_key);
    assert_eq!(after.nonce_tpm, before.nonce_tpm);

    let secret = tpm
        .unseal(item, Authorization::session(session, AUTH))
        .unwrap();
    assert_eq!(secret, SECRET);
}

#[rstest]
fn test_policy_session_save_load(mut tpm: Tpm) {
    let expr = parse_policy("password()").unwrap();
    let digest = tpm.trial_policy(TpmAlgId::Sha256, &expr).unwrap();
    let item = create_sealed(&mut tpm, digest.digest().to_vec());

    let session = start_session(&mut tpm, TpmSe::Policy);
    tpm.policy_password(session).unwrap();
    let saved = tpm.context_save(session).unwrap();
    let err = tpm.policy_auth_value(session).unwrap_err();
    assert!(matches!(err, TpmError::InvalidParameter(_)));

    tpm.context_load(&saved).unwrap();
    let secret = tpm
        .unseal(item, Authorization::session(session, AUTH))
        .unwrap();
    assert_eq!(secret, SECRET);
}

#[rstest]
fn test_object_save_load(mut tpm: Tpm) {
    let item = create_sealed(&mut tpm, Vec::new());
    let name = tpm.name_of(item).unwrap();
    let saved = tpm.context_save(item).unwrap();
    tpm.flush_context(item).unwrap();
    assert!(tpm.registry().lookup(item).is_none());

    let loaded = tpm.context_load(&saved).unwrap();
    assert_ne!(loaded, item);
    assert_eq!(tpm.registry().get(loaded).unwrap().name(), name);
    assert_eq!(
        tpm.unseal(loaded, Authorization::Password(AUTH)).unwrap(),
        SECRET
    );
}

#[rstest]
fn test_tampered_context(mut tpm: Tpm) {
    let session = start_session(&mut tpm, TpmSe::Hmac);
    let mut saved = tpm.context_save(session).unwrap();
    let mut blob = saved.context_blob.to_vec();
    let last = blob.len() - 1;
    blob[last] ^= 0x01;
    saved.context_blob = TpmBuffer::try_from(blob.as_slice()).unwrap();
    assert!(matches!(
        tpm.context_load(&saved),
        Err(TpmError::Integrity(_))
    ));
    assert!(!session_state(&tpm, session).usable);
}

#[rstest]
fn test_exclusive_audit_session(mut tpm: Tpm) {
    let item = create_sealed(&mut tpm, Vec::new());
    let audit = start_session(&mut tpm, TpmSe::Hmac);
    let exclusive = Authorization::Session {
        handle: audit,
        auth_value: AUTH,
        attributes: TpmaSession::CONTINUE_SESSION | TpmaSession::AUDIT | TpmaSession::AUDIT_RESET,
    };
    tpm.unseal(item, exclusive).unwrap();
    assert_eq!(tpm.exclusive_session(), Some(audit));
    assert!(session_state(&tpm, audit).is_exclusive);

    let saved = tpm.context_save(audit).unwrap();
    tpm.context_load(&saved).unwrap();
    let state = session_state(&tpm, audit);
    assert!(state.is_audit);
    assert!(state.is_exclusive);

    let other = start_session(&mut tpm, TpmSe::Hmac);
    tpm.unseal(item, Authorization::session(other, AUTH))
        .unwrap();
    assert_eq!(tpm.exclusive_session(), None);
    assert!(!session_state(&tpm, audit).is_exclusive);

    let saved = tpm.context_save(audit).unwrap();
    tpm.context_load(&saved).unwrap();
    assert!(!session_state(&tpm, audit).is_exclusive);
}

#[rstest]
fn test_startup_evicts_transient(mut tpm: Tpm) {
    let item = create_sealed(&mut tpm, Vec::new());
    let session = start_session(&mut tpm, TpmSe::Hmac);
    tpm.evict_control(Authorization::Password(b""), item, PERSISTENT)
        .unwrap();

    tpm.startup(TpmSu::Clear).unwrap();
    let handles: Vec<u32> = tpm.registry().handles().collect();
    assert!(handles.contains(&PERSISTENT));
    assert!(!handles.contains(&item));
    assert!(tpm.registry().lookup(session).is_none());

    assert_eq!(
        tpm.unseal(PERSISTENT, Authorization::Password(AUTH)).unwrap(),
        SECRET
    );
    tpm.evict_control(Authorization::Password(b""), PERSISTENT, PERSISTENT)
        .unwrap();
    assert!(tpm.registry().lookup(PERSISTENT).is_none());
}

#[rstest]
fn test_flush_twice(mut tpm: Tpm) {
    let session = start_session(&mut tpm, TpmSe::Policy);
    tpm.flush_context(session).unwrap();
    assert!(tpm.registry().lookup(session).is_none());

    let err = tpm.flush_context(session).unwrap_err();
    assert_rc(&err, TpmRcBase::Handle);
    assert!(tpm.registry().is_empty());
}

#[rstest]
fn test_pcr_read(mut tpm: Tpm) {
    let tpml = pcr_selection_vec_to_tpml(&pcr_selection_vec_from_str("sha256:0,7+sha1:1").unwrap())
        .unwrap();
    let (selection, values) = tpm.pcr_read(&tpml).unwrap();
    assert_eq!(selection, tpml);
    let mut sizes: Vec<usize> = values.iter().map(Vec::len).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, [20, 32, 32]);
    assert!(values.iter().flatten().all(|&b| b == 0));
}

#[rstest]
fn test_nv_read_public(mut tpm: Tpm) {
    let (public, name) = tpm.nv_read_public(NV_INDEX).unwrap();
    assert_eq!(public.name_alg, TpmAlgId::Sha256);
    assert_eq!(&name[..2], &(TpmAlgId::Sha256 as u16).to_be_bytes());
    assert_eq!(tpm.name_of(NV_INDEX).unwrap(), name);
}

#[rstest]
fn test_create_load_save_load(mut tpm: Tpm) {
    let parent = create_sealed(&mut tpm, Vec::new());
    let template = sealed_data_template(TpmAlgId::Sha256, &[]).unwrap();
    let (private, public) = tpm
        .create(
            parent,
            Authorization::Password(AUTH),
            &template,
            &sensitive(b"child", b"child secret"),
        )
        .unwrap();

    let child = tpm
        .load(parent, Authorization::Password(AUTH), &private, &public)
        .unwrap();
    let name = crypto_make_name(&public).unwrap();
    assert_eq!(tpm.registry().get(child).unwrap().name(), name);

    let saved = tpm.context_save(child).unwrap();
    tpm.flush_context(child).unwrap();
    let loaded = tpm.context_load(&saved).unwrap();
    assert_eq!(tpm.registry().get(loaded).unwrap().name(), name);
    assert_eq!(
        tpm.unseal(loaded, Authorization::Password(b"child")).unwrap(),
        b"child secret"
    );

    let other = create_sealed(&mut tpm, Vec::new());
    let err = tpm
        .load(other, Authorization::Password(AUTH), &private, &public)
        .unwrap_err();
    assert_rc(&err, TpmRcBase::Integrity);
}

#[rstest]
fn test_load_external(mut tpm: Tpm) {
    let mut public = sealed_data_template(TpmAlgId::Sha256, &[]).unwrap();
    let unique = hash_parts(TpmAlgId::Sha256, &[b"".as_slice(), SECRET]).unwrap();
    public.unique = TpmuPublicId::KeyedHash(unique.as_slice().try_into().unwrap());
    let private = TpmtSensitive {
        sensitive_type: TpmAlgId::KeyedHash,
        auth_value: AUTH.try_into().unwrap(),
        seed_value: Tpm2bDigest::default(),
        sensitive: TpmuSensitiveComposite::Bits(SECRET.try_into().unwrap()),
    };

    let handle = tpm.load_external(TpmRh::Null, &public, &private).unwrap();
    assert_eq!(
        tpm.registry().get(handle).unwrap().name(),
        crypto_make_name(&public).unwrap()
    );
    assert_eq!(
        tpm.unseal(handle, Authorization::Password(AUTH)).unwrap(),
        SECRET
    );

    let err = tpm
        .load_external(TpmRh::Owner, &public, &private)
        .unwrap_err();
    assert_rc(&err, TpmRcBase::Hierarchy);
}

#[rstest]
#[case(0x15d)]
#[case(0x14e)]
fn test_policy_command_code_any_value(mut tpm: Tpm, #[case] code: u32) {
    let expr = parse_policy(&format!("cc(0x{code:x}); password()")).unwrap();
    let trial = tpm.trial_policy(TpmAlgId::Sha256, &expr).unwrap();
    let item = create_sealed(&mut tpm, trial.digest().to_vec());

    let session = start_session(&mut tpm, TpmSe::Policy);
    drive(&mut tpm, session, &expr);
    assert_eq!(tpm.policy_get_digest(session).unwrap(), trial.digest());

    let err = tpm
        .unseal(item, Authorization::session(session, AUTH))
        .unwrap_err();
    assert_rc(&err, TpmRcBase::PolicyCc);
}

#[rstest]
fn test_policy_signed_rejects_other_schemes(mut tpm: Tpm) {
    let key = [0x5a; 32];
    let signer = tpm
        .create_primary(
            TpmRh::Owner,
            Authorization::Password(b""),
            &hmac_key_template(TpmAlgId::Sha256, &[]).unwrap(),
            &sensitive(&[], &key),
        )
        .unwrap();
    let session = start_session(&mut tpm, TpmSe::Policy);
    let nonce = tpm.nonce_tpm(session).unwrap();
    let a_hash = policy_signed_digest(TpmAlgId::Sha256, &nonce, 0, &[], &[]).unwrap();
    let hmac = crypto_hmac(TpmAlgId::Sha256, &key, &[&a_hash]).unwrap();
    let signature = TpmtSignature {
        sig_alg: TpmAlgId::Null,
        ..crypto_hmac_signature(TpmAlgId::Sha256, &hmac).unwrap()
    };
    let err = tpm
        .policy_signed(signer, session, &[], &[], 0, &signature)
        .unwrap_err();
    assert_rc(&err, TpmRcBase::Scheme);
}
