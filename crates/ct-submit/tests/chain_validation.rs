mod common;

use common::{eku_extension, make_cert, CertParams, TestCa, OID_SERVER_AUTH};
use p256::SecretKey;
use time::macros::datetime;

use ct_submit::chain::{validate_chain, AcceptancePolicy, ChainError, RootPool};

fn policy(require_eku: bool) -> AcceptancePolicy {
    AcceptancePolicy {
        not_after_start: datetime!(2024-01-01 00:00:00 UTC),
        not_after_limit: datetime!(2026-01-01 00:00:00 UTC),
        require_server_auth_eku: require_eku,
    }
}

#[test]
fn accepts_leaf_and_appends_pool_root() {
    let ca = TestCa::new();
    let pool = RootPool::new(vec![ca.root_der.clone()]).unwrap();
    let leaf = ca.leaf("valid.example.org", 2);

    let full = validate_chain(&[leaf.clone()], &pool, &policy(true)).unwrap();
    assert_eq!(full.len(), 2);
    assert_eq!(full[0], leaf);
    assert_eq!(full[1], ca.root_der);

    // Submitting the root explicitly does not duplicate it.
    let full = validate_chain(&[leaf, ca.root_der.clone()], &pool, &policy(true)).unwrap();
    assert_eq!(full.len(), 2);
}

#[test]
fn rejects_unknown_root() {
    let ca = TestCa::new();
    let other = TestCa::new();
    let pool = RootPool::new(vec![other.root_der.clone()]).unwrap();
    let leaf = ca.leaf("valid.example.org", 2);
    assert!(matches!(
        validate_chain(&[leaf], &pool, &policy(true)),
        Err(ChainError::UntrustedRoot)
    ));
}

#[test]
fn rejects_broken_link() {
    let ca = TestCa::new();
    let other = TestCa::new();
    let pool = RootPool::new(vec![ca.root_der.clone(), other.root_der.clone()]).unwrap();
    // Leaf from one CA presented with the other CA as its issuer.
    let leaf = ca.leaf("valid.example.org", 2);
    assert!(matches!(
        validate_chain(&[leaf, other.root_der.clone()], &pool, &policy(true)),
        Err(ChainError::BrokenLink(0))
    ));
}

#[test]
fn rejects_not_after_outside_window() {
    let ca = TestCa::new();
    let pool = RootPool::new(vec![ca.root_der.clone()]).unwrap();
    let key = SecretKey::random(&mut rand::rngs::OsRng);
    let stale = make_cert(
        &CertParams {
            subject_cn: "stale.example.org",
            issuer_cn: "Itko Test Root",
            serial: 3,
            not_before: "200101000000Z",
            not_after: "230101000000Z",
            extensions: vec![eku_extension(&[OID_SERVER_AUTH])],
        },
        &key,
        &ca.root_key,
    );
    assert!(matches!(
        validate_chain(&[stale], &pool, &policy(true)),
        Err(ChainError::NotAfterOutOfWindow(_))
    ));

    let future = make_cert(
        &CertParams {
            subject_cn: "future.example.org",
            issuer_cn: "Itko Test Root",
            serial: 4,
            not_before: "250101000000Z",
            not_after: "300101000000Z",
            extensions: vec![eku_extension(&[OID_SERVER_AUTH])],
        },
        &key,
        &ca.root_key,
    );
    assert!(validate_chain(&[future], &pool, &policy(true)).is_err());
}

#[test]
fn eku_policy_is_a_toggle() {
    let ca = TestCa::new();
    let pool = RootPool::new(vec![ca.root_der.clone()]).unwrap();
    let key = SecretKey::random(&mut rand::rngs::OsRng);
    let no_eku = make_cert(
        &CertParams {
            subject_cn: "noeku.example.org",
            issuer_cn: "Itko Test Root",
            serial: 5,
            not_before: "240601000000Z",
            not_after: "250601000000Z",
            extensions: vec![],
        },
        &key,
        &ca.root_key,
    );
    assert!(matches!(
        validate_chain(&[no_eku.clone()], &pool, &policy(true)),
        Err(ChainError::MissingServerAuthEku)
    ));
    // The permissive configuration accepts the same leaf.
    assert!(validate_chain(&[no_eku], &pool, &policy(false)).is_ok());
}

#[test]
fn rejects_empty_chain() {
    let ca = TestCa::new();
    let pool = RootPool::new(vec![ca.root_der]).unwrap();
    assert!(matches!(
        validate_chain(&[], &pool, &policy(true)),
        Err(ChainError::Empty)
    ));
}
