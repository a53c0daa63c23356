use std::path::Path;
use std::time::Duration;

use der::Decode;
use hap_verify::chain::{check_validity, CertChainBuilder};
use hap_verify::crl::is_revoked;
use hap_verify::pkcs7::Pkcs7Context;
use hap_verify::roots::TrustedRoots;
use hap_verify::trust::{AppSource, MatchState};
use hap_verify::{CrlStore, Error, MemoryCrlStorage, TrustStore};
use x509_cert::crl::CertificateList;
use x509_cert::Certificate;

const SUB_CA_NAME: &str = "C=CN, O=OpenHarmony, OU=OpenHarmony Team, CN=OpenHarmony Application CA";

// 2024-06-01T12:00:00Z
const SIGNING_TIME: Duration = Duration::from_secs(1_717_243_200);

fn cert(der: &[u8]) -> Certificate {
    Certificate::from_der(der).unwrap()
}

fn crl(der: &[u8]) -> CertificateList {
    CertificateList::from_der(der).unwrap()
}

fn root() -> Certificate {
    cert(include_bytes!("data/root.der"))
}

fn sub_ca() -> Certificate {
    cert(include_bytes!("data/sub_ca.der"))
}

fn app_release() -> Certificate {
    cert(include_bytes!("data/app_release.der"))
}

fn roots() -> TrustedRoots {
    let mut roots = TrustedRoots::default();
    roots.add_root(root());
    roots
}

#[test]
fn test_chain_to_root() {
    let roots = roots();
    let available = vec![app_release(), sub_ca()];
    let chain = CertChainBuilder::new(&available, &roots, false)
        .build(&available[0])
        .unwrap();
    assert_eq!(3, chain.len());
    assert_eq!(app_release(), chain[0]);
    assert_eq!(sub_ca(), chain[1]);
    assert_eq!(root(), chain[2]);
}

#[test]
fn test_embedded_root_is_not_repeated() {
    let roots = roots();
    let available = vec![root(), app_release(), sub_ca()];
    let chain = CertChainBuilder::new(&available, &roots, false)
        .build(&available[1])
        .unwrap();
    assert_eq!(3, chain.len());
    assert_eq!(root(), chain[2]);
}

#[test]
fn test_missing_intermediate() {
    let roots = roots();
    let available = vec![app_release()];
    let result = CertChainBuilder::new(&available, &roots, false).build(&available[0]);
    assert!(matches!(result, Err(Error::NotTrustedRoot(issuer)) if issuer == SUB_CA_NAME));
}

#[test]
fn test_issuer_cycle_terminates() {
    let roots = roots();
    let available = vec![
        cert(include_bytes!("data/cycle_a.der")),
        cert(include_bytes!("data/cycle_b.der")),
    ];
    let result = CertChainBuilder::new(&available, &roots, false).build(&available[0]);
    assert!(matches!(result, Err(Error::NotTrustedRoot(_))));
}

#[test]
fn test_validity_at_signing_time() {
    let chain = vec![app_release(), sub_ca(), root()];
    assert!(check_validity(&chain, SIGNING_TIME).is_ok());

    // 2045-01-01, after every certificate expired
    let late = Duration::from_secs(2_366_841_600);
    assert!(matches!(
        check_validity(&chain, late),
        Err(Error::CertificateExpired(_))
    ));

    // 2019-01-01, before any certificate was issued
    let early = Duration::from_secs(1_546_300_800);
    assert!(check_validity(&chain, early).is_err());
}

#[test]
fn test_crl_freshness() {
    let old = crl(include_bytes!("data/crl_old.der"));
    let new = crl(include_bytes!("data/crl_new.der"));
    let store = CrlStore::in_memory();

    let (chosen, changed) = store.reconcile(SUB_CA_NAME, Some(&old)).unwrap();
    assert_eq!(Some(old.clone()), chosen);
    assert!(changed);

    let (chosen, changed) = store.reconcile(SUB_CA_NAME, Some(&new)).unwrap();
    assert_eq!(Some(new.clone()), chosen);
    assert!(changed);

    let (chosen, changed) = store.reconcile(SUB_CA_NAME, Some(&old)).unwrap();
    assert_eq!(Some(new.clone()), chosen);
    assert!(!changed);

    let (chosen, changed) = store.reconcile(SUB_CA_NAME, None).unwrap();
    assert_eq!(Some(new), chosen);
    assert!(!changed);

    assert_eq!((None, false), store.reconcile("C=CN, CN=Unknown", None).unwrap());
}

#[test]
fn test_revoked_serials() {
    let new = crl(include_bytes!("data/crl_new.der"));
    let old = crl(include_bytes!("data/crl_old.der"));
    let revoked = cert(include_bytes!("data/app_revoked.der"));
    assert!(is_revoked(&revoked, &new));
    assert!(!is_revoked(&revoked, &old));
    assert!(!is_revoked(&app_release(), &new));
}

#[test]
fn test_cached_crls_load_from_storage() {
    let storage = MemoryCrlStorage::new(vec![include_bytes!("data/crl_old.der").to_vec()]);
    let store = CrlStore::new(Box::new(storage)).unwrap();
    let cached = store.get(SUB_CA_NAME).unwrap();
    assert_eq!(crl(include_bytes!("data/crl_old.der")), cached);

    let garbage = MemoryCrlStorage::new(vec![vec![0x30, 0x03, 0x02]]);
    assert!(CrlStore::new(Box::new(garbage)).is_err());
}

#[test]
fn test_ticket_signer_matches_ticket_source() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data/trust");
    let trust = TrustStore::from_dir(&dir, CrlStore::in_memory()).unwrap();

    let mut ctx = Pkcs7Context::parse(include_bytes!("data/ticket.p7b")).unwrap();
    ctx.verify(&trust, false).unwrap();
    assert_eq!(3, ctx.primary_chain().len());
    assert_eq!(SUB_CA_NAME, ctx.cert_issuer);

    let result = ctx.match_ticket_source(&trust, false);
    assert_eq!(MatchState::MatchTicket, result.state);
    assert_eq!(AppSource::AppGallery, result.source);
    assert!(std::str::from_utf8(&ctx.content)
        .unwrap()
        .contains("com.example.ticketed"));
}
