//! Minimal DER certificate builder for pipeline tests: enough X.509 to
//! exercise chain validation, precert handling, and signatures, with real
//! ECDSA P-256 keys.
#![allow(dead_code)]

use p256::ecdsa::signature::Signer;
use p256::ecdsa::{DerSignature, SigningKey};
use p256::pkcs8::EncodePublicKey;
use p256::SecretKey;

// DER-encoded OIDs (tag + length included).
const OID_CN: &[u8] = &[0x06, 0x03, 0x55, 0x04, 0x03];
const OID_ECDSA_SHA256: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02];
const OID_EKU: &[u8] = &[0x06, 0x03, 0x55, 0x1d, 0x25];
pub const OID_SERVER_AUTH: &[u8] = &[0x06, 0x08, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x01];
pub const OID_PRECERT_SIGNING: &[u8] = &[
    0x06, 0x0a, 0x2b, 0x06, 0x01, 0x04, 0x01, 0xd6, 0x79, 0x02, 0x04, 0x04,
];
const OID_CT_POISON: &[u8] = &[
    0x06, 0x0a, 0x2b, 0x06, 0x01, 0x04, 0x01, 0xd6, 0x79, 0x02, 0x04, 0x03,
];
const OID_AKI: &[u8] = &[0x06, 0x03, 0x55, 0x1d, 0x23];

fn write_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.push(0x80 | (8 - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    write_len(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

/// `Name ::= SEQUENCE { SET { SEQUENCE { CN, UTF8String } } }`
pub fn name(cn: &str) -> Vec<u8> {
    let mut atv = OID_CN.to_vec();
    atv.extend(tlv(0x0c, cn.as_bytes()));
    tlv(0x30, &tlv(0x31, &tlv(0x30, &atv)))
}

fn utc_time(s: &str) -> Vec<u8> {
    tlv(0x17, s.as_bytes())
}

pub struct Extension {
    pub oid: &'static [u8],
    pub critical: bool,
    pub value: Vec<u8>,
}

/// Critical CT poison: `OCTET STRING { NULL }`.
pub fn poison_extension() -> Extension {
    Extension {
        oid: OID_CT_POISON,
        critical: true,
        value: vec![0x05, 0x00],
    }
}

/// ExtendedKeyUsage over DER-encoded usage OIDs.
pub fn eku_extension(usages: &[&[u8]]) -> Extension {
    let mut seq = Vec::new();
    for oid in usages {
        seq.extend_from_slice(oid);
    }
    Extension {
        oid: OID_EKU,
        critical: false,
        value: tlv(0x30, &seq),
    }
}

/// AuthorityKeyIdentifier with an opaque key id.
pub fn aki_extension(key_id: &[u8]) -> Extension {
    Extension {
        oid: OID_AKI,
        critical: false,
        value: tlv(0x30, &tlv(0x80, key_id)),
    }
}

pub struct CertParams<'a> {
    pub subject_cn: &'a str,
    pub issuer_cn: &'a str,
    pub serial: u8,
    /// UTCTime strings, e.g. `"240101000000Z"`.
    pub not_before: &'a str,
    pub not_after: &'a str,
    pub extensions: Vec<Extension>,
}

/// Builds and signs a certificate for `subject_key`, signed by
/// `issuer_key`.
pub fn make_cert(params: &CertParams<'_>, subject_key: &SecretKey, issuer_key: &SecretKey) -> Vec<u8> {
    let spki = subject_key
        .public_key()
        .to_public_key_der()
        .expect("spki")
        .into_vec();

    let mut tbs_content = Vec::new();
    // version [0] EXPLICIT v3
    tbs_content.extend(tlv(0xa0, &tlv(0x02, &[0x02])));
    tbs_content.extend(tlv(0x02, &[params.serial]));
    tbs_content.extend(tlv(0x30, OID_ECDSA_SHA256));
    tbs_content.extend(name(params.issuer_cn));
    let mut validity = utc_time(params.not_before);
    validity.extend(utc_time(params.not_after));
    tbs_content.extend(tlv(0x30, &validity));
    tbs_content.extend(name(params.subject_cn));
    tbs_content.extend_from_slice(&spki);
    if !params.extensions.is_empty() {
        let mut exts = Vec::new();
        for ext in &params.extensions {
            let mut inner = ext.oid.to_vec();
            if ext.critical {
                inner.extend(tlv(0x01, &[0xff]));
            }
            inner.extend(tlv(0x04, &ext.value));
            exts.extend(tlv(0x30, &inner));
        }
        tbs_content.extend(tlv(0xa3, &tlv(0x30, &exts)));
    }
    let tbs = tlv(0x30, &tbs_content);

    let signer = SigningKey::from(issuer_key);
    let sig: DerSignature = signer.sign(&tbs);
    let mut bitstring = vec![0x00];
    bitstring.extend_from_slice(sig.as_bytes());

    let mut cert = tbs;
    cert.extend(tlv(0x30, OID_ECDSA_SHA256));
    cert.extend(tlv(0x03, &bitstring));
    tlv(0x30, &cert)
}

pub struct TestCa {
    pub root_key: SecretKey,
    pub root_der: Vec<u8>,
}

impl TestCa {
    pub fn new() -> Self {
        let root_key = SecretKey::random(&mut rand::rngs::OsRng);
        let root_der = make_cert(
            &CertParams {
                subject_cn: "Itko Test Root",
                issuer_cn: "Itko Test Root",
                serial: 1,
                not_before: "240101000000Z",
                not_after: "350101000000Z",
                extensions: vec![],
            },
            &root_key,
            &root_key,
        );
        Self { root_key, root_der }
    }

    /// A serverAuth leaf chained directly to the root.
    pub fn leaf(&self, cn: &str, serial: u8) -> Vec<u8> {
        let key = SecretKey::random(&mut rand::rngs::OsRng);
        make_cert(
            &CertParams {
                subject_cn: cn,
                issuer_cn: "Itko Test Root",
                serial,
                not_before: "240601000000Z",
                not_after: "250601000000Z",
                extensions: vec![eku_extension(&[OID_SERVER_AUTH])],
            },
            &key,
            &self.root_key,
        )
    }

    /// A poisoned precert chained directly to the root.
    pub fn precert(&self, cn: &str, serial: u8) -> Vec<u8> {
        let key = SecretKey::random(&mut rand::rngs::OsRng);
        make_cert(
            &CertParams {
                subject_cn: cn,
                issuer_cn: "Itko Test Root",
                serial,
                not_before: "240601000000Z",
                not_after: "250601000000Z",
                extensions: vec![eku_extension(&[OID_SERVER_AUTH]), poison_extension()],
            },
            &key,
            &self.root_key,
        )
    }

    /// A pre-issuer intermediate plus a precert it signed.
    pub fn preissuer_chain(&self, cn: &str) -> (Vec<u8>, Vec<u8>) {
        let preissuer_key = SecretKey::random(&mut rand::rngs::OsRng);
        let preissuer = make_cert(
            &CertParams {
                subject_cn: "Itko Test PreIssuer",
                issuer_cn: "Itko Test Root",
                serial: 10,
                not_before: "240101000000Z",
                not_after: "300101000000Z",
                extensions: vec![
                    eku_extension(&[OID_PRECERT_SIGNING]),
                    aki_extension(&[0xaa; 20]),
                ],
            },
            &preissuer_key,
            &self.root_key,
        );
        let leaf_key = SecretKey::random(&mut rand::rngs::OsRng);
        let precert = make_cert(
            &CertParams {
                subject_cn: cn,
                issuer_cn: "Itko Test PreIssuer",
                serial: 11,
                not_before: "240601000000Z",
                not_after: "250601000000Z",
                extensions: vec![
                    eku_extension(&[OID_SERVER_AUTH]),
                    aki_extension(&[0xbb; 20]),
                    poison_extension(),
                ],
            },
            &leaf_key,
            &preissuer_key,
        );
        (precert, preissuer)
    }
}
