//! Certificate inspection helpers and the RFC 6962 precert TBS rebuild.
//!
//! Parsing leans on `x509-parser`; the TBS rebuild works at the DER TLV
//! level because it must reproduce the exact byte layout the final
//! certificate will have: poison extension removed, and, when a pre-issuer
//! signed the precert, issuer name and authority key identifier swapped to
//! the real CA's.

use sha2::{Digest, Sha256};
use thiserror::Error;
use asn1_rs::{oid, Oid};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::FromDer;

/// RFC 6962 CT poison extension (1.3.6.1.4.1.11129.2.4.3).
pub const OID_CT_POISON: Oid<'static> = oid!(1.3.6.1.4.1.11129.2.4.3);
/// RFC 6962 precertificate-signing EKU (1.3.6.1.4.1.11129.2.4.4).
pub const OID_EKU_PRECERT_SIGNING: Oid<'static> = oid!(1.3.6.1.4.1.11129.2.4.4);
/// id-kp-serverAuth.
pub const OID_EKU_SERVER_AUTH: Oid<'static> = oid!(1.3.6.1.5.5.7.3.1);
/// Authority key identifier (2.5.29.35).
pub const OID_AUTHORITY_KEY_ID: Oid<'static> = oid!(2.5.29.35);

#[derive(Debug, Error)]
pub enum X509Error {
    #[error("unable to parse certificate: {0}")]
    Parse(String),
    #[error("malformed DER: {0}")]
    Der(&'static str),
    #[error("signature verification failed")]
    BadSignature,
}

pub fn parse(der: &[u8]) -> Result<X509Certificate<'_>, X509Error> {
    let (rest, cert) =
        X509Certificate::from_der(der).map_err(|e| X509Error::Parse(e.to_string()))?;
    if !rest.is_empty() {
        return Err(X509Error::Der("trailing bytes after certificate"));
    }
    Ok(cert)
}

/// A certificate is a precertificate iff it carries the critical poison
/// extension.
pub fn is_precert(cert: &X509Certificate<'_>) -> bool {
    cert.extensions()
        .iter()
        .any(|ext| ext.oid == OID_CT_POISON)
}

/// A pre-issuer is an intermediate whose EKU contains the CT
/// precertificate-signing usage.
pub fn is_preissuer(cert: &X509Certificate<'_>) -> bool {
    eku(cert).is_some_and(|e| e.other.iter().any(|o| *o == OID_EKU_PRECERT_SIGNING))
}

pub fn has_server_auth_eku(cert: &X509Certificate<'_>) -> bool {
    eku(cert).is_some_and(|e| {
        e.server_auth || e.other.iter().any(|o| *o == OID_EKU_SERVER_AUTH)
    })
}

fn eku<'a>(
    cert: &'a X509Certificate<'_>,
) -> Option<&'a x509_parser::extensions::ExtendedKeyUsage<'a>> {
    cert.extensions().iter().find_map(|ext| match ext.parsed_extension() {
        ParsedExtension::ExtendedKeyUsage(e) => Some(e),
        _ => None,
    })
}

/// SHA-256 of the raw SubjectPublicKeyInfo.
pub fn spki_hash(cert: &X509Certificate<'_>) -> [u8; 32] {
    Sha256::digest(cert.tbs_certificate.subject_pki.raw).into()
}

/// Checks that `cert` names `issuer` as its issuer and that `issuer`'s key
/// verifies its signature.
pub fn verify_issued_by(
    cert: &X509Certificate<'_>,
    issuer: &X509Certificate<'_>,
) -> Result<(), X509Error> {
    if cert.issuer().as_raw() != issuer.subject().as_raw() {
        return Err(X509Error::BadSignature);
    }
    cert.verify_signature(Some(issuer.public_key()))
        .map_err(|_| X509Error::BadSignature)
}

// --- DER TLV plumbing -----------------------------------------------------

const TAG_SEQUENCE: u8 = 0x30;
const TAG_OID: u8 = 0x06;
const TAG_CONTEXT_3: u8 = 0xa3;

/// One TLV element: its tag and the spans of header and content within the
/// parent buffer.
#[derive(Debug, Clone, Copy)]
struct Tlv {
    tag: u8,
    /// Offset of the tag byte.
    start: usize,
    /// Offset of the first content byte.
    content: usize,
    /// Offset one past the last content byte.
    end: usize,
}

fn read_tlv(data: &[u8], at: usize) -> Result<Tlv, X509Error> {
    let err = X509Error::Der("truncated TLV");
    let tag = *data.get(at).ok_or(err)?;
    let first = *data.get(at + 1).ok_or(X509Error::Der("truncated length"))?;
    let (len, content) = if first < 0x80 {
        (first as usize, at + 2)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 {
            return Err(X509Error::Der("unsupported length form"));
        }
        let bytes = data
            .get(at + 2..at + 2 + n)
            .ok_or(X509Error::Der("truncated length"))?;
        let mut len = 0usize;
        for &b in bytes {
            len = (len << 8) | b as usize;
        }
        (len, at + 2 + n)
    };
    let end = content + len;
    if end > data.len() {
        return Err(X509Error::Der("TLV overruns buffer"));
    }
    Ok(Tlv {
        tag,
        start: at,
        content,
        end,
    })
}

fn tlv_children(data: &[u8], outer: Tlv) -> Result<Vec<Tlv>, X509Error> {
    let mut out = Vec::new();
    let mut at = outer.content;
    while at < outer.end {
        let child = read_tlv(data, at)?;
        at = child.end;
        out.push(child);
    }
    Ok(out)
}

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

fn write_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    write_len(out, content.len());
    out.extend_from_slice(content);
}

/// Whether an Extension TLV's OID equals `oid`'s DER encoding.
fn extension_oid_is(data: &[u8], ext: Tlv, oid: &Oid<'_>) -> Result<bool, X509Error> {
    let inner = read_tlv(data, ext.content)?;
    if inner.tag != TAG_OID {
        return Err(X509Error::Der("extension missing OID"));
    }
    Ok(&data[inner.content..inner.end] == oid.as_bytes())
}

/// Extracts the full Extension TLV for `oid` from a certificate's raw TBS,
/// if present.
fn find_extension_tlv(tbs: &[u8], oid: &Oid<'_>) -> Result<Option<Vec<u8>>, X509Error> {
    let fields = TbsFields::split(tbs)?;
    let Some(exts) = fields.extensions else {
        return Ok(None);
    };
    let ext_seq = read_tlv(tbs, exts.content)?;
    for ext in tlv_children(tbs, ext_seq)? {
        if extension_oid_is(tbs, ext, oid)? {
            return Ok(Some(tbs[ext.start..ext.end].to_vec()));
        }
    }
    Ok(None)
}

/// The positional TLV fields of a TBSCertificate.
struct TbsFields {
    /// Everything before the issuer field, verbatim.
    before_issuer: std::ops::Range<usize>,
    issuer: Tlv,
    /// Between issuer and extensions (or end).
    after_issuer: std::ops::Range<usize>,
    /// The `[3]` explicit extensions element.
    extensions: Option<Tlv>,
}

impl TbsFields {
    fn split(tbs: &[u8]) -> Result<Self, X509Error> {
        let outer = read_tlv(tbs, 0)?;
        if outer.tag != TAG_SEQUENCE {
            return Err(X509Error::Der("TBS is not a SEQUENCE"));
        }
        let children = tlv_children(tbs, outer)?;
        // version [0] is optional; issuer is the third field after it.
        let has_version = children.first().map(|c| c.tag) == Some(0xa0);
        let issuer_at = if has_version { 3 } else { 2 };
        let issuer = *children
            .get(issuer_at)
            .ok_or(X509Error::Der("TBS too short"))?;
        if issuer.tag != TAG_SEQUENCE {
            return Err(X509Error::Der("issuer is not a SEQUENCE"));
        }
        let extensions = children
            .iter()
            .rev()
            .find(|c| c.tag == TAG_CONTEXT_3)
            .copied();
        let after_end = extensions.map(|e| e.start).unwrap_or(outer.end);
        Ok(Self {
            before_issuer: outer.content..issuer.start,
            issuer,
            after_issuer: issuer.end..after_end,
            extensions,
        })
    }
}

/// Builds the TBS a precert commits to, per RFC 6962 §3.2: the submitted
/// precert's TBS with the poison extension removed and, when the precert
/// was signed by a dedicated pre-issuer, the issuer name and AKI replaced
/// by the pre-issuer's own issuer data.
///
/// `pre_issuer_tbs` must be the raw TBS of the pre-issuer certificate, or
/// None when the precert was signed by the real CA directly.
pub fn build_precert_tbs(
    tbs: &[u8],
    pre_issuer_tbs: Option<&[u8]>,
) -> Result<Vec<u8>, X509Error> {
    let fields = TbsFields::split(tbs)?;

    // Issuer: taken from the pre-issuer's issuer field when present.
    let issuer_bytes: Vec<u8> = match pre_issuer_tbs {
        Some(pi) => {
            let pi_fields = TbsFields::split(pi)?;
            pi[pi_fields.issuer.start..pi_fields.issuer.end].to_vec()
        }
        None => tbs[fields.issuer.start..fields.issuer.end].to_vec(),
    };

    // Extensions: drop the poison; with a pre-issuer, swap the AKI for the
    // pre-issuer's (or drop ours if it has none).
    let replacement_aki = match pre_issuer_tbs {
        Some(pi) => find_extension_tlv(pi, &OID_AUTHORITY_KEY_ID)?,
        None => None,
    };

    let mut ext_content = Vec::new();
    let mut saw_aki = false;
    if let Some(exts) = fields.extensions {
        let ext_seq = read_tlv(tbs, exts.content)?;
        if ext_seq.tag != TAG_SEQUENCE {
            return Err(X509Error::Der("extensions is not a SEQUENCE"));
        }
        for ext in tlv_children(tbs, ext_seq)? {
            if extension_oid_is(tbs, ext, &OID_CT_POISON)? {
                continue;
            }
            if pre_issuer_tbs.is_some() && extension_oid_is(tbs, ext, &OID_AUTHORITY_KEY_ID)? {
                saw_aki = true;
                if let Some(aki) = &replacement_aki {
                    ext_content.extend_from_slice(aki);
                }
                continue;
            }
            ext_content.extend_from_slice(&tbs[ext.start..ext.end]);
        }
    }
    if !saw_aki {
        if let Some(aki) = &replacement_aki {
            ext_content.extend_from_slice(aki);
        }
    }

    // Reassemble the TBS.
    let mut content = Vec::with_capacity(tbs.len());
    content.extend_from_slice(&tbs[fields.before_issuer.clone()]);
    content.extend_from_slice(&issuer_bytes);
    content.extend_from_slice(&tbs[fields.after_issuer.clone()]);
    if !ext_content.is_empty() {
        let mut ext_seq = Vec::with_capacity(ext_content.len() + 4);
        write_tlv(&mut ext_seq, TAG_SEQUENCE, &ext_content);
        let mut explicit = Vec::with_capacity(ext_seq.len() + 4);
        write_tlv(&mut explicit, TAG_CONTEXT_3, &ext_seq);
        content.extend_from_slice(&explicit);
    }

    let mut out = Vec::with_capacity(content.len() + 4);
    write_tlv(&mut out, TAG_SEQUENCE, &content);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlv_round_trip_lengths() {
        for len in [0usize, 1, 127, 128, 255, 256, 65_535, 70_000] {
            let mut out = Vec::new();
            write_tlv(&mut out, TAG_SEQUENCE, &vec![0xaa; len]);
            let tlv = read_tlv(&out, 0).unwrap();
            assert_eq!(tlv.tag, TAG_SEQUENCE);
            assert_eq!(tlv.end - tlv.content, len);
            assert_eq!(tlv.end, out.len());
        }
    }

    #[test]
    fn read_tlv_rejects_overruns() {
        assert!(read_tlv(&[0x30], 0).is_err());
        assert!(read_tlv(&[0x30, 0x05, 0x00], 0).is_err());
        assert!(read_tlv(&[0x30, 0x85, 1, 1, 1, 1, 1], 0).is_err());
    }
}
