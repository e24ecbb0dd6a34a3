//! Submission chain validation against the accepted-roots pool.
//!
//! The submitted chain must lead, certificate by certificate, to one of
//! the configured roots. The leaf's notAfter has to fall inside the log's
//! acceptance window; EKU policy on the leaf is a config toggle.

use thiserror::Error;
use time::OffsetDateTime;

use crate::x509util::{self, X509Error};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain is empty")]
    Empty,
    #[error("certificate {index}: {source}")]
    Certificate {
        index: usize,
        #[source]
        source: X509Error,
    },
    #[error("certificate {0} not issued by its predecessor")]
    BrokenLink(usize),
    #[error("chain does not end at an accepted root")]
    UntrustedRoot,
    #[error("leaf notAfter {0} outside the acceptance window")]
    NotAfterOutOfWindow(i64),
    #[error("leaf is missing the serverAuth EKU")]
    MissingServerAuthEku,
}

/// The accepted-roots pool, owned DER.
pub struct RootPool {
    roots: Vec<Vec<u8>>,
}

impl RootPool {
    pub fn new(roots: Vec<Vec<u8>>) -> Result<Self, ChainError> {
        for (index, der) in roots.iter().enumerate() {
            x509util::parse(der).map_err(|source| ChainError::Certificate { index, source })?;
        }
        Ok(Self { roots })
    }

    pub fn raw_roots(&self) -> &[Vec<u8>] {
        &self.roots
    }

    fn contains(&self, der: &[u8]) -> bool {
        self.roots.iter().any(|r| r == der)
    }

    /// A pool root whose subject matches `issuer_raw` and whose key
    /// verifies `cert`.
    fn find_issuer(&self, cert_der: &[u8]) -> Option<&Vec<u8>> {
        let cert = x509util::parse(cert_der).ok()?;
        self.roots.iter().find(|root_der| {
            x509util::parse(root_der)
                .map(|root| x509util::verify_issued_by(&cert, &root).is_ok())
                .unwrap_or(false)
        })
    }
}

/// Log acceptance policy applied in stage 0.
#[derive(Debug, Clone)]
pub struct AcceptancePolicy {
    pub not_after_start: OffsetDateTime,
    pub not_after_limit: OffsetDateTime,
    pub require_server_auth_eku: bool,
}

/// Validates a submitted chain and returns the effective chain: the
/// submitted certificates, extended by the matching pool root when the
/// submission did not include it.
pub fn validate_chain(
    chain: &[Vec<u8>],
    pool: &RootPool,
    policy: &AcceptancePolicy,
) -> Result<Vec<Vec<u8>>, ChainError> {
    if chain.is_empty() {
        return Err(ChainError::Empty);
    }

    // Leaf policy checks.
    {
        let leaf = x509util::parse(&chain[0])
            .map_err(|source| ChainError::Certificate { index: 0, source })?;
        let not_after = leaf.validity().not_after.timestamp();
        if not_after < policy.not_after_start.unix_timestamp()
            || not_after >= policy.not_after_limit.unix_timestamp()
        {
            return Err(ChainError::NotAfterOutOfWindow(not_after));
        }
        if policy.require_server_auth_eku && !x509util::has_server_auth_eku(&leaf) {
            return Err(ChainError::MissingServerAuthEku);
        }
    }

    // Every certificate must be issued by its successor.
    for i in 0..chain.len() - 1 {
        let cert = x509util::parse(&chain[i])
            .map_err(|source| ChainError::Certificate { index: i, source })?;
        let issuer = x509util::parse(&chain[i + 1]).map_err(|source| ChainError::Certificate {
            index: i + 1,
            source,
        })?;
        x509util::verify_issued_by(&cert, &issuer).map_err(|_| ChainError::BrokenLink(i))?;
    }

    // The chain must terminate at a pool root, either because the last
    // certificate is one or because a pool root issued it.
    let last = chain.last().expect("non-empty");
    if pool.contains(last) {
        return Ok(chain.to_vec());
    }
    match pool.find_issuer(last) {
        Some(root) => {
            let mut full = chain.to_vec();
            full.push(root.clone());
            Ok(full)
        }
        None => Err(ChainError::UntrustedRoot),
    }
}
