//! Peer certificate verification.
//!
//! [`PeerVerifier::evaluate`] is a pure function of certificate chain,
//! policy, expected name and time. The rustls verifier adapters call it
//! during the handshake so a rejected peer gets a proper alert, and the
//! engine calls it again afterwards to obtain the peer's identity.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use thiserror::Error;
use x509_parser::extensions::GeneralName;

use crate::error::{Error as TportError, Result};
use crate::name::Direction;
use crate::tls::config::VerifyPolicy;

/// Identity established for a peer.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct PeerIdentity {
    /// The chain verified against the configured trust anchors.
    pub verified: bool,
    /// subjectAltName entries, or the common name when there are none.
    pub subjects: Vec<String>,
}

#[derive(Error, Clone, Eq, PartialEq, Debug)]
pub enum VerifyError {
    #[error("no peer certificate")]
    NoCertificate,
    #[error("malformed certificate: {0}")]
    BadCertificate(String),
    #[error("chain of {len} intermediates exceeds depth {depth}")]
    ChainTooLong { len: usize, depth: usize },
    #[error("certificate expired")]
    Expired,
    #[error("certificate not yet valid")]
    NotYetValid,
    #[error("untrusted certificate: {0}")]
    Untrusted(String),
    #[error("no certificate subject in {subjects:?} matches {wanted:?}")]
    SubjectMismatch {
        subjects: Vec<String>,
        wanted: Vec<String>,
    },
}

impl VerifyError {
    pub(crate) fn to_rustls(&self) -> rustls::Error {
        let cert_error = match self {
            VerifyError::NoCertificate => return rustls::Error::NoCertificatesPresented,
            VerifyError::BadCertificate(_) => CertificateError::BadEncoding,
            VerifyError::Expired => CertificateError::Expired,
            VerifyError::NotYetValid => CertificateError::NotValidYet,
            VerifyError::ChainTooLong { .. } | VerifyError::Untrusted(_) => {
                CertificateError::UnknownIssuer
            }
            VerifyError::SubjectMismatch { .. } => CertificateError::ApplicationVerificationFailure,
        };
        rustls::Error::InvalidCertificate(cert_error)
    }
}

/// Names and validity window pulled out of a DER certificate.
#[derive(Clone, Debug)]
pub struct CertInfo {
    pub subjects: Vec<String>,
    pub not_before: i64,
    pub not_after: i64,
}

impl CertInfo {
    pub fn parse(der: &CertificateDer<'_>) -> Result<CertInfo, VerifyError> {
        let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
            .map_err(|e| VerifyError::BadCertificate(e.to_string()))?;
        let mut subjects = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => subjects.push(dns.to_string()),
                    GeneralName::URI(uri) => subjects.push(uri.to_string()),
                    GeneralName::IPAddress(ip) => match ip.len() {
                        4 => {
                            let octets: [u8; 4] = [ip[0], ip[1], ip[2], ip[3]];
                            subjects.push(Ipv4Addr::from(octets).to_string())
                        }
                        16 => {
                            let mut octets = [0u8; 16];
                            octets.copy_from_slice(ip);
                            subjects.push(Ipv6Addr::from(octets).to_string())
                        }
                        _ => {}
                    },
                    _ => {}
                }
            }
        }
        if subjects.is_empty() {
            for cn in cert.subject().iter_common_name() {
                if let Ok(cn) = cn.as_str() {
                    subjects.push(cn.to_string());
                }
            }
        }
        let validity = cert.validity();
        Ok(CertInfo {
            subjects,
            not_before: validity.not_before.timestamp(),
            not_after: validity.not_after.timestamp(),
        })
    }

    fn date_error(&self, now: UnixTime) -> Option<VerifyError> {
        let now = now.as_secs() as i64;
        if now < self.not_before {
            Some(VerifyError::NotYetValid)
        } else if now > self.not_after {
            Some(VerifyError::Expired)
        } else {
            None
        }
    }

    /// A time inside the validity window, used to check the chain while
    /// ignoring dates.
    fn midpoint(&self) -> UnixTime {
        let mid = self.not_before + (self.not_after - self.not_before) / 2;
        UnixTime::since_unix_epoch(Duration::from_secs(mid.max(0) as u64))
    }
}

fn normalize(name: &str) -> &str {
    let name = name
        .strip_prefix("sips:")
        .or_else(|| name.strip_prefix("sip:"))
        .unwrap_or(name);
    name.trim_end_matches('.')
}

/// Matches a certificate subject against a wanted name. `*.example.org`
/// in the certificate covers exactly one extra label.
pub fn subject_matches(subject: &str, wanted: &str) -> bool {
    let subject = normalize(subject);
    let wanted = normalize(wanted);
    if subject.eq_ignore_ascii_case(wanted) {
        return true;
    }
    if let Some(suffix) = subject.strip_prefix('*') {
        if suffix.starts_with('.') && wanted.len() > suffix.len() {
            let (label, rest) = wanted.split_at(wanted.len() - suffix.len());
            return rest.eq_ignore_ascii_case(suffix) && !label.is_empty() && !label.contains('.');
        }
    }
    false
}

/// Applies a [`VerifyPolicy`] to certificate chains.
#[derive(Debug)]
pub struct PeerVerifier {
    policy: VerifyPolicy,
    depth: usize,
    verify_date: bool,
    allowed: Vec<String>,
    server_chain: Option<Arc<WebPkiServerVerifier>>,
    client_chain: Option<Arc<dyn ClientCertVerifier>>,
    hints: Vec<DistinguishedName>,
    provider: Arc<CryptoProvider>,
}

impl PeerVerifier {
    pub fn new(
        policy: VerifyPolicy,
        depth: usize,
        verify_date: bool,
        allowed: Vec<String>,
        roots: &[CertificateDer<'static>],
        provider: Arc<CryptoProvider>,
    ) -> Result<Self> {
        let mut store = RootCertStore::empty();
        for root in roots {
            store
                .add(root.clone())
                .map_err(|e| TportError::Config(format!("trust anchor: {e}")))?;
        }
        let hints = store.subjects();
        let (server_chain, client_chain) = if store.is_empty() {
            (None, None)
        } else {
            let store = Arc::new(store);
            let server = WebPkiServerVerifier::builder_with_provider(store.clone(), provider.clone())
                .build()
                .map_err(|e| TportError::Config(e.to_string()))?;
            let client = WebPkiClientVerifier::builder_with_provider(store, provider.clone())
                .allow_unauthenticated()
                .build()
                .map_err(|e| TportError::Config(e.to_string()))?;
            (Some(server), Some(client))
        };
        Ok(Self {
            policy,
            depth,
            verify_date,
            allowed,
            server_chain,
            client_chain,
            hints,
            provider,
        })
    }

    pub fn policy(&self) -> VerifyPolicy {
        self.policy
    }

    pub fn evaluate(
        &self,
        direction: Direction,
        end_entity: Option<&CertificateDer<'_>>,
        intermediates: &[CertificateDer<'_>],
        expected: Option<&str>,
        now: UnixTime,
    ) -> Result<PeerIdentity, VerifyError> {
        let required = self.policy.requires_verification(direction);
        let Some(end_entity) = end_entity else {
            if required {
                return Err(VerifyError::NoCertificate);
            }
            return Ok(PeerIdentity::default());
        };
        let info = CertInfo::parse(end_entity)?;
        let mut failure = None;
        if intermediates.len() > self.depth {
            failure = Some(VerifyError::ChainTooLong {
                len: intermediates.len(),
                depth: self.depth,
            });
        }
        let date_error = info.date_error(now);
        let at = match &date_error {
            Some(e) if self.verify_date => {
                failure.get_or_insert(e.clone());
                now
            }
            Some(_) => info.midpoint(),
            None => now,
        };
        if failure.is_none() {
            if let Err(e) = self.check_chain(direction, end_entity, intermediates, &info, at) {
                failure = Some(e);
            }
        }
        let verified = failure.is_none();
        if let Some(e) = failure {
            if required {
                return Err(e);
            }
            log::debug!("{direction:?} peer certificate not verified: {e}");
        }
        if self.policy.matches_subjects(direction) {
            let wanted: Vec<String> = match direction {
                Direction::Incoming => self.allowed.clone(),
                Direction::Outgoing => expected.map(str::to_string).into_iter().collect(),
            };
            let matched = info.subjects.iter().any(|subject| {
                wanted
                    .iter()
                    .any(|w| w == "*" || subject_matches(subject, w))
            });
            if !matched {
                return Err(VerifyError::SubjectMismatch {
                    subjects: info.subjects,
                    wanted,
                });
            }
        }
        Ok(PeerIdentity {
            verified,
            subjects: info.subjects,
        })
    }

    fn check_chain(
        &self,
        direction: Direction,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        info: &CertInfo,
        at: UnixTime,
    ) -> Result<(), VerifyError> {
        let result = match direction {
            Direction::Outgoing => {
                let Some(verifier) = &self.server_chain else {
                    return Err(VerifyError::Untrusted("no trust anchors".into()));
                };
                // Name checks are policy-driven, so validate the chain
                // against a name the certificate carries.
                let name = info
                    .subjects
                    .iter()
                    .filter(|s| !s.starts_with('*'))
                    .find_map(|s| ServerName::try_from(normalize(s)).ok())
                    .ok_or_else(|| VerifyError::Untrusted("certificate names no host".into()))?;
                match verifier.verify_server_cert(end_entity, intermediates, &name, &[], at) {
                    Err(rustls::Error::InvalidCertificate(e))
                        if e == CertificateError::NotValidForName =>
                    {
                        Ok(())
                    }
                    other => other.map(|_| ()),
                }
            }
            Direction::Incoming => {
                let Some(verifier) = &self.client_chain else {
                    return Err(VerifyError::Untrusted("no trust anchors".into()));
                };
                verifier
                    .verify_client_cert(end_entity, intermediates, at)
                    .map(|_| ())
            }
        };
        result.map_err(|e| match e {
            rustls::Error::InvalidCertificate(e) if e == CertificateError::Expired => {
                VerifyError::Expired
            }
            rustls::Error::InvalidCertificate(e) if e == CertificateError::NotValidYet => {
                VerifyError::NotYetValid
            }
            e => VerifyError::Untrusted(e.to_string()),
        })
    }

    fn supported_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client-side adapter: checks the server's certificate.
#[derive(Debug)]
pub(crate) struct PolicyServerVerifier {
    pub(crate) inner: Arc<PeerVerifier>,
}

impl ServerCertVerifier for PolicyServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let expected = server_name.to_str();
        self.inner
            .evaluate(
                Direction::Outgoing,
                Some(end_entity),
                intermediates,
                Some(&expected),
                now,
            )
            .map(|_| ServerCertVerified::assertion())
            .map_err(|e| {
                log::warn!("server certificate for {expected} rejected: {e}");
                e.to_rustls()
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.inner.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.inner.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_schemes()
    }
}

/// Server-side adapter: checks client certificates.
#[derive(Debug)]
pub(crate) struct PolicyClientVerifier {
    pub(crate) inner: Arc<PeerVerifier>,
}

impl ClientCertVerifier for PolicyClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.policy.requires_verification(Direction::Incoming)
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.inner.hints
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.inner
            .evaluate(Direction::Incoming, Some(end_entity), intermediates, None, now)
            .map(|_| ClientCertVerified::assertion())
            .map_err(|e| {
                log::warn!("client certificate rejected: {e}");
                e.to_rustls()
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.inner.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.inner.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_schemes()
    }
}
