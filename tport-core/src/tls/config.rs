use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::SupportedProtocolVersion;

use crate::error::{Error, Result};
use crate::name::Direction;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_VERIFY_DEPTH: usize = 2;

/// Peer verification policy. The values combine with `|`; the subject
/// bits imply verification in the same direction.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct VerifyPolicy(u32);

impl VerifyPolicy {
    pub const NONE: VerifyPolicy = VerifyPolicy(0x0);
    pub const INCOMING: VerifyPolicy = VerifyPolicy(0x1);
    pub const OUTGOING: VerifyPolicy = VerifyPolicy(0x2);
    pub const ALL: VerifyPolicy = VerifyPolicy(0x3);
    pub const SUBJECTS_IN: VerifyPolicy = VerifyPolicy(0x5);
    pub const SUBJECTS_OUT: VerifyPolicy = VerifyPolicy(0x6);
    pub const SUBJECTS_ALL: VerifyPolicy = VerifyPolicy(0xf);

    pub const fn bits(&self) -> u32 {
        self.0
    }
    pub const fn from_bits(bits: u32) -> Self {
        VerifyPolicy(bits & 0xf)
    }
    pub const fn contains(&self, other: VerifyPolicy) -> bool {
        self.0 & other.0 == other.0
    }
    /// Whether a peer arriving in `direction` must present a verifiable certificate.
    pub fn requires_verification(&self, direction: Direction) -> bool {
        match direction {
            Direction::Incoming => self.contains(Self::INCOMING),
            Direction::Outgoing => self.contains(Self::OUTGOING),
        }
    }
    pub fn matches_subjects(&self, direction: Direction) -> bool {
        match direction {
            Direction::Incoming => self.contains(Self::SUBJECTS_IN),
            Direction::Outgoing => self.contains(Self::SUBJECTS_OUT),
        }
    }
}

impl BitOr for VerifyPolicy {
    type Output = VerifyPolicy;

    fn bitor(self, rhs: Self) -> Self::Output {
        VerifyPolicy(self.0 | rhs.0)
    }
}

impl fmt::Debug for VerifyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerifyPolicy({:#x})", self.0)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum ProtocolVersions {
    Tls12,
    Tls13,
    #[default]
    Tls12AndLater,
}

impl ProtocolVersions {
    pub(crate) fn rustls(&self) -> &'static [&'static SupportedProtocolVersion] {
        static TLS12: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
        static TLS13: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
        static BOTH: &[&SupportedProtocolVersion] =
            &[&rustls::version::TLS13, &rustls::version::TLS12];
        match self {
            ProtocolVersions::Tls12 => TLS12,
            ProtocolVersions::Tls13 => TLS13,
            ProtocolVersions::Tls12AndLater => BOTH,
        }
    }
}

/// Certificates, keys and verification policy for a TLS-capable primary.
pub struct TlsConfig {
    pub cert_file: Option<PathBuf>,
    /// Defaults to `cert_file`, which may hold both the chain and the key.
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub certs: Vec<CertificateDer<'static>>,
    pub key: Option<PrivateKeyDer<'static>>,
    pub roots: Vec<CertificateDer<'static>>,
    pub ciphers: Vec<String>,
    pub versions: ProtocolVersions,
    pub handshake_timeout: Duration,
    pub policy: VerifyPolicy,
    pub verify_depth: usize,
    pub verify_date: bool,
    pub subjects: Vec<String>,
}

impl Clone for TlsConfig {
    fn clone(&self) -> Self {
        Self {
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
            ca_file: self.ca_file.clone(),
            certs: self.certs.clone(),
            key: self.key.as_ref().map(|k| k.clone_key()),
            roots: self.roots.clone(),
            ciphers: self.ciphers.clone(),
            versions: self.versions,
            handshake_timeout: self.handshake_timeout,
            policy: self.policy,
            verify_depth: self.verify_depth,
            verify_date: self.verify_date,
            subjects: self.subjects.clone(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_file: None,
            key_file: None,
            ca_file: None,
            certs: Vec::new(),
            key: None,
            roots: Vec::new(),
            ciphers: Vec::new(),
            versions: ProtocolVersions::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            policy: VerifyPolicy::NONE,
            verify_depth: DEFAULT_VERIFY_DEPTH,
            verify_date: true,
            subjects: Vec::new(),
        }
    }
}

impl TlsConfig {
    pub fn set_cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(path.into());
        self
    }
    pub fn set_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_file = Some(path.into());
        self
    }
    pub fn set_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }
    pub fn set_identity(
        mut self,
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        self.certs = certs;
        self.key = Some(key);
        self
    }
    pub fn add_root(mut self, root: CertificateDer<'static>) -> Self {
        self.roots.push(root);
        self
    }
    pub fn set_ciphers(mut self, ciphers: Vec<String>) -> Self {
        self.ciphers = ciphers;
        self
    }
    pub fn set_versions(mut self, versions: ProtocolVersions) -> Self {
        self.versions = versions;
        self
    }
    pub fn set_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
    pub fn set_policy(mut self, policy: VerifyPolicy) -> Self {
        self.policy = policy;
        self
    }
    pub fn set_verify_depth(mut self, depth: usize) -> Self {
        self.verify_depth = depth;
        self
    }
    pub fn set_verify_date(mut self, verify_date: bool) -> Self {
        self.verify_date = verify_date;
        self
    }
    pub fn set_subjects(mut self, subjects: Vec<String>) -> Self {
        self.subjects = subjects;
        self
    }
    pub fn check(&self) -> Result<()> {
        if self.handshake_timeout.is_zero() {
            return Err(Error::Config("handshake_timeout cannot be 0".into()));
        }
        if self.verify_depth == 0 {
            return Err(Error::Config("verify_depth cannot be 0".into()));
        }
        if self.key_file.is_some() && self.cert_file.is_none() {
            return Err(Error::Config("key_file given without cert_file".into()));
        }
        if self.policy.matches_subjects(Direction::Incoming) && self.subjects.is_empty() {
            return Err(Error::Config(
                "incoming subject matching needs a subject allow-list".into(),
            ));
        }
        Ok(())
    }

    /// Resolves files into in-memory material.
    pub(crate) fn load(&self) -> Result<TlsMaterial> {
        let mut certs = self.certs.clone();
        let mut key = self.key.as_ref().map(|k| k.clone_key());
        if let Some(cert_file) = &self.cert_file {
            certs = load_certs(cert_file)?;
            let key_file = self.key_file.as_deref().unwrap_or(cert_file);
            key = Some(load_key(key_file)?);
        }
        let mut roots = self.roots.clone();
        if let Some(ca_file) = &self.ca_file {
            roots.extend(load_certs(ca_file)?);
        }
        Ok(TlsMaterial {
            identity: key.map(|key| (certs, key)),
            roots,
        })
    }

    pub(crate) fn provider(&self) -> Result<Arc<CryptoProvider>> {
        let mut provider = rustls::crypto::ring::default_provider();
        if !self.ciphers.is_empty() {
            provider.cipher_suites.retain(|suite| {
                let name = format!("{:?}", suite.suite());
                self.ciphers.iter().any(|c| c.eq_ignore_ascii_case(&name))
            });
            if provider.cipher_suites.is_empty() {
                return Err(Error::Config(format!(
                    "no supported cipher in {:?}",
                    self.ciphers
                )));
            }
        }
        Ok(Arc::new(provider))
    }
}

pub(crate) struct TlsMaterial {
    pub identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    pub roots: Vec<CertificateDer<'static>>,
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    Ok(BufReader::new(file))
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "{}: no certificate found",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
        .ok_or_else(|| Error::Config(format!("{}: no private key found", path.display())))
}
