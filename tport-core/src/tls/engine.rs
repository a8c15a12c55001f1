use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{AlertDescription, ClientConfig, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};
use crate::name::Direction;
use crate::tls::config::TlsConfig;
use crate::tls::verify::{PeerIdentity, PeerVerifier, PolicyClientVerifier, PolicyServerVerifier, VerifyError};

/// Connection-establishment states of a TLS secondary.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum TlsState {
    /// Client side, transport connect in progress.
    Connecting,
    /// Server side, connection accepted.
    Accepting,
    SslConnecting,
    Established,
    HandshakeFailed,
    CertRejected,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TlsEvent {
    /// Transport is up and the first handshake flight is under way.
    Started,
    Completed,
    Failed,
    Rejected,
}

impl TlsState {
    pub fn initial(direction: Direction) -> Self {
        match direction {
            Direction::Incoming => TlsState::Accepting,
            Direction::Outgoing => TlsState::Connecting,
        }
    }
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TlsState::Established | TlsState::HandshakeFailed | TlsState::CertRejected
        )
    }
    /// Applies an event. Terminal states absorb every event.
    pub fn on(self, event: TlsEvent) -> TlsState {
        use TlsState::*;
        match (self, event) {
            (s, _) if s.is_terminal() => s,
            (_, TlsEvent::Failed) => HandshakeFailed,
            (_, TlsEvent::Rejected) => CertRejected,
            (Connecting | Accepting, TlsEvent::Started) => SslConnecting,
            (SslConnecting, TlsEvent::Completed) => Established,
            (s, _) => s,
        }
    }
}

struct Progress<'a> {
    state: TlsState,
    observer: &'a mut (dyn FnMut(TlsState) + Send),
}

impl<'a> Progress<'a> {
    fn new(direction: Direction, observer: &'a mut (dyn FnMut(TlsState) + Send)) -> Self {
        let state = TlsState::initial(direction);
        observer(state);
        Self { state, observer }
    }
    fn step(&mut self, event: TlsEvent) {
        let next = self.state.on(event);
        if next != self.state {
            self.state = next;
            (self.observer)(next);
        }
    }
    fn handshake_error(&mut self, e: io::Error) -> Error {
        let e = classify(e);
        match e {
            Error::CertRejected(_) => self.step(TlsEvent::Rejected),
            _ => self.step(TlsEvent::Failed),
        }
        e
    }
    fn rejected(&mut self, e: VerifyError) -> Error {
        self.step(TlsEvent::Rejected);
        Error::CertRejected(e.to_string())
    }
    fn timed_out(&mut self) -> Error {
        self.step(TlsEvent::Failed);
        Error::TimedOut("tls handshake")
    }
}

fn is_certificate_alert(alert: &AlertDescription) -> bool {
    matches!(
        alert,
        AlertDescription::BadCertificate
            | AlertDescription::UnsupportedCertificate
            | AlertDescription::CertificateRevoked
            | AlertDescription::CertificateExpired
            | AlertDescription::CertificateUnknown
            | AlertDescription::UnknownCA
            | AlertDescription::CertificateRequired
            | AlertDescription::AccessDenied
    )
}

/// Sorts handshake failures into certificate rejections and everything else.
pub fn classify(e: io::Error) -> Error {
    if let Some(tls) = e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        return match tls {
            rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
                Error::CertRejected(tls.to_string())
            }
            rustls::Error::AlertReceived(alert) if is_certificate_alert(alert) => {
                Error::CertRejected(tls.to_string())
            }
            _ => Error::Handshake(tls.to_string()),
        };
    }
    match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Handshake("peer closed during handshake".into()),
        _ => Error::Handshake(e.to_string()),
    }
}

/// Per-primary TLS context: rustls configurations sharing one verifier.
pub struct TlsEngine {
    acceptor: Option<TlsAcceptor>,
    connector: TlsConnector,
    verifier: Arc<PeerVerifier>,
    handshake_timeout: Duration,
}

impl TlsEngine {
    pub fn new(config: &TlsConfig) -> Result<Self> {
        config.check()?;
        let material = config.load()?;
        let provider = config.provider()?;
        let verifier = Arc::new(PeerVerifier::new(
            config.policy,
            config.verify_depth,
            config.verify_date,
            config.subjects.clone(),
            &material.roots,
            provider.clone(),
        )?);
        let versions = config.versions.rustls();
        let config_error = |e: rustls::Error| Error::Config(e.to_string());

        let client = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)
            .map_err(config_error)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PolicyServerVerifier {
                inner: verifier.clone(),
            }));
        let client = match &material.identity {
            Some((certs, key)) => client
                .with_client_auth_cert(certs.clone(), key.clone_key())
                .map_err(config_error)?,
            None => client.with_no_client_auth(),
        };
        let acceptor = match material.identity {
            Some((certs, key)) => {
                let server = ServerConfig::builder_with_provider(provider)
                    .with_protocol_versions(versions)
                    .map_err(config_error)?
                    .with_client_cert_verifier(Arc::new(PolicyClientVerifier {
                        inner: verifier.clone(),
                    }))
                    .with_single_cert(certs, key)
                    .map_err(config_error)?;
                Some(TlsAcceptor::from(Arc::new(server)))
            }
            None => None,
        };
        Ok(Self {
            acceptor,
            connector: TlsConnector::from(Arc::new(client)),
            verifier,
            handshake_timeout: config.handshake_timeout,
        })
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }
    /// Whether this engine holds a certificate and can act as a server.
    pub fn can_accept(&self) -> bool {
        self.acceptor.is_some()
    }

    fn identity(
        &self,
        direction: Direction,
        certs: Option<&[CertificateDer<'static>]>,
        expected: Option<&str>,
    ) -> Result<PeerIdentity, VerifyError> {
        let (end_entity, intermediates) = match certs {
            Some([end_entity, rest @ ..]) => (Some(end_entity), rest),
            _ => (None, &[][..]),
        };
        self.verifier
            .evaluate(direction, end_entity, intermediates, expected, UnixTime::now())
    }

    /// Runs the server side of the handshake on an accepted connection.
    pub async fn accept<IO>(
        &self,
        io: IO,
        observer: &mut (dyn FnMut(TlsState) + Send),
    ) -> Result<(server::TlsStream<IO>, PeerIdentity)>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut progress = Progress::new(Direction::Incoming, observer);
        let Some(acceptor) = &self.acceptor else {
            progress.step(TlsEvent::Failed);
            return Err(Error::Config("tls server needs a certificate".into()));
        };
        progress.step(TlsEvent::Started);
        let stream = match tokio::time::timeout(self.handshake_timeout, acceptor.accept(io)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(progress.handshake_error(e)),
            Err(_) => return Err(progress.timed_out()),
        };
        let identity = self
            .identity(Direction::Incoming, stream.get_ref().1.peer_certificates(), None)
            .map_err(|e| progress.rejected(e))?;
        progress.step(TlsEvent::Completed);
        Ok((stream, identity))
    }

    /// Runs the client side of the handshake on a connected transport.
    /// `server_name` is the name the connection was requested for.
    pub async fn connect<IO>(
        &self,
        io: IO,
        server_name: &str,
        observer: &mut (dyn FnMut(TlsState) + Send),
    ) -> Result<(client::TlsStream<IO>, PeerIdentity)>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut progress = Progress::new(Direction::Outgoing, observer);
        let name = match ServerName::try_from(server_name) {
            Ok(name) => name.to_owned(),
            Err(_) => {
                progress.step(TlsEvent::Failed);
                return Err(Error::InvalidName(server_name.to_string()));
            }
        };
        progress.step(TlsEvent::Started);
        let handshake = self.connector.connect(name, io);
        let stream = match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(progress.handshake_error(e)),
            Err(_) => return Err(progress.timed_out()),
        };
        let identity = self
            .identity(
                Direction::Outgoing,
                stream.get_ref().1.peer_certificates(),
                Some(server_name),
            )
            .map_err(|e| progress.rejected(e))?;
        progress.step(TlsEvent::Completed);
        Ok((stream, identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::tls::config::VerifyPolicy;
    use crate::tls::verify::tests::{self_signed, TestCert};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn server_engine(cert: &TestCert, policy: VerifyPolicy) -> TlsEngine {
        let config = TlsConfig::default()
            .set_identity(vec![cert.der.clone()], cert.key.clone_key())
            .set_policy(policy);
        TlsEngine::new(&config).unwrap()
    }

    fn client_engine(root: &TestCert, policy: VerifyPolicy, verify_date: bool) -> TlsEngine {
        let config = TlsConfig::default()
            .add_root(root.der.clone())
            .set_policy(policy)
            .set_verify_date(verify_date);
        TlsEngine::new(&config).unwrap()
    }

    async fn handshake(
        server: &TlsEngine,
        client: &TlsEngine,
        name: &str,
    ) -> (Result<PeerIdentity>, Result<PeerIdentity>, Vec<TlsState>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client_states = Vec::new();
        let mut server_observer = |_s: TlsState| {};
        let mut client_observer = |s: TlsState| client_states.push(s);
        let (server_rs, client_rs) = tokio::join!(
            server.accept(a, &mut server_observer),
            client.connect(b, name, &mut client_observer)
        );
        (
            server_rs.map(|(_, id)| id),
            client_rs.map(|(_, id)| id),
            client_states,
        )
    }

    #[test]
    fn state_transitions() {
        let s = TlsState::initial(Direction::Outgoing);
        assert_eq!(s, TlsState::Connecting);
        let s = s.on(TlsEvent::Completed);
        assert_eq!(s, TlsState::Connecting);
        let s = s.on(TlsEvent::Started).on(TlsEvent::Completed);
        assert_eq!(s, TlsState::Established);
        assert_eq!(s.on(TlsEvent::Rejected), TlsState::Established);
        let s = TlsState::initial(Direction::Incoming).on(TlsEvent::Started).on(TlsEvent::Rejected);
        assert_eq!(s, TlsState::CertRejected);
        assert_eq!(s.on(TlsEvent::Started), TlsState::CertRejected);
    }

    #[tokio::test]
    async fn verified_handshake_carries_subjects() {
        let cert = self_signed(&["peer.example.org"], false);
        let server = server_engine(&cert, VerifyPolicy::NONE);
        let client = client_engine(&cert, VerifyPolicy::OUTGOING, true);
        let (server_rs, client_rs, states) = handshake(&server, &client, "peer.example.org").await;
        let identity = client_rs.unwrap();
        assert!(identity.verified);
        assert_eq!(identity.subjects, vec!["peer.example.org"]);
        assert_eq!(server_rs.unwrap(), PeerIdentity::default());
        assert_eq!(
            states,
            vec![TlsState::Connecting, TlsState::SslConnecting, TlsState::Established]
        );
    }

    #[tokio::test]
    async fn subject_mismatch_rejected_only_under_subject_policy() {
        let cert = self_signed(&["peer.example.org"], false);
        let server = server_engine(&cert, VerifyPolicy::NONE);

        let strict = client_engine(&cert, VerifyPolicy::SUBJECTS_OUT, true);
        let (_, client_rs, states) = handshake(&server, &strict, "other.example.org").await;
        assert_eq!(client_rs.unwrap_err().code(), ErrorCode::CertRejected);
        assert_eq!(states.last(), Some(&TlsState::CertRejected));

        let relaxed = client_engine(&cert, VerifyPolicy::OUTGOING, true);
        let (_, client_rs, _) = handshake(&server, &relaxed, "other.example.org").await;
        assert!(client_rs.unwrap().verified);
    }

    #[tokio::test]
    async fn expired_certificate_and_date_toggle() {
        let cert = self_signed(&["peer.example.org"], true);
        let server = server_engine(&cert, VerifyPolicy::NONE);

        let strict = client_engine(&cert, VerifyPolicy::OUTGOING, true);
        let (_, client_rs, _) = handshake(&server, &strict, "peer.example.org").await;
        assert_eq!(client_rs.unwrap_err().code(), ErrorCode::CertRejected);

        let lenient = client_engine(&cert, VerifyPolicy::OUTGOING, false);
        let (_, client_rs, _) = handshake(&server, &lenient, "peer.example.org").await;
        assert!(client_rs.is_ok());
    }

    #[tokio::test]
    async fn missing_client_certificate_rejected_by_server() {
        let cert = self_signed(&["peer.example.org"], false);
        let config = TlsConfig::default()
            .set_identity(vec![cert.der.clone()], cert.key.clone_key())
            .add_root(cert.der.clone())
            .set_policy(VerifyPolicy::INCOMING);
        let server = TlsEngine::new(&config).unwrap();
        let client = client_engine(&cert, VerifyPolicy::NONE, true);
        let (server_rs, _, _) = handshake(&server, &client, "peer.example.org").await;
        assert_eq!(server_rs.unwrap_err().code(), ErrorCode::CertRejected);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let cert = self_signed(&["peer.example.org"], false);
        let config = TlsConfig::default()
            .set_identity(vec![cert.der.clone()], cert.key.clone_key())
            .set_handshake_timeout(Duration::from_millis(100));
        let server = TlsEngine::new(&config).unwrap();
        let (a, _b) = tokio::io::duplex(1024);
        let mut states = Vec::new();
        let mut observer = |s: TlsState| states.push(s);
        let err = server.accept(a, &mut observer).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert_eq!(states.last(), Some(&TlsState::HandshakeFailed));
    }

    #[tokio::test]
    async fn application_data_after_handshake() {
        let cert = self_signed(&["peer.example.org"], false);
        let server = server_engine(&cert, VerifyPolicy::NONE);
        let client = client_engine(&cert, VerifyPolicy::OUTGOING, true);
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut noop1 = |_s: TlsState| {};
        let mut noop2 = |_s: TlsState| {};
        let (server_rs, client_rs) = tokio::join!(
            server.accept(a, &mut noop1),
            client.connect(b, "peer.example.org", &mut noop2)
        );
        let (mut server_stream, _) = server_rs.unwrap();
        let (mut client_stream, _) = client_rs.unwrap();
        client_stream.write_all(b"OPTIONS").await.unwrap();
        client_stream.flush().await.unwrap();
        let mut buf = [0u8; 7];
        server_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OPTIONS");
    }
}
