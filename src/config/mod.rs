use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rust_tport_core::error::{Error, Result};
use rust_tport_core::framing::{InitFramer, DEFAULT_MAX_MESSAGE};
use rust_tport_core::name::TransportKind;
use rust_tport_core::socket::DEFAULT_BACKLOG;
use rust_tport_core::stun::StunClient;
use rust_tport_core::tls::TlsConfig;
use rust_tport_core::udp::{DatagramClassifier, DefaultClassifier, PoolConfig};

mod env;

pub use env::{level_filter, Diagnostics};

pub(crate) const DEFAULT_QUEUE_SIZE: usize = 64;
pub(crate) const INCOMPLETE_TIMEOUT: Duration = Duration::from_secs(32);
pub(crate) const DEFAULT_WS_PATH: &str = "/";
pub(crate) const DEFAULT_WS_SUBPROTOCOL: &str = "sip";
pub(crate) const DEFAULT_SCTP_MAX_MESSAGE: usize = 64 * 1024;

/// Master-wide transport parameters.
#[derive(Clone, Debug)]
pub struct TportConfig {
    /// Messages a secondary may have queued for sending.
    pub queue_size: usize,
    /// Close a secondary after this long without traffic.
    pub idle: Option<Duration>,
    /// Close a stream whose partial message is not completed in time.
    pub incomplete_timeout: Option<Duration>,
    /// Interval of CRLFCRLF (or WebSocket ping) keepalives.
    pub keepalive: Option<Duration>,
    /// Wait this long for a pong after a keepalive ping.
    pub pingpong: Option<Duration>,
    /// Answer a peer's CRLFCRLF ping with a CRLF pong.
    pub pong2ping: bool,
    /// Whether new secondaries may be reused for later connects.
    pub reuse: bool,
    pub max_message: usize,
    pub diagnostics: Diagnostics,
}

impl Default for TportConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            idle: None,
            incomplete_timeout: Some(INCOMPLETE_TIMEOUT),
            keepalive: None,
            pingpong: None,
            pong2ping: false,
            reuse: true,
            max_message: DEFAULT_MAX_MESSAGE,
            diagnostics: Diagnostics::default(),
        }
    }
}

impl TportConfig {
    pub fn set_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }
    pub fn set_idle(mut self, idle: Duration) -> Self {
        self.idle.replace(idle);
        self
    }
    pub fn set_incomplete_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.incomplete_timeout = timeout;
        self
    }
    pub fn set_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive.replace(keepalive);
        self
    }
    pub fn set_pingpong(mut self, pingpong: Duration) -> Self {
        self.pingpong.replace(pingpong);
        self
    }
    pub fn set_pong2ping(mut self, pong2ping: bool) -> Self {
        self.pong2ping = pong2ping;
        self
    }
    pub fn set_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }
    pub fn set_max_message(mut self, max_message: usize) -> Self {
        self.max_message = max_message;
        self
    }
    pub fn set_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }
    pub fn check(&self) -> Result<()> {
        if self.queue_size == 0 {
            return Err(Error::Config("queue_size cannot be 0".into()));
        }
        if self.max_message == 0 {
            return Err(Error::Config("max_message cannot be 0".into()));
        }
        for (name, value) in [
            ("idle", self.idle),
            ("incomplete_timeout", self.incomplete_timeout),
            ("keepalive", self.keepalive),
            ("pingpong", self.pingpong),
        ] {
            if value.is_some_and(|v| v.is_zero()) {
                return Err(Error::Config(format!("{name} cannot be 0")));
            }
        }
        if self.pingpong.is_some() && self.keepalive.is_none() {
            return Err(Error::Config("pingpong needs a keepalive interval".into()));
        }
        Ok(())
    }
}

/// Parameters of one primary.
#[derive(Clone)]
pub struct BindConfig {
    pub backlog: u32,
    pub tos: Option<u32>,
    pub tls: Option<TlsConfig>,
    /// HTTP proxy (`host:port`, optionally prefixed with `http://`) that
    /// turns a tcp primary into a `CONNECT` tunnel.
    pub proxy: Option<String>,
    /// Worker threads for a udp primary. `None` keeps udp on the event loop.
    pub pool: Option<PoolConfig>,
    pub drop_probability: f64,
    pub ident: Option<String>,
    pub stun: Option<Arc<dyn StunClient>>,
    /// Stream framing. `None` frames SIP, bounded by
    /// [`TportConfig::max_message`].
    pub framer: Option<Box<dyn InitFramer>>,
    /// Whether connections of this primary may carry later sends to the
    /// same peer. Needs [`TportConfig::reuse`] as well.
    pub reuse: bool,
    pub classifier: Arc<dyn DatagramClassifier>,
    pub ws_path: String,
    pub ws_subprotocol: Option<String>,
    pub sctp_max_message: usize,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            tos: None,
            tls: None,
            proxy: None,
            pool: None,
            drop_probability: 0.0,
            ident: None,
            stun: None,
            framer: None,
            reuse: true,
            classifier: Arc::new(DefaultClassifier),
            ws_path: DEFAULT_WS_PATH.to_string(),
            ws_subprotocol: Some(DEFAULT_WS_SUBPROTOCOL.to_string()),
            sctp_max_message: DEFAULT_SCTP_MAX_MESSAGE,
        }
    }
}

impl fmt::Debug for BindConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindConfig")
            .field("backlog", &self.backlog)
            .field("tos", &self.tos)
            .field("tls", &self.tls.is_some())
            .field("proxy", &self.proxy)
            .field("pool", &self.pool)
            .field("drop_probability", &self.drop_probability)
            .field("ident", &self.ident)
            .field("stun", &self.stun.is_some())
            .field("reuse", &self.reuse)
            .field("ws_path", &self.ws_path)
            .finish_non_exhaustive()
    }
}

impl BindConfig {
    pub fn set_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }
    pub fn set_tos(mut self, tos: u32) -> Self {
        self.tos.replace(tos);
        self
    }
    pub fn set_tls(mut self, tls: TlsConfig) -> Self {
        self.tls.replace(tls);
        self
    }
    pub fn set_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy.replace(proxy.into());
        self
    }
    pub fn set_pool(mut self, pool: PoolConfig) -> Self {
        self.pool.replace(pool);
        self
    }
    pub fn set_drop_probability(mut self, probability: f64) -> Self {
        self.drop_probability = probability;
        self
    }
    pub fn set_ident(mut self, ident: impl Into<String>) -> Self {
        self.ident.replace(ident.into());
        self
    }
    pub fn set_stun(mut self, stun: Arc<dyn StunClient>) -> Self {
        self.stun.replace(stun);
        self
    }
    pub fn set_framer(mut self, framer: Box<dyn InitFramer>) -> Self {
        self.framer.replace(framer);
        self
    }
    pub fn set_reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }
    pub fn set_classifier(mut self, classifier: Arc<dyn DatagramClassifier>) -> Self {
        self.classifier = classifier;
        self
    }
    pub fn set_ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }
    pub fn set_ws_subprotocol(mut self, subprotocol: Option<String>) -> Self {
        self.ws_subprotocol = subprotocol;
        self
    }
    pub fn set_sctp_max_message(mut self, max: usize) -> Self {
        self.sctp_max_message = max;
        self
    }

    /// Chooses the transport kind for a primary bound with protocol `proto`.
    pub fn kind_for(&self, proto: &str) -> Result<TransportKind> {
        let kind = match proto.to_ascii_lowercase().as_str() {
            "udp" if self.stun.is_some() => TransportKind::StunUdp,
            "udp" => TransportKind::Udp,
            "tcp" if self.proxy.is_some() => TransportKind::Connect,
            "tcp" => TransportKind::Tcp,
            "tls" => TransportKind::Tls,
            "sctp" => TransportKind::Sctp,
            "ws" => TransportKind::Ws,
            "wss" => TransportKind::Wss,
            other => return Err(Error::Config(format!("unknown transport protocol {other:?}"))),
        };
        Ok(kind)
    }

    pub fn check(&self, kind: TransportKind) -> Result<()> {
        if self.backlog == 0 {
            return Err(Error::Config("backlog cannot be 0".into()));
        }
        if !(0.0..=1.0).contains(&self.drop_probability) {
            return Err(Error::Config(format!(
                "drop probability {} outside 0..=1",
                self.drop_probability
            )));
        }
        if let Some(pool) = &self.pool {
            pool.check()?;
        }
        match kind {
            TransportKind::Tls | TransportKind::Wss => match &self.tls {
                Some(tls) => tls.check()?,
                None => return Err(Error::Config(format!("{kind} primary needs a tls config"))),
            },
            TransportKind::Connect => {
                self.proxy_authority()?;
            }
            TransportKind::Ws => {
                if !self.ws_path.starts_with('/') {
                    return Err(Error::Config(format!("ws path {:?} must start with /", self.ws_path)));
                }
            }
            TransportKind::Sctp => {
                if self.sctp_max_message == 0 {
                    return Err(Error::Config("sctp_max_message cannot be 0".into()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// The proxy as `host:port`.
    pub(crate) fn proxy_authority(&self) -> Result<String> {
        let proxy = self
            .proxy
            .as_deref()
            .ok_or_else(|| Error::Config("no proxy configured".into()))?;
        let authority = proxy
            .strip_prefix("http://")
            .unwrap_or(proxy)
            .trim_end_matches('/');
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(authority.to_string())
            }
            _ => Err(Error::Config(format!("proxy {proxy:?}, want [http://]host:port"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_tport_core::stun::{DatagramSink, StunCallback};
    use std::net::SocketAddr;

    struct NoStun;

    impl StunClient for NoStun {
        fn bind(&self, _: SocketAddr, _: Arc<dyn DatagramSink>, _: StunCallback) -> Result<()> {
            Ok(())
        }
        fn keepalive(&self, _: SocketAddr, _: SocketAddr, _: Arc<dyn DatagramSink>, _: StunCallback) -> Result<()> {
            Ok(())
        }
        fn process_response(&self, _: &[u8], _: SocketAddr) {}
    }

    #[test]
    fn kind_selection() {
        let plain = BindConfig::default();
        assert_eq!(plain.kind_for("udp").unwrap(), TransportKind::Udp);
        assert_eq!(plain.kind_for("TCP").unwrap(), TransportKind::Tcp);
        assert_eq!(plain.kind_for("wss").unwrap(), TransportKind::Wss);
        assert!(plain.kind_for("quic").is_err());

        let stun = BindConfig::default().set_stun(Arc::new(NoStun));
        assert_eq!(stun.kind_for("udp").unwrap(), TransportKind::StunUdp);
        let proxied = BindConfig::default().set_proxy("http://proxy.example.org:3128");
        assert_eq!(proxied.kind_for("tcp").unwrap(), TransportKind::Connect);
        assert_eq!(proxied.proxy_authority().unwrap(), "proxy.example.org:3128");
    }

    #[test]
    fn bind_checks() {
        assert!(BindConfig::default().check(TransportKind::Tls).is_err());
        assert!(BindConfig::default()
            .set_drop_probability(1.5)
            .check(TransportKind::Udp)
            .is_err());
        assert!(BindConfig::default()
            .set_proxy("proxy.example.org")
            .check(TransportKind::Connect)
            .is_err());
        assert!(BindConfig::default().check(TransportKind::Udp).is_ok());
    }

    #[test]
    fn tport_checks() {
        assert!(TportConfig::default().check().is_ok());
        assert!(TportConfig::default().set_queue_size(0).check().is_err());
        assert!(TportConfig::default()
            .set_pingpong(Duration::from_millis(200))
            .check()
            .is_err());
        assert!(TportConfig::default()
            .set_keepalive(Duration::from_millis(100))
            .set_pingpong(Duration::from_millis(200))
            .check()
            .is_ok());
    }
}
