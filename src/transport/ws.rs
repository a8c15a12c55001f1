//! SIP over WebSocket: one message per frame, text when the payload is
//! UTF-8 and binary otherwise. Pings from the peer are answered by the
//! WebSocket layer itself.

use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use rust_tport_core::error::{Error, Result};
use rust_tport_core::name::{Direction, TransportKind, TransportName};
use rust_tport_core::tls::{PeerIdentity, TlsEngine, TlsState};

use crate::config::BindConfig;
use crate::transport::{
    tcp, tls, Connection, PrimaryIo, PrimarySetup, RawStream, Received, RecvHalf, SendHalf,
    Transport, Wakeup,
};

fn ws_error(e: tungstenite::Error) -> Error {
    match e {
        tungstenite::Error::Io(e) => Error::Io(e),
        other => Error::Protocol(format!("websocket: {other}")),
    }
}

pub struct WsRecv<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> RecvHalf for WsRecv<S> {
    async fn recv(&mut self, _buf: &mut BytesMut) -> Result<Received> {
        loop {
            let message = match self.stream.next().await {
                None => return Ok(Received::Eof),
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                    return Ok(Received::Eof)
                }
                Some(Err(e)) => return Err(ws_error(e)),
                Some(Ok(message)) => message,
            };
            return Ok(match message {
                Message::Text(text) => Received::Message(Bytes::copy_from_slice(text.as_str().as_bytes())),
                Message::Binary(data) => Received::Message(data),
                Message::Pong(_) => Received::Pong,
                Message::Close(_) => Received::Eof,
                Message::Ping(_) | Message::Frame(_) => continue,
            });
        }
    }
}

pub struct WsSend<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> SendHalf for WsSend<S> {
    async fn send(&mut self, msgs: &[Bytes]) -> Result<()> {
        for msg in msgs {
            let frame = match std::str::from_utf8(msg) {
                Ok(text) => Message::text(text.to_owned()),
                Err(_) => Message::binary(msg.clone()),
            };
            self.sink.feed(frame).await.map_err(ws_error)?;
        }
        self.sink.flush().await.map_err(ws_error)
    }
    async fn ping(&mut self) -> Result<()> {
        self.sink.send(Message::Ping(Bytes::new())).await.map_err(ws_error)
    }
    async fn pong(&mut self) -> Result<()> {
        self.sink.send(Message::Pong(Bytes::new())).await.map_err(ws_error)
    }
    async fn shutdown(&mut self, how: Shutdown) -> Result<()> {
        match how {
            Shutdown::Read => Ok(()),
            Shutdown::Write | Shutdown::Both => self.sink.close().await.map_err(ws_error),
        }
    }
}

fn split<S>(ws: WebSocketStream<S>) -> (Box<dyn RecvHalf>, Box<dyn SendHalf>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (Box::new(WsRecv { stream }), Box::new(WsSend { sink }))
}

fn offers(request: &Request, wanted: &str) -> bool {
    request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim().eq_ignore_ascii_case(wanted))
}

async fn accept_ws<S>(stream: S, subprotocol: Option<String>) -> Result<(Box<dyn RecvHalf>, Box<dyn SendHalf>)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let callback = move |request: &Request, mut response: Response| -> std::result::Result<Response, ErrorResponse> {
        if let Some(wanted) = subprotocol.as_deref() {
            if offers(request, wanted) {
                if let Ok(value) = HeaderValue::from_str(wanted) {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
            }
        }
        Ok(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(ws_error)?;
    Ok(split(ws))
}

async fn connect_ws<S>(
    stream: S,
    url: String,
    subprotocol: Option<&str>,
) -> Result<(Box<dyn RecvHalf>, Box<dyn SendHalf>)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut request = url.into_client_request().map_err(ws_error)?;
    if let Some(subprotocol) = subprotocol {
        let value = HeaderValue::from_str(subprotocol).map_err(|e| Error::Config(e.to_string()))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }
    let (ws, _response) = tokio_tungstenite::client_async(request, stream)
        .await
        .map_err(ws_error)?;
    Ok(split(ws))
}

/// `ws` and, with a TLS engine, `wss`.
pub struct WsTransport {
    engine: Option<Arc<TlsEngine>>,
    path: String,
    subprotocol: Option<String>,
}

impl WsTransport {
    pub fn new(config: &BindConfig, engine: Option<Arc<TlsEngine>>) -> Result<Self> {
        Ok(Self {
            engine,
            path: config.ws_path.clone(),
            subprotocol: config.ws_subprotocol.clone(),
        })
    }

    fn url(&self, peer_name: &TransportName) -> String {
        let scheme = if self.engine.is_some() { "wss" } else { "ws" };
        format!("{scheme}://{}{}", peer_name.authority(), self.path)
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn kind(&self) -> TransportKind {
        if self.engine.is_some() {
            TransportKind::Wss
        } else {
            TransportKind::Ws
        }
    }

    async fn init_primary(&self, setup: &PrimarySetup) -> Result<PrimaryIo> {
        match &self.engine {
            Some(engine) => tls::listen_or_outbound(engine, setup),
            None => tcp::listen(setup),
        }
    }

    async fn wakeup_primary(&self, io: &PrimaryIo) -> Result<Wakeup> {
        tcp::accept(io).await
    }

    async fn connect(&self, setup: &PrimarySetup, peer: SocketAddr) -> Result<RawStream> {
        tcp::dial(setup, peer).await
    }

    async fn init_secondary(
        &self,
        _setup: &PrimarySetup,
        stream: RawStream,
        direction: Direction,
        peer_name: &TransportName,
        on_state: &mut (dyn FnMut(TlsState) + Send),
    ) -> Result<Connection> {
        let stream = stream.into_tcp()?;
        let local = stream.local_addr().ok();
        let subprotocol = self.subprotocol.clone();
        let (identity, (recv, send)) = match (&self.engine, direction) {
            (None, Direction::Incoming) => (PeerIdentity::default(), accept_ws(stream, subprotocol).await?),
            (None, Direction::Outgoing) => (
                PeerIdentity::default(),
                connect_ws(stream, self.url(peer_name), subprotocol.as_deref()).await?,
            ),
            (Some(engine), Direction::Incoming) => {
                let (stream, identity) = engine.accept(stream, on_state).await?;
                (identity, accept_ws(stream, subprotocol).await?)
            }
            (Some(engine), Direction::Outgoing) => {
                let (stream, identity) = engine.connect(stream, peer_name.host(), on_state).await?;
                (
                    identity,
                    connect_ws(stream, self.url(peer_name), subprotocol.as_deref()).await?,
                )
            }
        };
        Ok(Connection {
            recv,
            send,
            identity,
            local,
            tunnel_pending: false,
        })
    }
}
