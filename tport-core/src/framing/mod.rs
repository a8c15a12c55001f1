//! Stream framing.
//!
//! Connection-oriented byte streams are cut into messages by a [`Framer`].
//! A fresh framer is created per connection through [`InitFramer`], so a
//! framer may keep per-connection parsing state.

use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use dyn_clone::DynClone;

use crate::error::{Error, Result};

pub const DEFAULT_MAX_MESSAGE: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";
const CRLFCRLF: &[u8] = b"\r\n\r\n";

/// One unit cut from a stream.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Frame {
    Message(Bytes),
    /// Double-CRLF keepalive ping.
    Ping,
    /// Single-CRLF keepalive pong.
    Pong,
}

pub trait Framer: Send {
    /// Cuts the next frame off the front of `buf`. `Ok(None)` means more
    /// bytes are needed; whatever is left in `buf` is an incomplete message.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>>;
}

pub trait InitFramer: Send + Sync + DynClone {
    fn framer(&self, peer: SocketAddr) -> Box<dyn Framer>;
}
dyn_clone::clone_trait_object!(InitFramer);

/// Frames SIP-style messages: a header block terminated by an empty line,
/// followed by `Content-Length` (or compact `l`) bytes of body.
pub struct SipFramer {
    max_message: usize,
}

impl SipFramer {
    pub fn new(max_message: usize) -> Self {
        Self { max_message }
    }
}

#[derive(Clone)]
pub struct SipInitFramer {
    max_message: usize,
}

impl SipInitFramer {
    pub fn new(max_message: usize) -> Self {
        Self { max_message }
    }
}

impl Default for SipInitFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE)
    }
}

impl InitFramer for SipInitFramer {
    fn framer(&self, _peer: SocketAddr) -> Box<dyn Framer> {
        Box::new(SipFramer::new(self.max_message))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads the body length from a header block.
pub fn content_length(head: &[u8]) -> Result<usize> {
    for line in head.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            continue;
        };
        let name = std::str::from_utf8(&line[..colon]).unwrap_or_default().trim();
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            let value = std::str::from_utf8(&line[colon + 1..])
                .map_err(|_| Error::Protocol("non-ascii content-length".into()))?;
            return value
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::Protocol(format!("bad content-length {:?}", value.trim())));
        }
    }
    Ok(0)
}

impl Framer for SipFramer {
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.starts_with(CRLF) {
            if buf.starts_with(CRLFCRLF) {
                buf.advance(CRLFCRLF.len());
                return Ok(Some(Frame::Ping));
            }
            // "\r\n\r" could still become a ping.
            if buf.len() == 3 && buf[2] == b'\r' {
                return Ok(None);
            }
            buf.advance(CRLF.len());
            return Ok(Some(Frame::Pong));
        }
        let Some(head_end) = find(buf, CRLFCRLF) else {
            if buf.len() > self.max_message {
                return Err(Error::Protocol(format!(
                    "header exceeds {} bytes",
                    self.max_message
                )));
            }
            return Ok(None);
        };
        let head_len = head_end + CRLFCRLF.len();
        let total = head_len + content_length(&buf[..head_end])?;
        if total > self.max_message {
            return Err(Error::Protocol(format!(
                "message of {total} bytes exceeds {}",
                self.max_message
            )));
        }
        if buf.len() < total {
            return Ok(None);
        }
        Ok(Some(Frame::Message(buf.split_to(total).freeze())))
    }
}
