use bytes::Bytes;

/// What a datagram is, judged from its first two bytes.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum DatagramKind {
    Message,
    Stun,
    /// SigComp-compressed; needs a decompressor to become a message.
    Compressed,
    /// Empty datagram or bare CRLF.
    KeepAlive,
}

/// Pluggable classification step shared by the worker pool and the
/// plain UDP receive loop.
pub trait DatagramClassifier: Send + Sync {
    fn classify(&self, head: &[u8]) -> DatagramKind;

    fn decompress(&self, _datagram: &[u8]) -> Option<Bytes> {
        None
    }
}

#[derive(Copy, Clone, Default, Debug)]
pub struct DefaultClassifier;

impl DatagramClassifier for DefaultClassifier {
    fn classify(&self, head: &[u8]) -> DatagramKind {
        match head {
            [] | [b'\r', b'\n', ..] | [b'\r'] => DatagramKind::KeepAlive,
            [first, ..] if first & 0xf8 == 0xf8 => DatagramKind::Compressed,
            [0 | 1, ..] => DatagramKind::Stun,
            _ => DatagramKind::Message,
        }
    }
}

/// Turns a classified datagram into something deliverable, or `None` when it
/// is to be dropped.
pub fn admit(
    classifier: &dyn DatagramClassifier,
    kind: DatagramKind,
    datagram: Bytes,
) -> Option<(DatagramKind, Bytes)> {
    match kind {
        DatagramKind::Message | DatagramKind::Stun => Some((kind, datagram)),
        DatagramKind::Compressed => match classifier.decompress(&datagram) {
            Some(message) => Some((DatagramKind::Message, message)),
            None => {
                log::debug!("dropping {} byte compressed datagram", datagram.len());
                None
            }
        },
        DatagramKind::KeepAlive => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_first_bytes() {
        let c = DefaultClassifier;
        assert_eq!(c.classify(b"IN"), DatagramKind::Message);
        assert_eq!(c.classify(b"SI"), DatagramKind::Message);
        assert_eq!(c.classify(&[0x00, 0x01]), DatagramKind::Stun);
        assert_eq!(c.classify(&[0x01, 0x01]), DatagramKind::Stun);
        assert_eq!(c.classify(&[0xf8, 0x00]), DatagramKind::Compressed);
        assert_eq!(c.classify(b"\r\n"), DatagramKind::KeepAlive);
        assert_eq!(c.classify(b""), DatagramKind::KeepAlive);
    }

    struct Inflate;

    impl DatagramClassifier for Inflate {
        fn classify(&self, head: &[u8]) -> DatagramKind {
            DefaultClassifier.classify(head)
        }
        fn decompress(&self, datagram: &[u8]) -> Option<Bytes> {
            Some(Bytes::copy_from_slice(&datagram[1..]))
        }
    }

    #[test]
    fn compressed_needs_a_decompressor() {
        let datagram = Bytes::from_static(b"\xf8OPTIONS");
        assert_eq!(
            admit(&DefaultClassifier, DatagramKind::Compressed, datagram.clone()),
            None
        );
        assert_eq!(
            admit(&Inflate, DatagramKind::Compressed, datagram),
            Some((DatagramKind::Message, Bytes::from_static(b"OPTIONS")))
        );
    }
}
