//! Frame reassembly for stream transports.
//!
//! TCP delivers a byte stream, so a read may contain half a frame, one
//! frame, or several frames back to back. The framer buffers incoming
//! bytes and hands out only complete frames, using the 2-byte length
//! prefix of the header. Datagram transports bypass it entirely — one
//! datagram is one frame.

use crate::codec::HEADER_LEN;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// A stream carrying a frame whose declared length cannot even cover the
/// header is corrupt; there is no way to resynchronize, so the connection
/// must be dropped.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("stream carries a frame of declared length {0}, below the {HEADER_LEN}-byte header")]
pub struct FramingError(pub usize);

/// Accumulates stream bytes and extracts whole frames.
///
/// One instance per connection. Push bytes as they arrive with
/// [`StreamFramer::extend`], then drain complete frames with
/// [`StreamFramer::next_frame`] until it returns `Ok(None)`.
#[derive(Debug, Default)]
pub struct StreamFramer {
    buf: Vec<u8>,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly received bytes to the reassembly buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Detaches the next complete frame, if the buffer holds one.
    ///
    /// Returns `Ok(None)` while the buffer ends mid-frame; the partial
    /// bytes stay buffered for the next read.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let declared = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if declared < HEADER_LEN {
            return Err(FramingError(declared));
        }
        if self.buf.len() < declared {
            return Ok(None);
        }
        let frame = self.buf.drain(..declared).collect();
        Ok(Some(frame))
    }
}

/// Writes one encoded frame to a stream and flushes it.
///
/// Frames are already self-delimited, so this is just write-all plus a
/// flush — control frames are tiny and chat latency matters more than
/// batching them.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Frame, Payload};

    #[test]
    fn single_frame_passes_through() {
        let bytes = Frame::new(0, Payload::ConnectAccept).encode();
        let mut framer = StreamFramer::new();
        framer.extend(&bytes);
        assert_eq!(framer.next_frame().unwrap(), Some(bytes));
        assert_eq!(framer.next_frame().unwrap(), None);
    }

    #[test]
    fn frame_arriving_byte_by_byte() {
        let bytes = Frame::new(1, Payload::Connect {
            username: "alice".to_string(),
        })
        .encode();

        let mut framer = StreamFramer::new();
        for &b in &bytes[..bytes.len() - 1] {
            framer.extend(&[b]);
            assert_eq!(framer.next_frame().unwrap(), None);
        }
        framer.extend(&[bytes[bytes.len() - 1]]);
        assert_eq!(framer.next_frame().unwrap(), Some(bytes));
    }

    #[test]
    fn two_frames_in_one_read() {
        let first = Frame::new(0, Payload::ConnectAccept).encode();
        let second = Frame::new(1, Payload::Chat {
            sender: "bob".to_string(),
            text: "hello".to_string(),
        })
        .encode();

        let mut joined = first.clone();
        joined.extend_from_slice(&second);

        let mut framer = StreamFramer::new();
        framer.extend(&joined);
        assert_eq!(framer.next_frame().unwrap(), Some(first));
        assert_eq!(framer.next_frame().unwrap(), Some(second));
        assert_eq!(framer.next_frame().unwrap(), None);
    }

    #[test]
    fn trailing_partial_frame_stays_buffered() {
        let first = Frame::new(0, Payload::Ack).encode();
        let second = Frame::new(1, Payload::LeaveApp).encode();

        let mut framer = StreamFramer::new();
        framer.extend(&first);
        framer.extend(&second[..2]);
        assert_eq!(framer.next_frame().unwrap(), Some(first));
        assert_eq!(framer.next_frame().unwrap(), None);

        framer.extend(&second[2..]);
        assert_eq!(framer.next_frame().unwrap(), Some(second));
    }

    #[test]
    fn undersized_declared_length_poisons_the_stream() {
        let mut framer = StreamFramer::new();
        framer.extend(&[0x00, 0x02, 0x00, 0x00]);
        assert_eq!(framer.next_frame(), Err(FramingError(2)));
    }

    /// Written frames survive an in-memory pipe and reassembly.
    #[tokio::test]
    async fn write_then_reassemble() {
        use tokio::io::AsyncReadExt;

        let (mut writer, mut reader) = tokio::io::duplex(1024);
        let first = Frame::new(0, Payload::Connect {
            username: "alice".to_string(),
        })
        .encode();
        let second = Frame::new(1, Payload::LeaveApp).encode();

        write_frame(&mut writer, &first).await.unwrap();
        write_frame(&mut writer, &second).await.unwrap();
        drop(writer);

        let mut framer = StreamFramer::new();
        let mut buf = vec![0u8; 64];
        loop {
            match reader.read(&mut buf).await.unwrap() {
                0 => break,
                n => framer.extend(&buf[..n]),
            }
        }
        assert_eq!(framer.next_frame().unwrap(), Some(first));
        assert_eq!(framer.next_frame().unwrap(), Some(second));
        assert_eq!(framer.next_frame().unwrap(), None);
    }
}
