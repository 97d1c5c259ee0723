use anyhow::bail;
use bytes::BytesMut;
use tracing::trace;

use crate::message::Message;
use crate::message_header::{message_size, HEADER_SIZE};
use crate::util::SafeCast;

/// Reassembles messages from a byte stream that arrives in chunks of arbitrary size. Chunk
///  boundaries need not coincide with message boundaries.
pub struct MessageBuffer {
    buf: BytesMut,
    max_message_size: u32,
}

impl MessageBuffer {
    pub fn new(max_message_size: u32) -> MessageBuffer {
        MessageBuffer {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// number of buffered bytes that are not part of a returned message yet
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the next complete message, or `Ok(None)` if more bytes are needed. An error means
    ///  that the stream is corrupted and can not be recovered.
    pub fn try_next(&mut self) -> anyhow::Result<Option<Message>> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let size = message_size(&self.buf);
        if size == 0 {
            bail!("message size in header overflows");
        }
        if size > self.max_message_size {
            bail!("message of {} bytes exceeds the max message size of {} bytes", size, self.max_message_size);
        }

        let size: usize = size.safe_cast();
        if self.buf.len() < size {
            trace!("{} of {} bytes of the next message are buffered", self.buf.len(), size);
            return Ok(None);
        }

        let raw = self.buf.split_to(size);
        Message::deser(raw).map(Some)
    }
}
