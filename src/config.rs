use anyhow::bail;
use crate::message_header::HEADER_SIZE;

pub struct ChannelConfig {
    /// Messages bigger than this (header included) are treated as a corrupted channel. Both
    ///  sides of a channel should agree on this value, otherwise the receiver drops messages
    ///  that the sender considers valid.
    pub max_message_size: u32,

    /// The payload capacity that is reserved for new messages when no capacity is requested
    ///  explicitly
    pub default_segment_capacity: u32,

    /// The byte stream is written in chunks of at most this many bytes, independent of message
    ///  boundaries
    pub max_chunk_len: usize,
}

impl ChannelConfig {
    pub fn default_config() -> ChannelConfig {
        ChannelConfig {
            max_message_size: 256*1024*1024,
            default_segment_capacity: 64,
            max_chunk_len: 4096,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if (self.max_message_size as usize) < HEADER_SIZE {
            bail!("max message size {} is smaller than the message header", self.max_message_size);
        }
        if self.default_segment_capacity > self.max_message_size {
            bail!("default segment capacity {} exceeds the max message size {}", self.default_segment_capacity, self.max_message_size);
        }
        if self.max_chunk_len == 0 {
            bail!("max chunk length must be positive");
        }

        Ok(())
    }
}
