use anyhow::bail;
use bytes::{Buf, BufMut};
use crate::header_flags::HeaderFlags;

pub type MsgId = u32;

/// Routing id of a message that is not yet addressed to an actor
pub const MSG_ROUTING_NONE: i32 = i32::MIN;
/// Routing id of a control message that is not addressed to a specific actor
pub const MSG_ROUTING_CONTROL: i32 = i32::MAX;

/// Message type of replies that are not associated with a generated message type
pub const IPC_REPLY_ID: MsgId = 0xFFF0;
pub const IPC_LOGGING_ID: MsgId = 0xFFF1;

/// The hard limit of file handles (and ports, and send rights) in a single message
pub const MAX_DESCRIPTORS_PER_MESSAGE: usize = 32767;

#[cfg(not(target_vendor = "apple"))]
pub const HEADER_SIZE: usize = 8 * size_of::<u32>();
#[cfg(target_vendor = "apple")]
pub const HEADER_SIZE: usize = 10 * size_of::<u32>();

/// The fixed-size header preceding every message on the wire. All numbers are little endian,
///  which is the in-memory layout of the header on every platform we talk to.
///
/// ```ascii
///  0: payload size (u32) - number of bytes after the header, including the padded footer
///  4: routing id (i32)
///  8: message type (u32)
/// 12: flags (u32, see HeaderFlags)
/// 16: number of attached file handles (u32)
///  *: [Apple only] cookie to acknowledge that handles were read (u32)
///  *: [Apple only] number of attached Mach send rights (u32)
///  *: transaction id (i32)
///  *: sequence number (i32)
///  *: footer size (u32) - the footer's logical length, without padding
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageHeader {
    pub payload_size: u32,
    pub routing: i32,
    pub msg_type: MsgId,
    pub flags: HeaderFlags,
    pub num_handles: u32,
    #[cfg(target_vendor = "apple")]
    pub cookie: u32,
    #[cfg(target_vendor = "apple")]
    pub num_send_rights: u32,
    pub txid: i32,
    pub seqno: i32,
    pub event_footer_size: u32,
}

impl MessageHeader {
    pub fn new(routing: i32, msg_type: MsgId, flags: HeaderFlags) -> MessageHeader {
        MessageHeader {
            payload_size: 0,
            routing,
            msg_type,
            flags,
            num_handles: 0,
            #[cfg(target_vendor = "apple")]
            cookie: 0,
            #[cfg(target_vendor = "apple")]
            num_send_rights: 0,
            txid: 0,
            seqno: 0,
            event_footer_size: 0,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.payload_size);
        buf.put_i32_le(self.routing);
        buf.put_u32_le(self.msg_type);
        buf.put_u32_le(self.flags.bits());
        buf.put_u32_le(self.num_handles);
        #[cfg(target_vendor = "apple")]
        {
            buf.put_u32_le(self.cookie);
            buf.put_u32_le(self.num_send_rights);
        }
        buf.put_i32_le(self.txid);
        buf.put_i32_le(self.seqno);
        buf.put_u32_le(self.event_footer_size);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        if buf.remaining() < HEADER_SIZE {
            bail!("incomplete message header: {} of {} bytes", buf.remaining(), HEADER_SIZE);
        }

        let payload_size = buf.get_u32_le();
        let routing = buf.get_i32_le();
        let msg_type = buf.get_u32_le();
        let flags = HeaderFlags::from_bits(buf.get_u32_le())?;
        let num_handles = buf.get_u32_le();
        #[cfg(target_vendor = "apple")]
        let cookie = buf.get_u32_le();
        #[cfg(target_vendor = "apple")]
        let num_send_rights = buf.get_u32_le();
        let txid = buf.get_i32_le();
        let seqno = buf.get_i32_le();
        let event_footer_size = buf.get_u32_le();

        Ok(MessageHeader {
            payload_size,
            routing,
            msg_type,
            flags,
            num_handles,
            #[cfg(target_vendor = "apple")]
            cookie,
            #[cfg(target_vendor = "apple")]
            num_send_rights,
            txid,
            seqno,
            event_footer_size,
        })
    }
}

/// Determines the total size of the message starting at the beginning of `range`, based on its
///  header alone. Returns 0 if `range` does not contain a full header yet, signalling that the
///  caller should retry once more bytes arrived.
pub fn message_size(range: &[u8]) -> u32 {
    if range.len() < HEADER_SIZE {
        return 0;
    }

    let mut header_bytes = range;
    let payload_size = header_bytes.get_u32_le();
    (HEADER_SIZE as u32)
        .checked_add(payload_size)
        .unwrap_or(0)
}
