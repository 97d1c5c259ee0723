use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::attachment::{take_next, Attachments, FileHandle, ScopedPort};
#[cfg(target_vendor = "apple")]
use crate::attachment::MachSendRight;
use crate::header_flags::{CallKind, Compression, ConstructorKind, HeaderFlags, LazySend, NestedLevel, Priority, ReplyKind};
use crate::message_header::{MessageHeader, MsgId, HEADER_SIZE, MAX_DESCRIPTORS_PER_MESSAGE, MSG_ROUTING_NONE};
use crate::util::{align_int, padding_for, PrecheckedCast, SafeCast};

/// payload capacity that is reserved when a message is created with a capacity of 0
pub const DEFAULT_SEGMENT_CAPACITY: usize = 64;

/// A message as it is exchanged between processes: a fixed [MessageHeader], the payload written
///  by the sender, an optional footer, and attachments that are relayed outside of the byte
///  stream.
///
/// On the wire, the footer follows the payload and is padded to a multiple of 4 bytes; the
///  header's `event_footer_size` holds its unpadded length.
///
/// Attachments are referenced from the payload by their index in the respective side list, and
///  they can be consumed exactly once. Attachments that are still in the message when it is
///  dropped are released.
pub struct Message {
    header: MessageHeader,
    payload: BytesMut,
    footer: BytesMut,
    attachments: Attachments,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{routing:{}, type:{:#x}, txid:{}, seqno:{}, size:{}, {:?}}}",
               self.header.routing, self.header.msg_type, self.header.txid, self.header.seqno, self.size(), self.header.flags)
    }
}

impl Message {
    pub fn new(routing_id: i32, msg_type: MsgId, segment_capacity: u32, flags: HeaderFlags) -> Message {
        let capacity = match segment_capacity {
            0 => DEFAULT_SEGMENT_CAPACITY,
            n => n.safe_cast(),
        };

        Message {
            header: MessageHeader::new(routing_id, msg_type, flags),
            payload: BytesMut::with_capacity(capacity),
            footer: BytesMut::new(),
            attachments: Attachments::default(),
        }
    }

    /// A message whose handling creates a new actor, bound to `routing_id`
    pub fn new_constructor(routing_id: i32, msg_type: MsgId, segment_capacity: u32, flags: HeaderFlags) -> Message {
        let mut result = Message::new(routing_id, msg_type, segment_capacity, flags);
        result.header.flags.set_constructor();
        result
    }

    /// The message that is sent back when a synchronous message could not be dispatched at all
    pub fn for_sync_dispatch_error(level: NestedLevel) -> Message {
        let mut result = Message::new(MSG_ROUTING_NONE, 0, 0, HeaderFlags::from(level));
        result.header.flags.set_sync();
        result.header.flags.set_reply_error();
        result
    }

    /// Creates the reply to `call`, addressed to the same actor and carrying the call's nesting,
    ///  priority and sequencing information so the caller can match it.
    pub fn reply_to(call: &Message, msg_type: MsgId) -> Message {
        let sync = if call.is_sync() { CallKind::Sync } else { CallKind::Async };
        let flags = HeaderFlags::new(
            call.nested_level(),
            call.priority(),
            Compression::None,
            LazySend::Eager,
            ConstructorKind::NotConstructor,
            sync,
            ReplyKind::NotReply,
        );

        let mut result = Message::new(call.routing_id(), msg_type, 0, flags);
        result.header.flags.set_reply();
        result.set_transaction_id(call.transaction_id());
        result.set_seqno(call.seqno());
        result
    }

    /// Reconstructs a message from its complete wire representation. The payload is split off
    ///  `buf` without copying.
    pub fn deser(mut buf: BytesMut) -> anyhow::Result<Message> {
        if buf.len() < HEADER_SIZE {
            bail!("message of {} bytes is shorter than the header size of {} bytes", buf.len(), HEADER_SIZE);
        }

        let header = MessageHeader::deser(&mut &buf[..HEADER_SIZE])?;

        let payload_size: usize = header.payload_size.safe_cast();
        if buf.len() - HEADER_SIZE != payload_size {
            bail!("header announces a payload of {} bytes, but {} bytes are present", payload_size, buf.len() - HEADER_SIZE);
        }

        let footer_len: usize = header.event_footer_size.safe_cast();
        if align_int(footer_len) > payload_size {
            bail!("footer of {} bytes exceeds the payload of {} bytes", footer_len, payload_size);
        }

        let num_handles: usize = header.num_handles.safe_cast();
        if num_handles > MAX_DESCRIPTORS_PER_MESSAGE {
            bail!("message announces {} file handles, the limit is {}", num_handles, MAX_DESCRIPTORS_PER_MESSAGE);
        }
        #[cfg(target_vendor = "apple")]
        {
            let num_send_rights: usize = header.num_send_rights.safe_cast();
            if num_send_rights > MAX_DESCRIPTORS_PER_MESSAGE {
                bail!("message announces {} send rights, the limit is {}", num_send_rights, MAX_DESCRIPTORS_PER_MESSAGE);
            }
        }

        buf.advance(HEADER_SIZE);
        let payload = buf.split_to(payload_size - align_int(footer_len));
        buf.truncate(footer_len);

        let result = Message {
            header,
            payload,
            footer: buf,
            attachments: Attachments::default(),
        };
        trace!("deserialized {:?}", result);
        result.assert_as_large_as_header();
        Ok(result)
    }

    /// Writes the message's bytes, i.e. everything except attachments
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.reserve(self.size());

        self.header.ser(buf);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.footer);
        buf.put_bytes(0, padding_for(self.footer.len()));
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn nested_level(&self) -> NestedLevel {
        self.header.flags.level()
    }

    pub fn priority(&self) -> Priority {
        self.header.flags.priority()
    }

    pub fn is_constructor(&self) -> bool {
        self.header.flags.is_constructor()
    }

    pub fn is_sync(&self) -> bool {
        self.header.flags.is_sync()
    }

    pub fn compress_type(&self) -> Compression {
        self.header.flags.compression()
    }

    pub fn is_lazy_send(&self) -> bool {
        self.header.flags.is_lazy_send()
    }

    pub fn is_reply(&self) -> bool {
        self.header.flags.is_reply()
    }

    pub fn is_reply_error(&self) -> bool {
        self.header.flags.is_reply_error()
    }

    pub fn is_relay(&self) -> bool {
        self.header.flags.is_relay()
    }

    pub fn set_relay(&mut self, relay: bool) {
        self.header.flags.set_relay(relay);
    }

    pub fn msg_type(&self) -> MsgId {
        self.header.msg_type
    }

    pub fn routing_id(&self) -> i32 {
        self.header.routing
    }

    pub fn set_routing_id(&mut self, routing_id: i32) {
        self.header.routing = routing_id;
    }

    pub fn transaction_id(&self) -> i32 {
        self.header.txid
    }

    pub fn set_transaction_id(&mut self, txid: i32) {
        self.header.txid = txid;
    }

    pub fn seqno(&self) -> i32 {
        self.header.seqno
    }

    pub fn set_seqno(&mut self, seqno: i32) {
        self.header.seqno = seqno;
    }

    pub fn event_footer_size(&self) -> u32 {
        self.header.event_footer_size
    }

    /// the number of bytes this message occupies on the wire
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + align_int(self.footer.len())
    }

    /// Attachments do not count because they do not travel inside the byte stream
    pub fn get_size_if_serialized(&self) -> usize {
        self.size()
    }

    pub fn assert_as_large_as_header(&self) {
        assert!(self.size() >= HEADER_SIZE, "this is a bug: message is smaller than its header");
    }

    fn update_sizes(&mut self) {
        self.header.payload_size = (self.payload.len() + align_int(self.footer.len())).prechecked_cast();
        self.header.event_footer_size = self.footer.len().prechecked_cast();
    }

    fn write_aligned(&mut self, data: &[u8]) {
        self.payload.put_slice(data);
        self.payload.put_bytes(0, padding_for(data.len()));
        self.update_sizes();
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_aligned(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_aligned(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_aligned(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_aligned(&value.to_le_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u32(value.into());
    }

    /// raw bytes without a length prefix, padded to the next 4-byte boundary
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.write_aligned(data);
    }

    /// length-prefixed bytes
    pub fn write_data(&mut self, data: &[u8]) {
        self.write_u32(data.len().prechecked_cast());
        self.write_aligned(data);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_data(s.as_bytes());
    }

    pub fn reader(&mut self) -> MessageReader<'_> {
        MessageReader {
            buf: &self.payload,
            attachments: &mut self.attachments,
        }
    }

    /// Appends `data` to the footer. Repeated calls extend the footer.
    pub fn write_footer(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.footer.put_slice(data);
        self.update_sizes();
    }

    /// Copies the footer into the beginning of `buffer`, removing it from the message if
    ///  `truncate` is set.
    ///
    /// This fails if `buffer` is too small for the footer, or if there is no footer but
    ///  `buffer` expects one, e.g. because it was truncated previously.
    pub fn read_footer(&mut self, buffer: &mut [u8], truncate: bool) -> anyhow::Result<()> {
        let footer_len = self.footer.len();
        if footer_len == 0 && !buffer.is_empty() {
            bail!("message has no footer");
        }
        if buffer.len() < footer_len {
            bail!("buffer of {} bytes is too small for a footer of {} bytes", buffer.len(), footer_len);
        }

        buffer[..footer_len].copy_from_slice(&self.footer);

        if truncate {
            self.footer.clear();
            self.update_sizes();
        }
        Ok(())
    }

    pub fn num_handles(&self) -> usize {
        self.attachments.handles.len()
    }

    /// Attaches a file handle, writing its index into the payload. This fails (closing the
    ///  handle) if the message already holds the maximum number of handles.
    pub fn write_file_handle(&mut self, handle: FileHandle) -> anyhow::Result<()> {
        let index = self.attachments.handles.len();
        if index >= MAX_DESCRIPTORS_PER_MESSAGE {
            bail!("a message can hold at most {} file handles", MAX_DESCRIPTORS_PER_MESSAGE);
        }

        self.write_u32(index.prechecked_cast());
        self.attachments.handles.push(Some(handle));
        self.header.num_handles = self.attachments.handles.len().prechecked_cast();
        Ok(())
    }

    /// Moves the first file handle out that was not consumed yet
    pub fn take_file_handle(&mut self) -> Option<FileHandle> {
        take_next(&mut self.attachments.handles)
    }

    /// Attaches the handles that arrived out of band for a received message. The header's handle
    ///  count is set to match.
    ///
    /// Panics if the message holds handles already: handles are attached exactly once after
    ///  arrival.
    pub fn set_attached_file_handles(&mut self, handles: Vec<FileHandle>) {
        assert!(self.attachments.handles.is_empty(), "this is a bug: file handles can only be attached to a message without handles");
        assert!(handles.len() <= MAX_DESCRIPTORS_PER_MESSAGE, "this is a bug: more than {} file handles", MAX_DESCRIPTORS_PER_MESSAGE);

        self.header.num_handles = handles.len().prechecked_cast();
        self.attachments.handles = handles.into_iter().map(Some).collect();
    }

    /// Attaches a port, writing its index into the payload
    pub fn write_port(&mut self, port: ScopedPort) {
        self.write_u32(self.attachments.ports.len().prechecked_cast());
        self.attachments.ports.push(Some(port));
    }

    pub fn take_port(&mut self) -> Option<ScopedPort> {
        take_next(&mut self.attachments.ports)
    }

    pub fn num_ports(&self) -> usize {
        self.attachments.ports.len()
    }

    /// Panics if the message holds ports already
    pub fn set_attached_ports(&mut self, ports: Vec<ScopedPort>) {
        assert!(self.attachments.ports.is_empty(), "this is a bug: ports can only be attached to a message without ports");
        self.attachments.ports = ports.into_iter().map(Some).collect();
    }

    #[cfg(target_vendor = "apple")]
    pub fn write_mach_send_right(&mut self, right: MachSendRight) -> anyhow::Result<()> {
        let index = self.attachments.send_rights.len();
        if index >= MAX_DESCRIPTORS_PER_MESSAGE {
            bail!("a message can hold at most {} send rights", MAX_DESCRIPTORS_PER_MESSAGE);
        }

        self.write_u32(index.prechecked_cast());
        self.attachments.send_rights.push(Some(right));
        self.header.num_send_rights = self.attachments.send_rights.len().prechecked_cast();
        Ok(())
    }

    #[cfg(target_vendor = "apple")]
    pub fn take_mach_send_right(&mut self) -> Option<MachSendRight> {
        take_next(&mut self.attachments.send_rights)
    }

    #[cfg(target_vendor = "apple")]
    pub fn set_attached_send_rights(&mut self, rights: Vec<MachSendRight>) {
        assert!(self.attachments.send_rights.is_empty(), "this is a bug: send rights can only be attached to a message without send rights");
        assert!(rights.len() <= MAX_DESCRIPTORS_PER_MESSAGE, "this is a bug: more than {} send rights", MAX_DESCRIPTORS_PER_MESSAGE);
        self.header.num_send_rights = rights.len().prechecked_cast();
        self.attachments.send_rights = rights.into_iter().map(Some).collect();
    }

    #[cfg(target_vendor = "apple")]
    pub fn num_send_rights(&self) -> usize {
        self.attachments.send_rights.len()
    }

    #[cfg(target_vendor = "apple")]
    pub fn fd_cookie(&self) -> u32 {
        self.header.cookie
    }

    #[cfg(target_vendor = "apple")]
    pub fn set_fd_cookie(&mut self, cookie: u32) {
        self.header.cookie = cookie;
    }

    /// The number of attachments that the platform transport relays separately from the bytes
    pub fn num_relayed_attachments(&self) -> usize {
        #[cfg(windows)]
        return self.num_handles();
        #[cfg(target_vendor = "apple")]
        return self.num_send_rights();
        #[cfg(not(any(windows, target_vendor = "apple")))]
        return 0;
    }

    /// Moves all attachments out, for a transport that relays them out of band. The header keeps
    ///  the counts that were serialized.
    pub fn take_attachments(&mut self) -> Attachments {
        std::mem::take(&mut self.attachments)
    }
}


/// Reads a message's payload sequentially, in the order it was written. Attachments referenced
///  from the payload are moved out of the message when they are consumed.
pub struct MessageReader<'a> {
    buf: &'a [u8],
    attachments: &'a mut Attachments,
}

impl<'a> MessageReader<'a> {
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_aligned(&mut self, len: usize) -> anyhow::Result<&'a [u8]> {
        let aligned = align_int(len);
        if self.buf.len() < aligned {
            bail!("payload underflow: {} bytes requested, {} remaining", aligned, self.buf.len());
        }

        let (head, tail) = self.buf.split_at(aligned);
        self.buf = tail;
        Ok(&head[..len])
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        let mut raw = self.take_aligned(size_of::<u32>())?;
        Ok(raw.get_u32_le())
    }

    pub fn read_i32(&mut self) -> anyhow::Result<i32> {
        let mut raw = self.take_aligned(size_of::<i32>())?;
        Ok(raw.get_i32_le())
    }

    pub fn read_u64(&mut self) -> anyhow::Result<u64> {
        let mut raw = self.take_aligned(size_of::<u64>())?;
        Ok(raw.get_u64_le())
    }

    pub fn read_i64(&mut self) -> anyhow::Result<i64> {
        let mut raw = self.take_aligned(size_of::<i64>())?;
        Ok(raw.get_i64_le())
    }

    pub fn read_bool(&mut self) -> anyhow::Result<bool> {
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            n => bail!("invalid bool value {}", n),
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> anyhow::Result<&'a [u8]> {
        self.take_aligned(len)
    }

    pub fn read_data(&mut self) -> anyhow::Result<&'a [u8]> {
        let len = self.read_u32()?.safe_cast();
        self.take_aligned(len)
    }

    pub fn read_str(&mut self) -> anyhow::Result<&'a str> {
        let raw = self.read_data()?;
        Ok(std::str::from_utf8(raw)?)
    }

    /// Reads a handle index from the payload and moves the referenced handle out of the message
    pub fn consume_file_handle(&mut self) -> anyhow::Result<FileHandle> {
        let index: usize = self.read_u32()?.safe_cast();
        match self.attachments.handles.get_mut(index).and_then(Option::take) {
            Some(handle) => Ok(handle),
            None => bail!("file handle #{} is missing or was consumed already", index),
        }
    }

    pub fn consume_port(&mut self) -> anyhow::Result<ScopedPort> {
        let index: usize = self.read_u32()?.safe_cast();
        match self.attachments.ports.get_mut(index).and_then(Option::take) {
            Some(port) => Ok(port),
            None => bail!("port #{} is missing or was consumed already", index),
        }
    }

    #[cfg(target_vendor = "apple")]
    pub fn consume_mach_send_right(&mut self) -> anyhow::Result<MachSendRight> {
        let index: usize = self.read_u32()?.safe_cast();
        match self.attachments.send_rights.get_mut(index).and_then(Option::take) {
            Some(right) => Ok(right),
            None => bail!("send right #{} is missing or was consumed already", index),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use mockall::predicate::eq;
    use rstest::rstest;
    use crate::attachment::{MockPortController, PortName};
    use crate::message_header::MSG_ROUTING_CONTROL;
    use super::*;

    fn wire(msg: &Message) -> BytesMut {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        buf
    }

    #[cfg(unix)]
    fn dev_null() -> FileHandle {
        std::fs::File::open("/dev/null").unwrap().into()
    }

    #[test]
    fn test_new_message_defaults() {
        let msg = Message::new(3, 44, 0, HeaderFlags::default());
        assert_eq!(msg.routing_id(), 3);
        assert_eq!(msg.msg_type(), 44);
        assert_eq!(msg.transaction_id(), 0);
        assert_eq!(msg.seqno(), 0);
        assert_eq!(msg.num_handles(), 0);
        assert_eq!(msg.header().num_handles, 0);
        assert_eq!(msg.event_footer_size(), 0);
        assert_eq!(msg.size(), HEADER_SIZE);
        assert_eq!(msg.get_size_if_serialized(), HEADER_SIZE);
        msg.assert_as_large_as_header();
    }

    #[test]
    fn test_sync_control_message() {
        let flags = HeaderFlags::new(NestedLevel::NotNested, Priority::Normal, Compression::None, LazySend::Eager, ConstructorKind::NotConstructor, CallKind::Sync, ReplyKind::NotReply);
        let msg = Message::new(MSG_ROUTING_CONTROL, 0x1234, 0, flags);

        assert!(msg.is_sync());
        assert!(!msg.is_reply());
        assert!(!msg.is_reply_error());
        assert_eq!(msg.nested_level(), NestedLevel::NotNested);
        assert_eq!(msg.priority(), Priority::Normal);
        assert_eq!(msg.routing_id(), MSG_ROUTING_CONTROL);
    }

    #[test]
    fn test_for_sync_dispatch_error() {
        let msg = Message::for_sync_dispatch_error(NestedLevel::NestedInsideSync);
        assert_eq!(msg.routing_id(), MSG_ROUTING_NONE);
        assert_eq!(msg.msg_type(), 0);
        assert!(msg.is_sync());
        assert!(msg.is_reply());
        assert!(msg.is_reply_error());
        assert_eq!(msg.nested_level(), NestedLevel::NestedInsideSync);
    }

    #[test]
    fn test_reply_to() {
        let flags = HeaderFlags::new(NestedLevel::NestedInsideSync, Priority::Input, Compression::Enabled, LazySend::Lazy, ConstructorKind::Constructor, CallKind::Sync, ReplyKind::NotReply);
        let mut call = Message::new(12, 7, 0, flags);
        call.set_transaction_id(31);
        call.set_seqno(32);

        let reply = Message::reply_to(&call, 8);
        assert_eq!(reply.routing_id(), 12);
        assert_eq!(reply.msg_type(), 8);
        assert_eq!(reply.transaction_id(), 31);
        assert_eq!(reply.seqno(), 32);
        assert!(reply.is_reply());
        assert!(reply.is_sync());
        assert!(!reply.is_reply_error());
        assert!(!reply.is_constructor());
        assert_eq!(reply.nested_level(), NestedLevel::NestedInsideSync);
        assert_eq!(reply.priority(), Priority::Input);
    }

    #[test]
    fn test_set_relay() {
        let mut msg = Message::new(1, 1, 0, HeaderFlags::default());
        msg.set_relay(true);
        assert!(msg.is_relay());
        msg.set_relay(false);
        assert!(!msg.is_relay());
    }

    #[test]
    fn test_ser_deser() {
        let mut msg = Message::new(5, 6, 16, HeaderFlags::from(NestedLevel::NestedInsideCpow));
        msg.set_transaction_id(-8);
        msg.set_seqno(9);
        msg.write_u32(10);
        msg.write_str("hello");
        msg.write_footer(b"abcde");

        let buf = wire(&msg);
        assert_eq!(buf.len(), HEADER_SIZE + 4 + 4 + 8 + 8);
        assert_eq!(buf.len(), msg.size());
        assert_eq!(message_size_of(&buf), buf.len());

        let mut deser = Message::deser(buf).unwrap();
        assert_eq!(deser.header(), msg.header());
        assert_eq!(deser.payload(), msg.payload());
        assert_eq!(deser.event_footer_size(), 5);
        assert_eq!(deser.size(), msg.size());

        let mut footer = [0u8; 5];
        deser.read_footer(&mut footer, true).unwrap();
        assert_eq!(&footer, b"abcde");

        let mut reader = deser.reader();
        assert_eq!(reader.read_u32().unwrap(), 10);
        assert_eq!(reader.read_str().unwrap(), "hello");
        assert!(reader.is_empty());
    }

    fn message_size_of(buf: &[u8]) -> usize {
        crate::message_header::message_size(buf) as usize
    }

    #[rstest]
    #[case::empty(0)]
    #[case::partial_header(HEADER_SIZE - 1)]
    fn test_deser_shorter_than_header(#[case] len: usize) {
        let msg = Message::new(1, 2, 0, HeaderFlags::default());
        let mut buf = wire(&msg);
        buf.truncate(len);
        assert!(Message::deser(buf).is_err());
    }

    #[test]
    fn test_deser_incomplete_payload() {
        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        msg.write_u64(77);
        let mut buf = wire(&msg);
        buf.truncate(buf.len() - 1);
        assert!(Message::deser(buf).is_err());
    }

    #[test]
    fn test_deser_footer_exceeds_payload() {
        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        msg.write_u32(1);
        let mut buf = wire(&msg);
        buf[HEADER_SIZE - 4] = 5; // footer size

        assert!(Message::deser(buf).is_err());
    }

    #[test]
    fn test_deser_too_many_handles() {
        let mut header = MessageHeader::new(1, 2, HeaderFlags::default());
        header.num_handles = MAX_DESCRIPTORS_PER_MESSAGE as u32 + 1;
        let mut buf = BytesMut::new();
        header.ser(&mut buf);

        assert!(Message::deser(buf).is_err());
    }

    #[test]
    fn test_footer() {
        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        msg.write_u32(99);
        let size_before_footer = msg.size();

        msg.write_footer(b"12345");
        assert_eq!(msg.event_footer_size(), 5);
        assert_eq!(msg.size(), size_before_footer + 8);
        assert_eq!(msg.header().payload_size, 12);

        let mut buf = [0u8; 5];
        msg.read_footer(&mut buf, false).unwrap();
        assert_eq!(&buf, b"12345");
        assert_eq!(msg.event_footer_size(), 5);

        let mut buf = [0u8; 5];
        msg.read_footer(&mut buf, true).unwrap();
        assert_eq!(&buf, b"12345");
        assert_eq!(msg.event_footer_size(), 0);
        assert_eq!(msg.size(), size_before_footer);

        assert!(msg.read_footer(&mut buf, true).is_err());
    }

    #[test]
    fn test_footer_is_cumulative() {
        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        msg.write_footer(b"ab");
        msg.write_footer(b"");
        msg.write_footer(b"cde");
        assert_eq!(msg.event_footer_size(), 5);

        let mut buf = [0u8; 5];
        msg.read_footer(&mut buf, false).unwrap();
        assert_eq!(&buf, b"abcde");
    }

    #[test]
    fn test_footer_buffer_too_small() {
        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        msg.write_footer(b"abcdef");

        let mut buf = [0u8; 5];
        assert!(msg.read_footer(&mut buf, true).is_err());
        assert_eq!(msg.event_footer_size(), 6);
    }

    #[test]
    fn test_read_past_payload() {
        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        msg.write_bool(true);
        msg.write_bytes(b"xyz");

        let mut reader = msg.reader();
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_bytes(3).unwrap(), b"xyz");
        assert!(reader.read_u32().is_err());
    }

    #[test]
    fn test_read_invalid_bool() {
        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        msg.write_u32(2);
        assert!(msg.reader().read_bool().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_handles_are_taken_in_order() {
        use std::os::fd::AsRawFd;

        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        let mut raw_fds = Vec::new();
        for _ in 0..3 {
            let handle = dev_null();
            raw_fds.push(handle.as_raw_fd());
            msg.write_file_handle(handle).unwrap();
        }
        assert_eq!(msg.num_handles(), 3);
        assert_eq!(msg.header().num_handles, 3);

        for expected in raw_fds {
            assert_eq!(msg.take_file_handle().unwrap().as_raw_fd(), expected);
        }
        assert!(msg.take_file_handle().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_consume_file_handle_through_reader() {
        use std::os::fd::AsRawFd;

        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        let first = dev_null();
        let first_fd = first.as_raw_fd();
        msg.write_u32(7);
        msg.write_file_handle(first).unwrap();
        msg.write_file_handle(dev_null()).unwrap();

        {
            let mut reader = msg.reader();
            assert_eq!(reader.read_u32().unwrap(), 7);
            assert_eq!(reader.consume_file_handle().unwrap().as_raw_fd(), first_fd);
            assert!(reader.consume_file_handle().is_ok());
            assert!(reader.consume_file_handle().is_err());
        }

        // a second pass finds the slots empty
        let mut reader = msg.reader();
        reader.read_u32().unwrap();
        assert!(reader.consume_file_handle().is_err());
        assert!(msg.take_file_handle().is_none());
    }

    #[cfg(unix)]
    #[test]
    #[should_panic]
    fn test_set_attached_file_handles_twice() {
        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        msg.set_attached_file_handles(vec![dev_null()]);
        msg.set_attached_file_handles(vec![dev_null()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_set_attached_file_handles_updates_header() {
        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        msg.set_attached_file_handles(vec![dev_null(), dev_null()]);
        assert_eq!(msg.num_handles(), 2);
        assert_eq!(msg.header().num_handles, 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_file_handle_beyond_limit() {
        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        // consumed slots count towards the limit just like attached handles
        msg.attachments.handles.resize_with(MAX_DESCRIPTORS_PER_MESSAGE - 1, || None);

        msg.write_file_handle(dev_null()).unwrap();
        assert_eq!(msg.num_handles(), MAX_DESCRIPTORS_PER_MESSAGE);
        let payload_len = msg.payload().len();

        assert!(msg.write_file_handle(dev_null()).is_err());
        assert_eq!(msg.num_handles(), MAX_DESCRIPTORS_PER_MESSAGE);
        assert_eq!(msg.header().num_handles as usize, MAX_DESCRIPTORS_PER_MESSAGE);
        assert_eq!(msg.payload().len(), payload_len);

        assert!(msg.take_file_handle().is_some());
        assert!(msg.take_file_handle().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_set_attached_file_handles_beyond_limit() {
        use std::panic::{catch_unwind, AssertUnwindSafe};

        let template = std::fs::File::open("/dev/null").unwrap();
        let mut handles = Vec::with_capacity(MAX_DESCRIPTORS_PER_MESSAGE + 1);
        for _ in 0..=MAX_DESCRIPTORS_PER_MESSAGE {
            match template.try_clone() {
                Ok(file) => handles.push(FileHandle::from(file)),
                Err(e) => {
                    // the process' descriptor limit is below the message limit
                    tracing::warn!("skipping, cannot open {} descriptors: {}", MAX_DESCRIPTORS_PER_MESSAGE + 1, e);
                    return;
                }
            }
        }

        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        let result = catch_unwind(AssertUnwindSafe(|| msg.set_attached_file_handles(handles)));
        assert!(result.is_err());
        assert_eq!(msg.num_handles(), 0);
    }

    #[test]
    fn test_new_constructor() {
        let msg = Message::new_constructor(12, 3, 0, HeaderFlags::from(NestedLevel::NestedInsideSync));
        assert!(msg.is_constructor());
        assert_eq!(msg.routing_id(), 12);
        assert_eq!(msg.nested_level(), NestedLevel::NestedInsideSync);
        assert!(!Message::new(12, 3, 0, HeaderFlags::default()).is_constructor());
    }

    #[test]
    fn test_set_attached_file_handles_on_empty() {
        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        msg.set_attached_file_handles(vec![]);
        assert_eq!(msg.num_handles(), 0);
        assert!(msg.take_file_handle().is_none());
    }

    fn port_name(n: u64) -> PortName {
        PortName { v1: n, v2: 0 }
    }

    #[test]
    fn test_unconsumed_ports_are_closed_on_drop() {
        let mut controller = MockPortController::new();
        controller.expect_close_port()
            .with(eq(port_name(2)))
            .times(1)
            .return_const(());
        let controller = Arc::new(controller);

        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        msg.write_port(ScopedPort::new(port_name(1), controller.clone()));
        msg.write_port(ScopedPort::new(port_name(2), controller.clone()));
        assert_eq!(msg.num_ports(), 2);

        let port = msg.reader().consume_port().unwrap();
        assert_eq!(port.name(), port_name(1));
        port.release();

        drop(msg);
    }

    #[test]
    fn test_consume_port_once() {
        let mut controller = MockPortController::new();
        controller.expect_close_port()
            .times(0);

        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        msg.write_port(ScopedPort::new(port_name(9), Arc::new(controller)));

        let port = msg.take_port().unwrap();
        assert!(msg.take_port().is_none());
        assert!(msg.reader().consume_port().is_err());
        port.release();
    }

    #[test]
    #[should_panic]
    fn test_set_attached_ports_twice() {
        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        msg.set_attached_ports(vec![ScopedPort::new(port_name(1), Arc::new(NoopController))]);
        msg.set_attached_ports(vec![]);
    }

    struct NoopController;
    impl crate::attachment::PortController for NoopController {
        fn close_port(&self, _name: PortName) {}
    }

    #[test]
    fn test_take_attachments() {
        let mut msg = Message::new(1, 2, 0, HeaderFlags::default());
        msg.write_port(ScopedPort::new(port_name(4), Arc::new(NoopController)));

        let mut attachments = msg.take_attachments();
        assert_eq!(msg.num_ports(), 0);
        assert_eq!(attachments.take_ports().len(), 1);
    }

    #[cfg(not(any(windows, target_vendor = "apple")))]
    #[test]
    fn test_no_relayed_attachments() {
        let msg = Message::new(1, 2, 0, HeaderFlags::default());
        assert_eq!(msg.num_relayed_attachments(), 0);
    }
}
