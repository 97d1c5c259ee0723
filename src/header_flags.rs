use anyhow::bail;
use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// How deeply a message may nest inside a pending synchronous call on the receiving side. A
///  message that must be dispatched while its receiver is blocked on a sync call needs a level
///  above `NotNested`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum NestedLevel {
    NotNested = 1,
    NestedInsideSync = 2,
    NestedInsideCpow = 3,
}

/// Scheduling priority on the receiving side. This never changes the order on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum Priority {
    Normal = 0,
    Input = 1,
    Vsync = 2,
    MediumHigh = 3,
    Control = 4,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Compression {
    None,
    Enabled,
    All,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CallKind {
    Sync,
    Async,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConstructorKind {
    NotConstructor,
    Constructor,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ReplyKind {
    NotReply,
    Reply,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LazySend {
    Eager,
    Lazy,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    struct RawFlags: u32 {
        const NESTED_MASK = 0x0003;
        const PRIO_MASK = 0x001C;
        const SYNC = 0x0020;
        const REPLY = 0x0040;
        const REPLY_ERROR = 0x0080;
        const LAZY_SEND = 0x0100;
        const COMPRESS = 0x0200;
        const COMPRESS_ALL = 0x0400;
        const CONSTRUCTOR = 0x0800;
        const RELAY = 0x1000;
    }
}

const PRIO_SHIFT: u32 = 2;

/// Control flags of a message, packed into a single `u32` on the wire:
///
/// ```ascii
/// bit 0-1:  nested level (1..=3)
/// bit 2-4:  priority (0..=4)
/// bit 5:    sync
/// bit 6:    reply
/// bit 7:    reply error (only together with 'reply')
/// bit 8:    lazy send
/// bit 9:    compression enabled
/// bit 10:   compress all (never together with bit 9)
/// bit 11:   constructor
/// bit 12:   relay
/// ```
///
/// Flags are fixed once a message is constructed. The only way to change them is through the
///  crate-private setters used while building replies and relaying messages.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct HeaderFlags {
    bits: RawFlags,
}

impl Default for HeaderFlags {
    fn default() -> Self {
        HeaderFlags::from(NestedLevel::NotNested)
    }
}

impl From<NestedLevel> for HeaderFlags {
    fn from(level: NestedLevel) -> Self {
        HeaderFlags {
            bits: RawFlags::from_bits_retain(level.into()),
        }
    }
}

impl std::fmt::Debug for HeaderFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderFlags")
            .field("level", &self.level())
            .field("priority", &self.priority())
            .field("compression", &self.compression())
            .field("sync", &self.is_sync())
            .field("reply", &self.is_reply())
            .field("reply_error", &self.is_reply_error())
            .field("lazy_send", &self.is_lazy_send())
            .field("constructor", &self.is_constructor())
            .field("relay", &self.is_relay())
            .finish()
    }
}

impl HeaderFlags {
    pub fn new(
        level: NestedLevel,
        priority: Priority,
        compression: Compression,
        lazy_send: LazySend,
        constructor: ConstructorKind,
        sync: CallKind,
        reply: ReplyKind,
    ) -> HeaderFlags {
        let mut bits = RawFlags::from_bits_retain(u32::from(level) | (u32::from(priority) << PRIO_SHIFT));

        match compression {
            Compression::None => {}
            Compression::Enabled => bits |= RawFlags::COMPRESS,
            Compression::All => bits |= RawFlags::COMPRESS_ALL,
        }
        bits.set(RawFlags::LAZY_SEND, lazy_send == LazySend::Lazy);
        bits.set(RawFlags::CONSTRUCTOR, constructor == ConstructorKind::Constructor);
        bits.set(RawFlags::SYNC, sync == CallKind::Sync);
        bits.set(RawFlags::REPLY, reply == ReplyKind::Reply);

        HeaderFlags { bits }
    }

    /// Decodes a flags word as received from a peer, rejecting bit patterns that no valid
    ///  sender produces.
    pub fn from_bits(raw: u32) -> anyhow::Result<HeaderFlags> {
        let Some(bits) = RawFlags::from_bits(raw) else {
            bail!("unknown header flag bits in {:#06x}", raw);
        };

        if NestedLevel::try_from((bits & RawFlags::NESTED_MASK).bits()).is_err() {
            bail!("invalid nested level in header flags {:#06x}", raw);
        }
        if Priority::try_from((bits & RawFlags::PRIO_MASK).bits() >> PRIO_SHIFT).is_err() {
            bail!("invalid priority in header flags {:#06x}", raw);
        }
        if bits.contains(RawFlags::COMPRESS | RawFlags::COMPRESS_ALL) {
            bail!("conflicting compression bits in header flags {:#06x}", raw);
        }

        Ok(HeaderFlags { bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits.bits()
    }

    pub fn level(&self) -> NestedLevel {
        NestedLevel::try_from((self.bits & RawFlags::NESTED_MASK).bits())
            .expect("this is a bug: nested level is validated on construction")
    }

    pub fn priority(&self) -> Priority {
        Priority::try_from((self.bits & RawFlags::PRIO_MASK).bits() >> PRIO_SHIFT)
            .expect("this is a bug: priority is validated on construction")
    }

    pub fn compression(&self) -> Compression {
        if self.bits.contains(RawFlags::COMPRESS) {
            Compression::Enabled
        }
        else if self.bits.contains(RawFlags::COMPRESS_ALL) {
            Compression::All
        }
        else {
            Compression::None
        }
    }

    pub fn is_lazy_send(&self) -> bool {
        self.bits.contains(RawFlags::LAZY_SEND)
    }

    pub fn is_constructor(&self) -> bool {
        self.bits.contains(RawFlags::CONSTRUCTOR)
    }

    pub fn is_sync(&self) -> bool {
        self.bits.contains(RawFlags::SYNC)
    }

    pub fn is_reply(&self) -> bool {
        self.bits.contains(RawFlags::REPLY)
    }

    /// NB: only meaningful for replies
    pub fn is_reply_error(&self) -> bool {
        self.bits.contains(RawFlags::REPLY_ERROR)
    }

    pub fn is_relay(&self) -> bool {
        self.bits.contains(RawFlags::RELAY)
    }

    pub(crate) fn set_constructor(&mut self) {
        self.bits |= RawFlags::CONSTRUCTOR;
    }

    pub(crate) fn set_sync(&mut self) {
        self.bits |= RawFlags::SYNC;
    }

    pub(crate) fn set_reply(&mut self) {
        self.bits |= RawFlags::REPLY;
    }

    /// A reply error is always a reply, so this sets both bits
    pub(crate) fn set_reply_error(&mut self) {
        self.bits |= RawFlags::REPLY | RawFlags::REPLY_ERROR;
    }

    pub(crate) fn set_relay(&mut self, relay: bool) {
        self.bits.set(RawFlags::RELAY, relay);
    }
}
