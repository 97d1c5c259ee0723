//! The message envelope of a multi-process IPC channel: the messages that parent and child
//!  processes exchange, and the rules for sequencing synchronous calls between them.
//!
//! On the wire, a message is a fixed-size header followed by the payload and an optional footer:
//!
//! ```ascii
//! +---------------------+------------------------------+-------------------------+
//! | header              | payload                      | footer (padded to 4)    |
//! | (32 bytes, 40 on    | (written by the sender, in   | (event_footer_size      |
//! |  Apple platforms)   |  4-byte aligned fields)      |  bytes used)            |
//! +---------------------+------------------------------+-------------------------+
//! ```
//!
//! File handles, ports and Mach send rights do not travel in the byte stream. They are relayed
//!  separately, and the payload refers to them by index.

pub mod attachment;
pub mod config;
pub mod dispatch;
pub mod header_flags;
pub mod message;
pub mod message_buffer;
pub mod message_header;
pub mod pending_queue;
pub mod sync_call;
pub mod test_util;
pub mod transport;
pub mod util;
