use std::cmp::min;
use std::sync::Arc;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::attachment::{FileHandle, ScopedPort};
#[cfg(target_vendor = "apple")]
use crate::attachment::MachSendRight;
use crate::config::ChannelConfig;
use crate::header_flags::HeaderFlags;
use crate::message::Message;
use crate::message_buffer::MessageBuffer;
use crate::message_header::MsgId;
use crate::util::SafeCast;


/// This trait decouples the transport of messages from their handling once they are received.
///
/// It is passed around as an `Arc<dyn ...>` to minimize dependencies of [Transport] implementations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Sync + Send + 'static {
    async fn on_message(&self, msg: Message);
}

#[async_trait]
pub trait Transport: Sync + Send {
    /// Sends a message with its attachments. Ownership of the attachments passes to the receiver.
    async fn send(&self, msg: Message) -> anyhow::Result<()>;

    /// Receives messages and passes them to `handler` until the loop is cancelled or the peer
    ///  closes the channel. An error means the channel is corrupted.
    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()>;

    fn cancel_recv_loop(&self);
}


/// The attachments of a single message, relayed next to the byte stream
struct Relayed {
    handles: Vec<FileHandle>,
    ports: Vec<ScopedPort>,
    #[cfg(target_vendor = "apple")]
    send_rights: Vec<MachSendRight>,
}

struct Receivers {
    bytes: mpsc::UnboundedReceiver<Bytes>,
    attachments: mpsc::UnboundedReceiver<Relayed>,
    cancel: broadcast::Receiver<()>,
}

/// One end of a channel between two parties in the same process. Messages travel as a chunked
///  byte stream with no regard for message boundaries, the way they would through a pipe, while
///  their attachments are passed on a separate channel in message order.
pub struct InProcessTransport {
    config: Arc<ChannelConfig>,
    peer_bytes: mpsc::UnboundedSender<Bytes>,
    peer_attachments: mpsc::UnboundedSender<Relayed>,
    receivers: Mutex<Option<Receivers>>,
    cancel_sender: broadcast::Sender<()>,
}

impl InProcessTransport {
    pub fn pair(config: ChannelConfig) -> anyhow::Result<(InProcessTransport, InProcessTransport)> {
        config.validate()?;
        let config = Arc::new(config);

        let (bytes_a, bytes_rx_a) = mpsc::unbounded_channel();
        let (attachments_a, attachments_rx_a) = mpsc::unbounded_channel();
        let (bytes_b, bytes_rx_b) = mpsc::unbounded_channel();
        let (attachments_b, attachments_rx_b) = mpsc::unbounded_channel();

        let a = InProcessTransport::new(config.clone(), bytes_b, attachments_b, bytes_rx_a, attachments_rx_a);
        let b = InProcessTransport::new(config, bytes_a, attachments_a, bytes_rx_b, attachments_rx_b);
        Ok((a, b))
    }

    fn new(
        config: Arc<ChannelConfig>,
        peer_bytes: mpsc::UnboundedSender<Bytes>,
        peer_attachments: mpsc::UnboundedSender<Relayed>,
        bytes: mpsc::UnboundedReceiver<Bytes>,
        attachments: mpsc::UnboundedReceiver<Relayed>,
    ) -> InProcessTransport {
        let (cancel_sender, cancel) = broadcast::channel(1);
        InProcessTransport {
            config,
            peer_bytes,
            peer_attachments,
            receivers: Mutex::new(Some(Receivers { bytes, attachments, cancel })),
            cancel_sender,
        }
    }

    /// creates a message with this channel's default payload capacity
    pub fn new_message(&self, routing_id: i32, msg_type: MsgId, flags: HeaderFlags) -> Message {
        Message::new(routing_id, msg_type, self.config.default_segment_capacity, flags)
    }

    fn attach(msg: &mut Message, mut relayed: Relayed) -> anyhow::Result<()> {
        let expected_handles: usize = msg.header().num_handles.safe_cast();
        if relayed.handles.len() != expected_handles {
            bail!("message announces {} file handles, but {} were relayed", expected_handles, relayed.handles.len());
        }
        msg.set_attached_file_handles(std::mem::take(&mut relayed.handles));
        msg.set_attached_ports(std::mem::take(&mut relayed.ports));

        #[cfg(target_vendor = "apple")]
        {
            let expected_send_rights: usize = msg.header().num_send_rights.safe_cast();
            if relayed.send_rights.len() != expected_send_rights {
                bail!("message announces {} send rights, but {} were relayed", expected_send_rights, relayed.send_rights.len());
            }
            msg.set_attached_send_rights(std::mem::take(&mut relayed.send_rights));
        }
        Ok(())
    }

    async fn do_recv_loop(receivers: &mut Receivers, handler: &dyn MessageHandler, max_message_size: u32) -> anyhow::Result<()> {
        let mut buffer = MessageBuffer::new(max_message_size);

        loop {
            tokio::select! {
                biased;
                chunk = receivers.bytes.recv() => {
                    let Some(chunk) = chunk else {
                        info!("peer closed the channel");
                        return Ok(());
                    };
                    trace!("received chunk of {} bytes", chunk.len());

                    buffer.extend(&chunk);
                    while let Some(mut msg) = buffer.try_next()? {
                        let relayed = receivers.attachments.recv().await
                            .ok_or_else(|| anyhow!("attachment channel closed before message {:?}", msg))?;
                        Self::attach(&mut msg, relayed)?;

                        debug!("received {:?}", msg);
                        handler.on_message(msg).await;
                    }
                }
                _ = receivers.cancel.recv() => {
                    info!("shutting down receive loop");
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send(&self, mut msg: Message) -> anyhow::Result<()> {
        if msg.size() > self.config.max_message_size.safe_cast() {
            bail!("message of {} bytes exceeds the max message size of {} bytes", msg.size(), self.config.max_message_size);
        }

        let mut attachments = msg.take_attachments();
        let handles = attachments.take_handles();
        let expected_handles: usize = msg.header().num_handles.safe_cast();
        if handles.len() != expected_handles {
            bail!("message announces {} file handles, but holds {}", expected_handles, handles.len());
        }
        #[cfg(target_vendor = "apple")]
        let send_rights = attachments.take_send_rights();
        #[cfg(target_vendor = "apple")]
        {
            let expected_send_rights: usize = msg.header().num_send_rights.safe_cast();
            if send_rights.len() != expected_send_rights {
                bail!("message announces {} send rights, but holds {}", expected_send_rights, send_rights.len());
            }
        }
        let relayed = Relayed {
            handles,
            ports: attachments.take_ports(),
            #[cfg(target_vendor = "apple")]
            send_rights,
        };

        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        trace!("sending {:?}", msg);

        // attachments go first so they are available when the last chunk of the message arrives
        self.peer_attachments.send(relayed)
            .map_err(|_| anyhow!("peer closed the channel"))?;

        let mut buf = buf.freeze();
        while !buf.is_empty() {
            let chunk = buf.split_to(min(buf.len(), self.config.max_chunk_len));
            self.peer_bytes.send(chunk)
                .map_err(|_| anyhow!("peer closed the channel"))?;
        }
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let Some(mut receivers) = self.receivers.lock().await.take() else {
            bail!("the receive loop was started already");
        };

        match Self::do_recv_loop(&mut receivers, handler.as_ref(), self.config.max_message_size).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("channel is corrupted: {}", e);
                Err(e)
            }
        }
    }

    fn cancel_recv_loop(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error canceling receive loop");
        }
    }
}
