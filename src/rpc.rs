use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, warn};

use crate::key::Key;
use crate::message::{CodecError, Message, MessageType};
use crate::routing::Contact;
use crate::{MESSAGE_LEN, SEND_RETRY_BACKOFF};

#[derive(Debug, thiserror::Error)]
#[error("can't bind udp socket: {0}")]
pub struct InitRpcError(#[from] std::io::Error);

#[derive(Debug, thiserror::Error)]
#[error("can't send message: {0}")]
pub struct SendMessageError(#[from] CodecError);

/// Datagram send abstraction. A successful send does not imply delivery.
#[async_trait]
pub(crate) trait Messenger: Send + Sync {
    async fn send(&self, to: SocketAddr, msg: &Message) -> Result<(), SendMessageError>;
}

pub(crate) struct UdpMessenger {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl Messenger for UdpMessenger {
    async fn send(&self, to: SocketAddr, msg: &Message) -> Result<(), SendMessageError> {
        let datagram = msg.encode()?;

        // Write failures under contention are retryable; keep trying.
        while let Err(err) = self.socket.send_to(&datagram, to).await {
            warn!("datagram write to {to} failed, retrying: {err}");
            time::sleep(SEND_RETRY_BACKOFF).await;
        }

        debug!("| OUT | {:?} ==> {}", msg.msg_type, to);
        Ok(())
    }
}

/// Capturing in-memory transport for tests.
#[cfg(test)]
pub(crate) struct MockMessenger {
    pub sent: Mutex<Vec<(SocketAddr, Message)>>,
}

#[cfg(test)]
impl MockMessenger {
    pub fn new() -> Arc<MockMessenger> {
        Arc::new(MockMessenger {
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn last(&self) -> Option<(SocketAddr, Message)> {
        self.sent.lock().unwrap().last().cloned()
    }
}

#[cfg(test)]
#[async_trait]
impl Messenger for MockMessenger {
    async fn send(&self, to: SocketAddr, msg: &Message) -> Result<(), SendMessageError> {
        msg.encode()?;
        self.sent.lock().unwrap().push((to, msg.clone()));
        Ok(())
    }
}

/// Request/response RPC over the stateless datagram channel.
///
/// Outbound requests register a single-shot slot under a fresh rpc id;
/// inbound responses consume the slot, or a deadline does. The registry
/// mutex guards only map mutation, never a wait.
pub(crate) struct Rpc {
    local: Contact,
    listen_port: u16,
    messenger: Arc<dyn Messenger>,
    pending: Mutex<HashMap<Key, oneshot::Sender<Message>>>,
    inbound: mpsc::Sender<Message>,
    timeout: Duration,
}

impl Rpc {
    /// Binds the datagram endpoint and starts the listener task.
    pub async fn bind(
        addr: SocketAddr,
        id: Key,
        inbound: mpsc::Sender<Message>,
        timeout: Duration,
    ) -> Result<Arc<Rpc>, InitRpcError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;

        let rpc = Arc::new(Rpc {
            local: Contact::new(id, local_addr),
            listen_port: local_addr.port(),
            messenger: Arc::new(UdpMessenger {
                socket: socket.clone(),
            }),
            pending: Mutex::new(HashMap::new()),
            inbound,
            timeout,
        });

        let listener = rpc.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; MESSAGE_LEN];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => listener.process_datagram(&buf[..len], src).await,
                    Err(err) => {
                        error!("failed to receive datagram from the socket: {err}");
                    }
                }
            }
        });

        Ok(rpc)
    }

    #[cfg(test)]
    pub fn with_messenger(
        id: Key,
        listen_port: u16,
        messenger: Arc<dyn Messenger>,
        inbound: mpsc::Sender<Message>,
        timeout: Duration,
    ) -> Arc<Rpc> {
        use std::net::{IpAddr, Ipv4Addr};

        Arc::new(Rpc {
            local: Contact::new(
                id,
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listen_port),
            ),
            listen_port,
            messenger,
            pending: Mutex::new(HashMap::new()),
            inbound,
            timeout,
        })
    }

    pub fn local_contact(&self) -> &Contact {
        &self.local
    }

    /// Decodes one message per datagram and hands it to the dispatcher.
    ///
    /// The IP observed on the wire overrides whatever the sender
    /// self-reported; the port becomes the well-known listen port.
    async fn process_datagram(&self, datagram: &[u8], src: SocketAddr) {
        let mut msg = match Message::decode(datagram) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("message received, but cannot be parsed: {err}");
                return;
            }
        };
        msg.sender.addr = SocketAddr::new(src.ip(), self.listen_port);

        debug!("|  IN | {:?} <== {}", msg.msg_type, msg.sender);

        if self.inbound.send(msg).await.is_err() {
            debug!("inbound channel closed, dropping message");
        }
    }

    /// Sends a request and waits for its response.
    ///
    /// Returns the matching response, or a synthetic
    /// [Timeout](MessageType::Timeout) message once the deadline passes.
    /// Exactly one of the two consumes the pending slot.
    pub async fn send_and_await(&self, dst: SocketAddr, mut msg: Message) -> Message {
        let (tx, mut rx) = oneshot::channel();

        let rpc_id = {
            let mut pending = self.pending.lock().unwrap();
            let mut rpc_id = Key::random();
            while pending.contains_key(&rpc_id) {
                rpc_id = Key::random();
            }
            pending.insert(rpc_id, tx);
            rpc_id
        };

        msg.rpc_id = rpc_id;
        msg.sender = self.local.clone();

        if let Err(err) = self.messenger.send(dst, &msg).await {
            error!("request send error: {err}");
            self.pending.lock().unwrap().remove(&rpc_id);
            return Rpc::timed_out(rpc_id);
        }

        match time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Rpc::timed_out(rpc_id),
            Err(_) => {
                let removed = self.pending.lock().unwrap().remove(&rpc_id).is_some();
                if removed {
                    debug!("request {rpc_id} timed out");
                    Rpc::timed_out(rpc_id)
                } else {
                    // The deadline raced a delivery that already claimed
                    // the slot; the response is on the channel.
                    rx.await.unwrap_or_else(|_| Rpc::timed_out(rpc_id))
                }
            }
        }
    }

    /// Passes a response to the request waiting on its rpc id.
    pub fn deliver_response(&self, msg: Message) {
        let slot = self.pending.lock().unwrap().remove(&msg.rpc_id);
        match slot {
            Some(tx) => {
                _ = tx.send(msg);
            }
            None => debug!("unsolicited reply received, ignoring"),
        }
    }

    /// Fire-and-forget send with a fresh rpc id. Any response arrives
    /// without a pending slot and is dropped by [deliver_response].
    pub async fn send(&self, dst: SocketAddr, mut msg: Message) -> Result<(), SendMessageError> {
        msg.rpc_id = Key::random();
        msg.sender = self.local.clone();
        self.messenger.send(dst, &msg).await
    }

    /// Sends a reply, preserving the request's rpc id.
    pub async fn respond(&self, dst: SocketAddr, mut msg: Message) -> Result<(), SendMessageError> {
        msg.sender = self.local.clone();
        self.messenger.send(dst, &msg).await
    }

    fn timed_out(rpc_id: Key) -> Message {
        let mut msg = Message::new(MessageType::Timeout);
        msg.rpc_id = rpc_id;
        msg
    }
}
