//! Kernel channel sockets, each owned by its own task
//!
//! ```text
//!   Channel::send ──► commands ──┐
//!                                ▼
//!                       ┌─────────────────┐        ┌────────────┐
//!                       │   socket task   │◄──────►│   kernel   │
//!                       └────────┬────────┘        └────────────┘
//!                                │ inbox (unbounded)
//!   Channel::recv ◄──────────────┘
//!                                ▲
//!                   supervisor ──┘ reports a panicked socket task
//! ```
//!
//! zeromq's `recv` on DEALER and SUB sockets panics when a peer stream
//! fails. The panic ends the socket task only; the next `recv` on the
//! channel returns `KernelError::Channel`.

use std::any::Any;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tracing::{debug, warn};
use zeromq::{DealerSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqError, ZmqMessage, ZmqResult};

use super::KernelError;

/// Outstanding sends per channel
const COMMAND_CAPACITY: usize = 16;

/// What the socket task needs from a zeromq socket
#[async_trait]
pub trait ChannelSocket: Sized + Send + 'static {
    async fn recv_message(&mut self) -> ZmqResult<ZmqMessage>;
    async fn send_message(&mut self, message: ZmqMessage) -> ZmqResult<()>;
    async fn close_socket(self) -> Vec<ZmqError>;
}

#[async_trait]
impl ChannelSocket for DealerSocket {
    async fn recv_message(&mut self) -> ZmqResult<ZmqMessage> {
        self.recv().await
    }

    async fn send_message(&mut self, message: ZmqMessage) -> ZmqResult<()> {
        self.send(message).await
    }

    async fn close_socket(self) -> Vec<ZmqError> {
        self.close().await
    }
}

#[async_trait]
impl ChannelSocket for SubSocket {
    async fn recv_message(&mut self) -> ZmqResult<ZmqMessage> {
        self.recv().await
    }

    async fn send_message(&mut self, _message: ZmqMessage) -> ZmqResult<()> {
        Err(ZmqError::Socket("SUB sockets are receive-only"))
    }

    async fn close_socket(self) -> Vec<ZmqError> {
        self.close().await
    }
}

enum Command {
    Send(ZmqMessage, oneshot::Sender<ZmqResult<()>>),
    Close(oneshot::Sender<Vec<ZmqError>>),
}

enum Next {
    Command(Option<Command>),
    Received(ZmqResult<ZmqMessage>),
}

/// Handle to one socket task
///
/// `recv` is cancel-safe: a message that arrives after the caller gave up
/// waiting stays in the inbox for the next call.
pub struct Channel {
    name: &'static str,
    commands: mpsc::Sender<Command>,
    inbox: mpsc::UnboundedReceiver<Result<ZmqMessage, String>>,
}

impl Channel {
    /// Move `socket` into a new task
    pub fn spawn<S: ChannelSocket>(name: &'static str, socket: S) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (inbox_tx, inbox) = mpsc::unbounded_channel();

        let socket_task = tokio::spawn(run_socket(socket, command_rx, inbox_tx.clone()));
        tokio::spawn(async move {
            if let Err(e) = socket_task.await {
                let reason = failure_reason(e);
                warn!(channel = name, reason = %reason, "Channel socket task failed");
                let _ = inbox_tx.send(Err(format!("socket task failed: {}", reason)));
            }
        });

        Self {
            name,
            commands,
            inbox,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn send(&self, message: ZmqMessage) -> Result<(), KernelError> {
        let (reply, sent) = oneshot::channel();
        self.commands
            .send(Command::Send(message, reply))
            .await
            .map_err(|_| self.stopped())?;
        sent.await
            .map_err(|_| self.stopped())?
            .map_err(|e| KernelError::Channel(format!("{}: {}", self.name, e)))
    }

    /// Next message from the kernel
    pub async fn recv(&mut self) -> Result<ZmqMessage, KernelError> {
        match self.inbox.recv().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => Err(KernelError::Channel(format!("{}: {}", self.name, e))),
            None => Err(self.stopped()),
        }
    }

    /// Stop the task and close the socket, returning close errors
    pub async fn close(self) -> Vec<String> {
        let (reply, closed) = oneshot::channel();
        if self.commands.send(Command::Close(reply)).await.is_err() {
            // Socket already dropped with its task
            return Vec::new();
        }
        match closed.await {
            Ok(errors) => errors.into_iter().map(|e| e.to_string()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn stopped(&self) -> KernelError {
        KernelError::Channel(format!("{} channel is closed", self.name))
    }
}

async fn run_socket<S: ChannelSocket>(
    mut socket: S,
    mut commands: mpsc::Receiver<Command>,
    inbox: mpsc::UnboundedSender<Result<ZmqMessage, String>>,
) {
    loop {
        let next = tokio::select! {
            command = commands.recv() => Next::Command(command),
            received = socket.recv_message() => Next::Received(received),
        };

        match next {
            Next::Command(Some(Command::Send(message, reply))) => {
                let _ = reply.send(socket.send_message(message).await);
            }
            Next::Command(Some(Command::Close(reply))) => {
                let _ = reply.send(socket.close_socket().await);
                return;
            }
            // Channel handle dropped
            Next::Command(None) => return,
            Next::Received(Ok(message)) => {
                if inbox.send(Ok(message)).is_err() {
                    return;
                }
            }
            Next::Received(Err(e)) => {
                debug!(error = %e, "Channel socket receive failed");
                let _ = inbox.send(Err(e.to_string()));
                return;
            }
        }
    }
}

fn failure_reason(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload: Box<dyn Any + Send> = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeromq::{Endpoint, RouterSocket};

    /// Stands in for a zeromq socket whose peer stream broke
    struct BrokenPeer;

    #[async_trait]
    impl ChannelSocket for BrokenPeer {
        async fn recv_message(&mut self) -> ZmqResult<ZmqMessage> {
            panic!("not yet implemented")
        }

        async fn send_message(&mut self, _message: ZmqMessage) -> ZmqResult<()> {
            Ok(())
        }

        async fn close_socket(self) -> Vec<ZmqError> {
            Vec::new()
        }
    }

    fn port_of(endpoint: &Endpoint) -> u16 {
        match endpoint {
            Endpoint::Tcp(_, port) => *port,
            other => panic!("expected a tcp endpoint, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_panicking_socket_becomes_channel_error() {
        let mut channel = Channel::spawn("shell", BrokenPeer);

        match channel.recv().await {
            Err(KernelError::Channel(message)) => {
                assert!(message.starts_with("shell: socket task failed: panicked"), "got {message}");
            }
            other => panic!("expected a channel error, got {other:?}"),
        }
        // The task is gone, later calls fail instead of hanging or panicking
        assert!(matches!(channel.recv().await, Err(KernelError::Channel(_))));
        assert!(matches!(
            channel.send(ZmqMessage::from("ping")).await,
            Err(KernelError::Channel(_))
        ));
        assert!(channel.close().await.is_empty());
    }

    #[tokio::test]
    async fn test_dealer_round_trip_through_task() {
        let mut router = RouterSocket::new();
        let endpoint = router.bind("tcp://127.0.0.1:0").await.unwrap();

        let mut dealer = DealerSocket::new();
        dealer
            .connect(&format!("tcp://127.0.0.1:{}", port_of(&endpoint)))
            .await
            .unwrap();
        let mut channel = Channel::spawn("shell", dealer);
        assert_eq!(channel.name(), "shell");

        channel.send(ZmqMessage::from("ping")).await.unwrap();
        let request = router.recv().await.unwrap();
        assert_eq!(request.len(), 2);
        assert_eq!(request.get(1).unwrap().as_ref(), b"ping");

        let mut reply = ZmqMessage::from("pong");
        reply.push_front(request.get(0).unwrap().clone());
        router.send(reply).await.unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), channel.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.get(0).unwrap().as_ref(), b"pong");

        assert!(channel.close().await.is_empty());
    }

    #[tokio::test]
    async fn test_sub_channel_refuses_send() {
        let channel = Channel::spawn("iopub", SubSocket::new());
        assert!(matches!(
            channel.send(ZmqMessage::from("x")).await,
            Err(KernelError::Channel(message)) if message.contains("receive-only")
        ));
    }
}
