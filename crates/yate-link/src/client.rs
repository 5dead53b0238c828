use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::codec::{Command, ExtCodec};
use crate::{Error, Message};

/// What a message handler decided to do with a dispatched message.
pub enum HandlerVerdict {
    /// Answer right away with the (possibly updated) message.
    Answer { message: Message, processed: bool },
    /// The handler took ownership of the message and will answer later
    /// through [`Client::answer`], usually from a spawned task.
    Deferred,
}

type MessageHandler = Box<dyn Fn(Message) -> HandlerVerdict + Send + Sync>;

struct ClientInner {
    tx: mpsc::UnboundedSender<Command>,
    handlers: Mutex<HashMap<String, MessageHandler>>,
    pending_installs: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    pending_setlocals: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

/// Handle for talking to the switch. Cloning is cheap; all clones feed the
/// same [`Connection`], which writes outbound commands in submission order.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Drives the underlying stream. Must be polled (typically via
/// `tokio::spawn`) for the [`Client`] to make progress.
pub struct Connection<S> {
    framed: Framed<S, ExtCodec>,
    rx: mpsc::UnboundedReceiver<Command>,
    inner: Arc<ClientInner>,
}

/// Performs the `connect` handshake on `stream` and returns the client
/// handle together with the connection future driving it.
pub async fn connect<S>(stream: S, role: &str) -> Result<(Client, Connection<S>), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, ExtCodec);
    framed
        .send(Command::Connect {
            role: role.to_string(),
        })
        .await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let inner = Arc::new(ClientInner {
        tx,
        handlers: Mutex::new(HashMap::new()),
        pending_installs: Mutex::new(HashMap::new()),
        pending_setlocals: Mutex::new(HashMap::new()),
    });
    let client = Client {
        inner: inner.clone(),
    };
    Ok((client, Connection { framed, rx, inner }))
}

impl Client {
    /// Registers `handler` for messages named `name` and installs it on the
    /// switch at `priority`, awaiting the switch's confirmation.
    ///
    /// Handlers run on the connection task and must not block or await.
    pub async fn install<H>(&self, name: &str, priority: u32, handler: H) -> Result<(), Error>
    where
        H: Fn(Message) -> HandlerVerdict + Send + Sync + 'static,
    {
        let (confirm_tx, confirm_rx) = oneshot::channel();
        self.inner
            .handlers
            .lock()
            .unwrap()
            .insert(name.to_string(), Box::new(handler));
        self.inner
            .pending_installs
            .lock()
            .unwrap()
            .insert(name.to_string(), confirm_tx);
        self.inner
            .tx
            .send(Command::Install {
                priority: Some(priority),
                name: name.to_string(),
            })
            .map_err(|_| Error::ConnectionLost)?;

        match confirm_rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::InstallRejected(name.to_string())),
            Err(_) => Err(Error::ConnectionLost),
        }
    }

    /// Sets a connection-local parameter and awaits the acknowledgement.
    pub async fn setlocal(&self, name: &str, value: &str) -> Result<(), Error> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .pending_setlocals
            .lock()
            .unwrap()
            .insert(name.to_string(), ack_tx);
        self.inner
            .tx
            .send(Command::SetLocal {
                name: name.to_string(),
                value: value.to_string(),
            })
            .map_err(|_| Error::ConnectionLost)?;

        match ack_rx.await {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::ConnectionLost),
        }
    }

    /// Answers a previously dispatched message. Replies are written in call
    /// order; a reply racing connection teardown is dropped silently, the
    /// switch times the leg out on its own.
    pub fn answer(&self, message: Message, processed: bool) {
        let reply = Command::MessageReply(message.into_reply(processed));
        if self.inner.tx.send(reply).is_err() {
            tracing::debug!("switch connection is gone, dropping reply");
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs the connection until the transport drops (an error) or every
    /// [`Client`] handle has been released (clean end).
    pub async fn run(mut self) -> Result<(), Error> {
        loop {
            tokio::select! {
                frame = self.framed.next() => match frame {
                    None => return Err(Error::ConnectionLost),
                    Some(Err(err)) => return Err(err),
                    Some(Ok(command)) => self.handle_incoming(command).await?,
                },
                outbound = self.rx.recv() => match outbound {
                    Some(command) => self.framed.send(command).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    async fn handle_incoming(&mut self, command: Command) -> Result<(), Error> {
        match command {
            Command::Message(message) => {
                let verdict = {
                    let handlers = self.inner.handlers.lock().unwrap();
                    match handlers.get(&message.name) {
                        Some(handler) => handler(message),
                        None => HandlerVerdict::Answer {
                            message,
                            processed: false,
                        },
                    }
                };
                if let HandlerVerdict::Answer { message, processed } = verdict {
                    self.framed
                        .send(Command::MessageReply(message.into_reply(processed)))
                        .await?;
                }
            }
            Command::InstallReply { name, success, .. } => {
                if let Some(tx) = self.inner.pending_installs.lock().unwrap().remove(&name) {
                    let _ = tx.send(success);
                }
            }
            Command::SetLocalReply { name, success, .. } => {
                if let Some(tx) = self.inner.pending_setlocals.lock().unwrap().remove(&name) {
                    let _ = tx.send(success);
                }
            }
            other => {
                tracing::debug!(?other, "ignoring unexpected command from switch");
            }
        }
        Ok(())
    }
}
