//! In-process switch simulator.
//!
//! Stands in for a real switch during tests: accepts one engine connection
//! over an in-memory duplex stream, acknowledges installs, and lets a test
//! submit messages and await the engine's final answer. A message nobody
//! installed a handler for resolves unprocessed, exactly like a switch with
//! no further modules in the chain.

use std::collections::{BTreeMap, HashMap, HashSet};

use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::codec::{Command, ExtCodec};
use crate::{unix_now, Message};

/// The switch's view of a finished message round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimReply {
    pub processed: bool,
    pub return_value: String,
    pub params: BTreeMap<String, String>,
}

enum SimOp {
    Submit {
        name: String,
        params: BTreeMap<String, String>,
        reply: oneshot::Sender<SimReply>,
    },
    WaitInstalled {
        name: String,
        ready: oneshot::Sender<()>,
    },
}

pub struct SwitchSim {
    ops: mpsc::UnboundedSender<SimOp>,
}

impl SwitchSim {
    /// Starts the simulator task. The returned stream is the engine's end of
    /// the wire; hand it to [`crate::connect`].
    pub fn start() -> (SwitchSim, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_sim(local, ops_rx));
        (SwitchSim { ops: ops_tx }, remote)
    }

    /// Submits a message and awaits the engine's answer.
    pub async fn submit(&self, name: &str, params: &[(&str, &str)]) -> SimReply {
        let params: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.submit_params(name, params).await
    }

    /// Like [`SwitchSim::submit`] with an already-built parameter map, for
    /// re-submitting parameters taken from an earlier reply.
    pub async fn submit_params(&self, name: &str, params: BTreeMap<String, String>) -> SimReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ops
            .send(SimOp::Submit {
                name: name.to_string(),
                params,
                reply: reply_tx,
            })
            .expect("simulator task has terminated");
        reply_rx.await.expect("simulator dropped a pending message")
    }

    /// Blocks until the engine has installed a handler for `name`.
    pub async fn wait_for_handler(&self, name: &str) {
        let (ready_tx, ready_rx) = oneshot::channel();
        self.ops
            .send(SimOp::WaitInstalled {
                name: name.to_string(),
                ready: ready_tx,
            })
            .expect("simulator task has terminated");
        ready_rx.await.expect("simulator dropped an install waiter");
    }
}

async fn run_sim(stream: DuplexStream, mut ops: mpsc::UnboundedReceiver<SimOp>) {
    let mut framed = Framed::new(stream, ExtCodec);
    let mut installed: HashSet<String> = HashSet::new();
    let mut pending: HashMap<String, oneshot::Sender<SimReply>> = HashMap::new();
    let mut install_waiters: Vec<(String, oneshot::Sender<()>)> = Vec::new();
    let mut next_id = 0u64;

    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                None | Some(Err(_)) => return,
                Some(Ok(command)) => match command {
                    Command::Connect { .. } => {}
                    Command::Install { priority, name } => {
                        installed.insert(name.clone());
                        let mut index = 0;
                        while index < install_waiters.len() {
                            if install_waiters[index].0 == name {
                                let (_, ready) = install_waiters.swap_remove(index);
                                let _ = ready.send(());
                            } else {
                                index += 1;
                            }
                        }
                        let confirm = Command::InstallReply {
                            priority: priority.unwrap_or(100),
                            name,
                            success: true,
                        };
                        if framed.send(confirm).await.is_err() {
                            return;
                        }
                    }
                    Command::SetLocal { name, value } => {
                        let ack = Command::SetLocalReply { name, value, success: true };
                        if framed.send(ack).await.is_err() {
                            return;
                        }
                    }
                    Command::MessageReply(reply) => {
                        if let Some(tx) = pending.remove(&reply.id) {
                            let _ = tx.send(SimReply {
                                processed: reply.processed,
                                return_value: reply.return_value,
                                params: reply.params,
                            });
                        }
                    }
                    other => {
                        tracing::debug!(?other, "simulator ignoring command");
                    }
                },
            },
            op = ops.recv() => match op {
                None => return,
                Some(SimOp::Submit { name, params, reply }) => {
                    if !installed.contains(&name) {
                        let _ = reply.send(SimReply {
                            processed: false,
                            return_value: String::new(),
                            params,
                        });
                        continue;
                    }
                    next_id += 1;
                    let id = format!("sim-{next_id}");
                    pending.insert(id.clone(), reply);
                    let message = Message {
                        id,
                        time: unix_now(),
                        name,
                        return_value: String::new(),
                        params,
                    };
                    if framed.send(Command::Message(message)).await.is_err() {
                        return;
                    }
                }
                Some(SimOp::WaitInstalled { name, ready }) => {
                    if installed.contains(&name) {
                        let _ = ready.send(());
                    } else {
                        install_waiters.push((name, ready));
                    }
                }
            },
        }
    }
}
