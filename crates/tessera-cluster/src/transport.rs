//! Request/reply transport seam.
//!
//! The runtime only depends on the [`Transport`] trait; [`Mesh`] is the
//! in-process implementation used by tests and single-process clusters.
//! Every node owns an inbox of [`Envelope`]s and replies through the
//! sender carried inside each envelope.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::error::{ClusterError, Result};
use crate::proto::{NodeId, Request, Response};

/// One in-flight request as seen by the serving node.
pub struct Envelope {
    pub from: NodeId,
    pub req: Request,
    pub reply: Sender<Response>,
}

impl Envelope {
    /// Sends the reply; the caller may have stopped waiting, which is fine.
    pub fn respond(self, resp: Response) {
        let _ = self.reply.send(resp);
    }
}

/// Future-like handle for a pending reply.
pub struct ReplyHandle {
    peer: NodeId,
    rx: Receiver<Response>,
}

impl ReplyHandle {
    /// Blocks until the peer replies. Remote-side failures come back as
    /// [`ClusterError::Remote`]; a dropped peer as [`ClusterError::Transport`].
    pub fn wait(self) -> Result<Response> {
        match self.rx.recv() {
            Ok(Response::Error(message)) => Err(ClusterError::Remote(message)),
            Ok(resp) => Ok(resp),
            Err(_) => Err(ClusterError::Transport(format!(
                "{} closed before replying",
                self.peer
            ))),
        }
    }

    /// Waits for a plain acknowledgement.
    pub fn wait_ack(self) -> Result<()> {
        match self.wait()? {
            Response::Ack => Ok(()),
            other => Err(ClusterError::Protocol(format!(
                "expected ack, got {other:?}"
            ))),
        }
    }
}

/// Request/reply RPC with per-peer addressing and worker broadcast.
pub trait Transport: Send + Sync {
    fn node(&self) -> NodeId;

    fn call(&self, peer: NodeId, req: Request) -> Result<ReplyHandle>;

    /// Currently reachable worker peers, in id order.
    fn workers(&self) -> Vec<NodeId>;

    /// Sends `req` to every reachable worker and returns the reply handles.
    fn broadcast(&self, req: Request) -> Result<Vec<(NodeId, ReplyHandle)>> {
        let mut handles = Vec::new();
        for peer in self.workers() {
            handles.push((peer, self.call(peer, req.clone())?));
        }
        Ok(handles)
    }
}

/// In-process transport: a routing table of node inboxes.
pub struct Mesh {
    inboxes: RwLock<HashMap<NodeId, Sender<Envelope>>>,
    dead: RwLock<HashSet<NodeId>>,
    calls: Mutex<HashMap<&'static str, u64>>,
}

impl Mesh {
    pub fn new() -> Arc<Mesh> {
        Arc::new(Mesh {
            inboxes: RwLock::new(HashMap::new()),
            dead: RwLock::new(HashSet::new()),
            calls: Mutex::new(HashMap::new()),
        })
    }

    /// Joins `node` to the mesh, returning its endpoint and inbox.
    pub fn join(self: &Arc<Self>, node: NodeId) -> (Endpoint, Receiver<Envelope>) {
        let (tx, rx) = unbounded();
        self.inboxes.write().insert(node, tx);
        (
            Endpoint {
                mesh: Arc::clone(self),
                node,
            },
            rx,
        )
    }

    /// Severs a node both ways, as a crashed process would be: its inbox is
    /// dropped and any further call from or to it fails.
    pub fn disconnect(&self, node: NodeId) {
        self.inboxes.write().remove(&node);
        self.dead.write().insert(node);
    }

    /// Number of calls issued for a given method name, across all nodes.
    pub fn call_count(&self, method: &str) -> u64 {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }

    fn route(&self, from: NodeId, peer: NodeId, req: Request) -> Result<ReplyHandle> {
        if self.dead.read().contains(&from) {
            return Err(ClusterError::Transport(format!("{from} is disconnected")));
        }
        *self.calls.lock().entry(req.method()).or_insert(0) += 1;

        let inbox = self
            .inboxes
            .read()
            .get(&peer)
            .cloned()
            .ok_or(ClusterError::PeerUnavailable(peer))?;
        let (reply_tx, reply_rx) = bounded(1);
        inbox
            .send(Envelope {
                from,
                req,
                reply: reply_tx,
            })
            .map_err(|_| ClusterError::PeerUnavailable(peer))?;
        Ok(ReplyHandle {
            peer,
            rx: reply_rx,
        })
    }
}

/// One node's view of a [`Mesh`].
#[derive(Clone)]
pub struct Endpoint {
    mesh: Arc<Mesh>,
    node: NodeId,
}

impl Transport for Endpoint {
    fn node(&self) -> NodeId {
        self.node
    }

    fn call(&self, peer: NodeId, req: Request) -> Result<ReplyHandle> {
        self.mesh.route(self.node, peer, req)
    }

    fn workers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .mesh
            .inboxes
            .read()
            .keys()
            .filter(|n| !n.is_master())
            .copied()
            .collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Ping;

    #[test]
    fn call_and_reply() {
        let mesh = Mesh::new();
        let (client, _inbox) = mesh.join(NodeId::MASTER);
        let (_server, server_inbox) = mesh.join(NodeId::worker(0));

        let handle = client
            .call(NodeId::worker(0), Request::Ping(Ping { worker: NodeId::worker(0) }))
            .unwrap();
        let env = server_inbox.recv().unwrap();
        assert_eq!(env.from, NodeId::MASTER);
        env.respond(Response::Ack);
        handle.wait_ack().unwrap();
        assert_eq!(mesh.call_count("ping"), 1);
    }

    #[test]
    fn disconnected_peer_is_unreachable() {
        let mesh = Mesh::new();
        let (client, _inbox) = mesh.join(NodeId::MASTER);
        let (_server, _server_inbox) = mesh.join(NodeId::worker(1));
        mesh.disconnect(NodeId::worker(1));

        let err = client.call(NodeId::worker(1), Request::Flush).unwrap_err();
        assert!(matches!(err, ClusterError::PeerUnavailable(_)));
    }

    #[test]
    fn disconnected_node_cannot_send() {
        let mesh = Mesh::new();
        let (client, _inbox) = mesh.join(NodeId::worker(0));
        let (_m, _master_inbox) = mesh.join(NodeId::MASTER);
        mesh.disconnect(NodeId::worker(0));

        let err = client.call(NodeId::MASTER, Request::Flush).unwrap_err();
        assert!(matches!(err, ClusterError::Transport(_)));
    }

    #[test]
    fn broadcast_reaches_every_worker() {
        let mesh = Mesh::new();
        let (master, _inbox) = mesh.join(NodeId::MASTER);
        let (_a, rx_a) = mesh.join(NodeId::worker(0));
        let (_b, rx_b) = mesh.join(NodeId::worker(1));

        let handles = master.broadcast(Request::Flush).unwrap();
        assert_eq!(handles.len(), 2);
        rx_a.recv().unwrap().respond(Response::Ack);
        rx_b.recv().unwrap().respond(Response::Ack);
        for (_, h) in handles {
            h.wait_ack().unwrap();
        }
    }
}
