//! The fabric abstraction — spec.md §6's RDMA verbs layer, reduced to the
//! operations the coherence handler and page provider actually call:
//! posting a message (optionally with page bytes attached) to a target
//! node's mailbox. A real implementation would back this with
//! `ibv_post_send`/`poll_cq` against RDMA-CM-negotiated queue pairs; this
//! crate ships [`LoopbackFabric`], the in-process implementation every
//! test and the `nodes=1` fast path use, and keeps the seam narrow enough
//! that dropping in a real `ibverbs` binding would only mean implementing
//! [`Fabric`], not touching `coherence::handler` or `provider`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::common::NodeId;
use crate::coherence::mailbox::{Envelope, MailboxPartition};

/// The one verb the core's message-passing logic needs: deliver an
/// envelope to `target`'s mailbox. Matches spec.md §6's one-sided WRITE
/// steady-state path — posting never blocks on the target's processing,
/// only on space in its mailbox.
pub trait Fabric: Send + Sync {
    fn post(&self, target: NodeId, envelope: Envelope);

    /// Publish `node`'s mailbox so peers can reach it. The real RDMA-CM
    /// handshake (spec.md §6) that exchanges `mb_offset`/`pl_offset` is
    /// out of scope for the core (spec.md §1); fabrics that need no such
    /// step (a real ibverbs binding reaching a directory service, say)
    /// can leave this a no-op.
    fn register(&self, _node: NodeId, _mailbox: Arc<MailboxPartition>) {}
}

/// An in-process fabric: every participating node registers its
/// [`MailboxPartition`] once (the loopback stand-in for spec.md §6's
/// handshake that exchanges `mb_offset`/`pl_offset`), and `post` looks the
/// target up and pushes directly into its channel.
#[derive(Default)]
pub struct LoopbackFabric {
    mailboxes: RwLock<HashMap<NodeId, Arc<MailboxPartition>>>,
}

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_registered(&self, node: NodeId) -> bool {
        self.mailboxes.read().unwrap().contains_key(&node)
    }
}

impl Fabric for LoopbackFabric {
    fn post(&self, target: NodeId, envelope: Envelope) {
        let mailbox = self
            .mailboxes
            .read()
            .unwrap()
            .get(&target)
            .cloned()
            .unwrap_or_else(|| panic!("fabric post to unregistered node {target}"));
        mailbox.post(envelope);
    }

    fn register(&self, node: NodeId, mailbox: Arc<MailboxPartition>) {
        self.mailboxes.write().unwrap().insert(node, mailbox);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coherence::mailbox::Envelope;
    use crate::coherence::message::{Message, MessageKind};
    use crate::common::PageId;

    #[test]
    fn post_delivers_to_registered_mailbox() {
        let fabric = LoopbackFabric::new();
        let mailbox = MailboxPartition::new();
        fabric.register(NodeId::new(1), mailbox.clone());

        let msg = Message::request(MessageKind::Prs, NodeId::new(0), PageId::new(1, 3), 0);
        fabric.post(NodeId::new(1), Envelope::response(msg));

        let received = mailbox.try_recv().unwrap();
        assert_eq!(received.message, msg);
    }

    #[test]
    #[should_panic(expected = "unregistered")]
    fn post_to_unregistered_node_panics() {
        let fabric = LoopbackFabric::new();
        let msg = Message::request(MessageKind::Prs, NodeId::new(0), PageId::new(1, 3), 0);
        fabric.post(NodeId::new(9), Envelope::response(msg));
    }

    #[test]
    fn is_registered_reports_membership() {
        let fabric = LoopbackFabric::new();
        assert!(!fabric.is_registered(NodeId::new(2)));
        fabric.register(NodeId::new(2), MailboxPartition::new());
        assert!(fabric.is_registered(NodeId::new(2)));
    }
}
