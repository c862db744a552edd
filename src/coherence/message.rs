//! Wire messages exchanged by the coherence handler, per spec.md §4.3 and
//! §6. Every protocol message is a fixed 32-byte record so it fits in one
//! mailbox slot and can be posted with a single RDMA WRITE (spec.md §6's
//! mailbox layout); the page bytes a response may carry travel alongside
//! the control message as a separate RDMA-written payload, never inlined
//! into the 32 bytes (see [`crate::coherence::mailbox::Envelope`]).
//!
//! Field layout mirrors the original `scalestore::rdma::messages` header
//! this protocol is modeled on: a `MESSAGE_TYPE` discriminator plus a
//! `RESULT` code on responses, a `pid`/`pVersion` pair, and (where the
//! original used `conflictingNodeId`) one auxiliary node id naming the
//! node a requester should contact next.

use crate::common::{NodeId, PageId};

pub const MESSAGE_BYTES: usize = 32;

/// The possession-transition message types spec.md §4.3 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Connection teardown marker: decrement the handler's connected-clients
    /// counter.
    Finish = 0,
    /// Possession Request, Shared — ask the current owner for a shared copy.
    Prs = 1,
    /// Possession Request, eXclusive — ask the current owner to hand over
    /// exclusive rights.
    Prx = 2,
    /// Response to PRS/PRX: carries a [`ResultCode`] and, when the result
    /// is a `WithPage*` variant, the page bytes travel in the same
    /// envelope.
    Prr = 3,
    /// Possession Move Request — move ownership outright; the owner
    /// removes its local frame once it replies.
    Pmr = 4,
    /// Response to PMR.
    Pmrr = 5,
    /// Possession Copy Request — ask the owner for a read-only copy
    /// without disturbing its own possession.
    Pcr = 6,
    /// Response to PCR.
    Pcrr = 7,
    /// Possession Update Request — a shared holder asking the owner to
    /// promote it to exclusive, invalidating every other shared copy.
    Pur = 8,
    /// Response to PUR.
    Purr = 9,
    /// Remote Alloc Request — ask a remote node to allocate and return a
    /// fresh pid it owns, pre-possessed by the requester.
    Rar = 10,
    /// Response to RAR: the allocated pid travels in `aux_pid`.
    Rarr = 11,
    /// Eviction Request — a page provider asking a remote owner to let it
    /// drop a batch of foreign frames it currently caches.
    Evr = 12,
    /// Response to an eviction request: the accepted subset travels as
    /// the envelope's eviction batch.
    Evrr = 13,
}

impl MessageKind {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => MessageKind::Finish,
            1 => MessageKind::Prs,
            2 => MessageKind::Prx,
            3 => MessageKind::Prr,
            4 => MessageKind::Pmr,
            5 => MessageKind::Pmrr,
            6 => MessageKind::Pcr,
            7 => MessageKind::Pcrr,
            8 => MessageKind::Pur,
            9 => MessageKind::Purr,
            10 => MessageKind::Rar,
            11 => MessageKind::Rarr,
            12 => MessageKind::Evr,
            13 => MessageKind::Evrr,
            _ => return None,
        })
    }
}

/// Outcome of a possession/update/copy request, per spec.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    /// No result carried (a plain request, not a response).
    None = 0,
    WithPage = 1,
    NoPage = 2,
    NoPageSharedConflict = 3,
    NoPageExclusiveConflict = 4,
    WithPageSharedConflict = 5,
    NoPageEvicted = 6,
    UpdateFailed = 7,
    UpdateSucceed = 8,
    UpdateSucceedWithSharedConflict = 9,
    CopyFailedWithRestart = 11,
    CopyFailedWithInvalidation = 12,
}

impl ResultCode {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => ResultCode::None,
            1 => ResultCode::WithPage,
            2 => ResultCode::NoPage,
            3 => ResultCode::NoPageSharedConflict,
            4 => ResultCode::NoPageExclusiveConflict,
            5 => ResultCode::WithPageSharedConflict,
            6 => ResultCode::NoPageEvicted,
            7 => ResultCode::UpdateFailed,
            8 => ResultCode::UpdateSucceed,
            9 => ResultCode::UpdateSucceedWithSharedConflict,
            11 => ResultCode::CopyFailedWithRestart,
            12 => ResultCode::CopyFailedWithInvalidation,
            _ => return None,
        })
    }

    /// Whether page bytes accompany this result in the envelope.
    pub fn carries_page(&self) -> bool {
        matches!(self, ResultCode::WithPage | ResultCode::WithPageSharedConflict)
    }
}

/// One coherence-protocol control message (the 32-byte mailbox slot
/// contents). Page bytes, when present, live alongside this in an
/// [`crate::coherence::mailbox::Envelope`], never inlined here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub from: NodeId,
    pub page_id: PageId,
    pub p_version: u64,
    /// Set on responses; `ResultCode::None` on requests.
    pub result: ResultCode,
    /// Conflicting/forwarding node named by `NoPage*`/`WithPage*Conflict`
    /// results, or the requester a PMR/PUR is granting possession to.
    pub aux_node: NodeId,
    /// RAR's freshly allocated pid (response).
    pub aux_pid: PageId,
    /// PMR's `need_page` flag: whether the requester still needs the page
    /// bytes or merely the ownership transfer.
    pub need_page: bool,
}

impl Message {
    pub fn request(kind: MessageKind, from: NodeId, page_id: PageId, p_version: u64) -> Self {
        Self {
            kind,
            from,
            page_id,
            p_version,
            result: ResultCode::None,
            aux_node: NodeId::NONE,
            aux_pid: PageId::EMPTY,
            need_page: false,
        }
    }

    pub fn response(kind: MessageKind, from: NodeId, page_id: PageId, p_version: u64, result: ResultCode) -> Self {
        Self {
            kind,
            from,
            page_id,
            p_version,
            result,
            aux_node: NodeId::NONE,
            aux_pid: PageId::EMPTY,
            need_page: false,
        }
    }

    pub fn with_aux_node(mut self, node: NodeId) -> Self {
        self.aux_node = node;
        self
    }

    pub fn with_aux_pid(mut self, pid: PageId) -> Self {
        self.aux_pid = pid;
        self
    }

    pub fn with_need_page(mut self, need: bool) -> Self {
        self.need_page = need;
        self
    }

    pub fn encode(&self) -> [u8; MESSAGE_BYTES] {
        let mut buf = [0u8; MESSAGE_BYTES];
        buf[0] = self.kind as u8;
        buf[1] = self.from.0;
        buf[2] = self.result as u8;
        buf[3] = self.aux_node.0;
        buf[4] = self.need_page as u8;
        buf[8..16].copy_from_slice(&self.page_id.raw().to_le_bytes());
        buf[16..24].copy_from_slice(&self.p_version.to_le_bytes());
        buf[24..32].copy_from_slice(&self.aux_pid.raw().to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; MESSAGE_BYTES]) -> Option<Self> {
        let kind = MessageKind::from_u8(buf[0])?;
        let from = NodeId::new(buf[1]);
        let result = ResultCode::from_u8(buf[2])?;
        let aux_node = NodeId::new(buf[3]);
        let need_page = buf[4] != 0;
        let page_id = PageId::from_raw(u64::from_le_bytes(buf[8..16].try_into().unwrap()));
        let p_version = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let aux_pid = PageId::from_raw(u64::from_le_bytes(buf[24..32].try_into().unwrap()));
        Some(Self { kind, from, page_id, p_version, result, aux_node, aux_pid, need_page })
    }
}
