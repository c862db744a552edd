//! The coherence protocol: the wire format, the in-process transport
//! substitute for RDMA, and the handler that answers remote requests
//! against pages this node owns (spec.md §4.3, §6).
//!
//! - [`message`] — the 32-byte [`message::Message`] wire record
//! - [`mailbox`] — per-node inbox plus the [`mailbox::ResponseSlot`] a
//!   requester spins on
//! - [`transport`] — the [`transport::Fabric`] abstraction and its
//!   in-process [`transport::LoopbackFabric`] implementation
//! - [`handler`] — [`handler::CoherenceHandler`], the state machine that
//!   answers PRS/PRX/PMR/PCR/PUR/RAR

pub mod handler;
pub mod mailbox;
pub mod message;
pub mod transport;

pub use handler::CoherenceHandler;
pub use mailbox::{Envelope, EvictionEntry, MailboxPartition, ResponseSlot};
pub use message::{Message, MessageKind, ResultCode};
pub use transport::{Fabric, LoopbackFabric};
