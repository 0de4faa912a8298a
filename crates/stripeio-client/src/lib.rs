//! StripeIO Client - asynchronous operation engine
//!
//! Applications build operations against objects, indices and realms, launch
//! them without blocking, and wait for them to become executed (result
//! visible) or stable (result durable).
//!
//! ```text
//!   Obj::io_op ──► Op ──launch──► locality ──► IoOp ──► maps ──► NwXfer ──► Transport
//!                   ▲                             ▲                            │
//!                   └──── wait / callbacks ◄──────┴──── FopSink (bottom half) ◄┘
//! ```
//!
//! The engine is parameterised by its collaborators: a [`Transport`] for
//! RPC and bulk data, a [`stripeio_layout::LayoutResolver`] for placement and
//! an [`IndexService`] for key-value indices. [`LoopbackCluster`] serves the
//! transport in memory.

pub mod client;
pub mod entity;
pub mod idx;
pub mod io;
pub mod locality;
pub mod loopback;
pub mod obj;
pub mod op;
pub mod realm;
pub mod sync;
pub mod transport;

// Re-exports
pub use client::{Client, ClientState, Collaborators};
pub use entity::EntityState;
pub use idx::{Idx, IdxReply, IndexService, MemIndexService};
pub use io::{IoOpcode, IoReqState, IoTrace, MapState, PhaseTrace, RepairType};
pub use loopback::LoopbackCluster;
pub use obj::{Obj, ObjAttr};
pub use op::{Op, OpCallbacks, OpCode, OpState, StateMask};
pub use realm::Realm;
pub use sync::{PendingTx, ServiceContext};
pub use transport::{
    CobOp, CobReply, CobRequest, FopId, FopKind, FsyncMode, FsyncReply, FsyncRequest, IoEventSink,
    IoFopRequest, IoReply, ReplySender, ReplyTicket, Segment, Transport,
};
