//! Transport contract between the engine and the RPC/bulk layer
//!
//! Posting never blocks. IO fops report back through an [`IoEventSink`]:
//! one `bulk_received` per read bulk buffer and one `replied` per fop, from
//! whatever thread the transport runs on. Fsync and cob requests hand back
//! a [`ReplyTicket`] the caller awaits with a timeout.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use stripeio_common::{EntityId, Error, LayoutId, Result, ServiceId, TargetAddr, TargetId, TxRemId};
use stripeio_layout::{FvUpdate, FvVersion};
use tokio::sync::oneshot;

/// Identifier of one IO fop, unique within a client
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FopId(pub(crate) u64);

impl FopId {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for FopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FopId({})", self.0)
    }
}

impl fmt::Display for FopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fop-{}", self.0)
    }
}

/// What an IO fop asks the target to do
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FopKind {
    Read,
    Write,
    /// Preallocate the segments
    Alloc,
    /// Deallocate the segments; later reads see zeros
    Free,
}

impl FopKind {
    #[must_use]
    pub const fn is_read(self) -> bool {
        matches!(self, Self::Read)
    }
}

/// Target-local byte range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub len: u64,
}

/// One IO RPC to one target
#[derive(Clone, Debug)]
pub struct IoFopRequest {
    pub fop: FopId,
    pub kind: FopKind,
    pub target: TargetAddr,
    pub object: EntityId,
    /// Pool machine version the client built this request against
    pub pool_version: FvVersion,
    /// Ascending, non-overlapping target-local ranges
    pub segments: Vec<Segment>,
    /// Write payload, one buffer per segment
    pub payload: Vec<Bytes>,
    /// Read bulk buffers; entry `i` is how many consecutive segments buffer
    /// `i` carries
    pub bulk: Vec<usize>,
}

/// Reply to an IO fop
#[derive(Clone, Debug, Default)]
pub struct IoReply {
    /// Negative errno from the service, zero on success
    pub rc: i32,
    /// Transaction the update landed in (zero for reads)
    pub remid: TxRemId,
    /// Present when the service's pool machine is ahead of the request's
    pub fv_update: Option<FvUpdate>,
}

/// Receiver of transport events for in-flight IO fops
pub trait IoEventSink: Send + Sync {
    /// A bulk buffer of a read fop arrived (or failed)
    ///
    /// On success the bytes are the buffer's segments concatenated.
    fn bulk_received(&self, fop: FopId, buffer: usize, data: Result<Bytes>);

    /// The reply of a fop arrived, or the transport gave up on it
    fn replied(&self, fop: FopId, reply: Result<IoReply>);
}

/// How an fsync waits on the service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsyncMode {
    /// Force the transaction to stable storage now
    Active,
    /// Wait for the service's own commit cycle
    Passive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsyncRequest {
    pub service: ServiceId,
    pub remid: TxRemId,
    pub mode: FsyncMode,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FsyncReply {
    pub rc: i32,
    /// Highest transaction the service has made durable
    pub remid: TxRemId,
}

/// Component-object (per-target metadata) request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CobOp {
    Create,
    Delete,
    Lookup,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CobRequest {
    pub op: CobOp,
    pub object: EntityId,
    pub layout: LayoutId,
    pub service: ServiceId,
    /// `None` addresses the object's metadata record itself
    pub target: Option<TargetId>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CobReply {
    pub rc: i32,
    pub remid: TxRemId,
    pub layout: LayoutId,
}

/// Handle on a reply that has not arrived yet
#[derive(Debug)]
pub struct ReplyTicket<T> {
    rx: oneshot::Receiver<Result<T>>,
}

/// Sending half of a [`ReplyTicket`], kept by the transport
#[derive(Debug)]
pub struct ReplySender<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> ReplySender<T> {
    /// Complete the ticket. A ticket nobody waits for any more is fine.
    pub fn send(self, reply: Result<T>) {
        let _ = self.tx.send(reply);
    }
}

impl<T> ReplyTicket<T> {
    #[must_use]
    pub fn channel() -> (ReplySender<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (ReplySender { tx }, Self { rx })
    }

    /// Wait for the reply, at most `timeout`
    pub async fn wait(self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, self.rx).await {
            Err(_) => Err(Error::TimedOut),
            Ok(Err(_)) => Err(Error::unavailable("reply dropped by transport")),
            Ok(Ok(reply)) => reply,
        }
    }
}

/// The RPC/bulk layer the engine posts requests through
pub trait Transport: Send + Sync {
    /// Post an IO fop. Events for it arrive on `sink`.
    ///
    /// An error means nothing was sent and no event will follow.
    fn post_io(&self, request: IoFopRequest, sink: Arc<dyn IoEventSink>) -> Result<()>;

    fn post_fsync(&self, request: FsyncRequest) -> Result<ReplyTicket<FsyncReply>>;

    fn post_cob(&self, request: CobRequest) -> Result<ReplyTicket<CobReply>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ticket_delivers_reply() {
        let (tx, ticket) = ReplyTicket::<FsyncReply>::channel();
        tx.send(Ok(FsyncReply {
            rc: 0,
            remid: TxRemId::new(9, 0),
        }));
        let reply = ticket.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.remid.txid, 9);
    }

    #[tokio::test]
    async fn test_ticket_times_out() {
        let (_tx, ticket) = ReplyTicket::<CobReply>::channel();
        let err = ticket.wait(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err, Error::TimedOut);
    }

    #[tokio::test]
    async fn test_ticket_sender_dropped() {
        let (tx, ticket) = ReplyTicket::<CobReply>::channel();
        drop(tx);
        assert!(ticket.wait(Duration::from_secs(1)).await.unwrap_err().is_unavailable());
    }
}
