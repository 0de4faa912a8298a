//! Serialization groups
//!
//! A locality is one tokio task draining a queue of deferred callbacks
//! (ASTs). Every state change of an operation runs as an AST on the
//! operation's locality, so handlers for one operation never overlap, while
//! operations on other localities proceed in parallel. Transport threads
//! never run engine code in place; they only post.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

type Ast = Box<dyn FnOnce() + Send + 'static>;

/// Posting handle on a serialization group
#[derive(Clone, Debug)]
pub struct Locality {
    id: usize,
    tx: mpsc::UnboundedSender<Ast>,
}

impl Locality {
    /// Start a locality on the current tokio runtime
    pub(crate) fn spawn(id: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Ast>();
        let handle = tokio::spawn(async move {
            while let Some(ast) = rx.recv().await {
                ast();
            }
            debug!("locality {} drained", id);
        });
        (Self { id, tx }, handle)
    }

    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Queue `ast` behind everything already posted
    ///
    /// Returns false when the locality has shut down.
    pub(crate) fn post(&self, ast: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(ast)).is_ok()
    }
}
