//! §4.6: a bounded queue that drains evicted dirty nodes to their [`crate::stock::Stock`]
//! on a dedicated worker thread, so a cache eviction never blocks on disk I/O. Modeled on
//! the `crossbeam::channel` + dedicated-thread pattern used for background worker pools,
//! generalized to a single-worker pipeline with cancellation and a flush barrier.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Sender};

use crate::error::{MultiError, Result, StateError};
use crate::node::Node;
use crate::node_id::NodeId;

/// Persists one evicted node. Implemented by [`crate::forest::Forest`], which closes over
/// the right [`crate::codec::Codec`] and [`crate::stock::Stock`] for the node's kind.
pub trait Persister: Send + Sync + 'static {
    fn persist(&self, id: NodeId, node: &Node) -> Result<()>;
}

enum Message {
    Write(NodeId, Node),
    Flush(Sender<()>),
    Close,
}

/// Bounded async write-behind queue (§4.6). Construct with [`WriteBuffer::spawn`], which
/// starts the worker thread; `close` must be called for a clean shutdown, or dropping
/// without closing will leak the worker thread (it only exits on `Close`).
pub struct WriteBuffer {
    sender: Sender<Message>,
    cancelled: Arc<Mutex<HashSet<NodeId>>>,
    worker: Option<JoinHandle<()>>,
    errors: Arc<Mutex<Vec<StateError>>>,
}

impl WriteBuffer {
    pub fn spawn(capacity: usize, persister: impl Persister) -> Self {
        let (sender, receiver) = bounded::<Message>(capacity.max(1));
        let cancelled: Arc<Mutex<HashSet<NodeId>>> = Arc::new(Mutex::new(HashSet::new()));
        let errors: Arc<Mutex<Vec<StateError>>> = Arc::new(Mutex::new(Vec::new()));

        let worker_cancelled = Arc::clone(&cancelled);
        let worker_errors = Arc::clone(&errors);
        let worker = std::thread::spawn(move || {
            for message in receiver {
                match message {
                    Message::Write(id, node) => {
                        let was_cancelled = worker_cancelled.lock().unwrap().remove(&id);
                        if was_cancelled {
                            continue;
                        }
                        if let Err(e) = persister.persist(id, &node) {
                            worker_errors.lock().unwrap().push(e);
                        }
                    }
                    Message::Flush(ack) => {
                        let _ = ack.send(());
                    }
                    Message::Close => break,
                }
            }
        });

        Self {
            sender,
            cancelled,
            worker: Some(worker),
            errors,
        }
    }

    /// Enqueues `node` for persistence. Blocks if the queue is at capacity, applying
    /// backpressure to the evictor rather than growing unbounded (§4.6).
    #[tracing::instrument(level = "trace", skip(self, node))]
    pub fn add(&self, id: NodeId, node: Node) -> Result<()> {
        self.sender
            .send(Message::Write(id, node))
            .map_err(|_| StateError::Contention("write buffer worker has shut down".into()))
    }

    /// Marks a pending write for `id` as obsolete: the node was read back and re-dirtied
    /// (or deleted) before its queued write reached disk (§4.6, "read-after-evict
    /// reinstatement"). A no-op if the write already landed.
    pub fn cancel(&self, id: NodeId) {
        self.cancelled.lock().unwrap().insert(id);
    }

    /// Blocks until every write enqueued before this call has been applied (or cancelled).
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.sender
            .send(Message::Flush(ack_tx))
            .map_err(|_| StateError::Contention("write buffer worker has shut down".into()))?;
        ack_rx
            .recv()
            .map_err(|_| StateError::Contention("write buffer worker dropped the flush ack".into()))?;
        self.drain_errors()
    }

    fn drain_errors(&self) -> Result<()> {
        let errors: Vec<StateError> = std::mem::take(&mut self.errors.lock().unwrap());
        match MultiError::into_result(errors) {
            Ok(()) => Ok(()),
            Err(multi) => Err(StateError::CorruptionDetected(multi.to_string())),
        }
    }

    /// Flushes, then stops the worker thread. Further calls to `add`/`cancel`/`flush` after
    /// `close` will fail.
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        let _ = self.sender.send(Message::Close);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        Ok(())
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.close();
        }
    }
}
