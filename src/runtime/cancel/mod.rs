//! Cooperative cancellation
//!
//! A [`CancellationToken`] is a one-way signal: once cancelled it stays
//! cancelled, and everything waiting on it wakes. [`TaskTree`] arranges
//! tokens in a hierarchy keyed by task name so cancelling a node reaches its
//! whole subtree.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

/// Id of the implicit root node of every [`TaskTree`].
pub const ROOT_ID: &str = "root";

struct TokenInner {
    cancelled: AtomicBool,
    /// Dropped on cancel, which disconnects `done`.
    trigger: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
}

/// Shared, idempotent cancellation signal.
///
/// Clones observe the same signal.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (trigger, done) = channel::bounded(0);
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                done,
            }),
        }
    }

    /// A token that cancels itself once `timeout` elapses.
    pub fn with_timeout(timeout: Duration) -> Self {
        let token = Self::new();
        let watched = token.clone();
        let spawned = thread::Builder::new()
            .name("cancel-timeout".to_string())
            .spawn(move || {
                crossbeam::select! {
                    recv(watched.done()) -> _ => {}
                    recv(channel::after(timeout)) -> _ => watched.cancel(),
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "failed to spawn timeout watcher, cancelling now");
            token.cancel();
        }
        token
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.trigger.lock().take();
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Receiver that becomes ready (disconnected) on cancellation.
    ///
    /// Meant for `crossbeam::select!`; nothing is ever sent on it.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done
    }

    /// Block until cancelled.
    pub fn wait(&self) {
        let _ = self.inner.done.recv();
    }

    /// Block until cancelled or `timeout` elapses; true if cancelled.
    pub fn wait_timeout(
        &self,
        timeout: Duration,
    ) -> bool {
        match self.inner.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            _ => true,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TaskNode {
    token: CancellationToken,
    children: Vec<String>,
}

/// Hierarchy of named cancellation tokens.
#[derive(Debug)]
pub struct TaskTree {
    nodes: RwLock<IndexMap<String, TaskNode>>,
}

impl TaskTree {
    /// Create a tree holding only the root node.
    pub fn new() -> Self {
        let mut nodes = IndexMap::new();
        nodes.insert(
            ROOT_ID.to_string(),
            TaskNode {
                token: CancellationToken::new(),
                children: Vec::new(),
            },
        );
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Add `id` under `parent_id` and return its token.
    ///
    /// An unknown parent means the root. An id already in the tree keeps
    /// its place and returns its existing token. A child added under an
    /// already-cancelled parent starts out cancelled.
    pub fn add_task(
        &self,
        id: &str,
        parent_id: &str,
    ) -> CancellationToken {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get(id) {
            return node.token.clone();
        }
        let parent_id = if nodes.contains_key(parent_id) {
            parent_id
        } else {
            ROOT_ID
        };

        let token = CancellationToken::new();
        if let Some(parent) = nodes.get_mut(parent_id) {
            parent.children.push(id.to_string());
            if parent.token.is_cancelled() {
                token.cancel();
            }
        }
        nodes.insert(
            id.to_string(),
            TaskNode {
                token: token.clone(),
                children: Vec::new(),
            },
        );
        debug!(task = id, parent = parent_id, "task added to tree");
        token
    }

    /// Cancel `id` and then every descendant, parents before children.
    ///
    /// Returns false if `id` is unknown. Nodes stay in the tree.
    pub fn cancel_task(
        &self,
        id: &str,
    ) -> bool {
        let nodes = self.nodes.read();
        if !nodes.contains_key(id) {
            return false;
        }
        let mut stack = vec![id];
        let mut cancelled = 0usize;
        while let Some(current) = stack.pop() {
            let Some(node) = nodes.get(current) else {
                continue;
            };
            node.token.cancel();
            cancelled += 1;
            // reversed so the first child is visited first
            stack.extend(node.children.iter().rev().map(String::as_str));
        }
        debug!(task = id, cancelled, "task subtree cancelled");
        true
    }

    /// Token for `id`, if present.
    pub fn get_token(
        &self,
        id: &str,
    ) -> Option<CancellationToken> {
        self.nodes.read().get(id).map(|node| node.token.clone())
    }

    /// Token of the root node.
    pub fn root(&self) -> CancellationToken {
        self.get_token(ROOT_ID).unwrap_or_default()
    }

    /// Child ids of `id` in insertion order.
    pub fn children(
        &self,
        id: &str,
    ) -> Vec<String> {
        self.nodes
            .read()
            .get(id)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    /// Number of nodes, the root included.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskTree {
    fn default() -> Self {
        Self::new()
    }
}
