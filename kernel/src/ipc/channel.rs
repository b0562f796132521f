//! Bidirectional message channels.
//!
//! A channel is one end of a pair; the two ends point at each other through
//! weak references, so neither keeps the other alive. Sending enqueues onto
//! the peer's bounded FIFO queue; receiving dequeues from the channel's own
//! queue. Messages on one channel are delivered in FIFO order, and
//! conversation IDs are monotonic per channel.
//!
//! The send lock on the target endpoint is the serialization point for the
//! atomic-send protocol: the syscall layer validates and translates every
//! attachment first, takes the lock, and only then commits, so a failed send
//! changes no observable attachment state.

use crate::error::{Kind, Result};
use crate::ipc::message::{Message, MessagePreview};
use crate::sync::spinlock::{Spinlock, SpinlockGuard};
use crate::sync::waitq::Waitq;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Default bound on queued messages per endpoint.
pub const DEFAULT_QUEUE_LIMIT: usize = 256;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

struct ChannelInner {
    queue: VecDeque<Message>,
    closed: bool,
    limit: usize,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

/// One endpoint of a channel pair.
pub struct Channel {
    id: u64,
    peer: Spinlock<Weak<Channel>>,
    inner: Spinlock<ChannelInner>,
    /// Serialization point for enqueues into this endpoint's queue.
    send_lock: Spinlock<()>,
    conversation_counter: AtomicU64,
    next_message_id: AtomicU64,
    /// Woken when a message lands in this endpoint's queue.
    msg_arrival_wq: Waitq,
    /// Woken when this endpoint's queue drains to empty.
    queue_empty_wq: Waitq,
    /// Woken whenever a message is removed from this endpoint's queue.
    queue_removal_wq: Waitq,
    /// Parked senders waiting for space in this endpoint's queue.
    queue_full_wq: Waitq,
    /// Woken when the peer closes.
    close_wq: Waitq,
}

/// Failed send: the error kind plus the message, handed back untouched.
pub type SendError = (Kind, Message);

/// Guard for the split send-lock protocol. Obtained from
/// [`Channel::lock_send`], consumed by dropping (`unlock_send`).
pub struct SendGuard<'a> {
    _guard: SpinlockGuard<'a, ()>,
}

impl Channel {
    fn new(limit: usize) -> Channel {
        Channel {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            peer: Spinlock::new(Weak::new()),
            inner: Spinlock::new(ChannelInner {
                queue: VecDeque::new(),
                closed: false,
                limit,
            }),
            send_lock: Spinlock::new(()),
            conversation_counter: AtomicU64::new(0),
            next_message_id: AtomicU64::new(1),
            msg_arrival_wq: Waitq::new(),
            queue_empty_wq: Waitq::new(),
            queue_removal_wq: Waitq::new(),
            queue_full_wq: Waitq::new(),
            close_wq: Waitq::new(),
        }
    }

    /// Create a connected pair of endpoints with the default queue bound.
    pub fn pair() -> (Arc<Channel>, Arc<Channel>) {
        Self::pair_with_limit(DEFAULT_QUEUE_LIMIT)
    }

    /// Create a connected pair with an explicit per-endpoint queue bound.
    pub fn pair_with_limit(limit: usize) -> (Arc<Channel>, Arc<Channel>) {
        let a = Arc::new(Channel::new(limit));
        let b = Arc::new(Channel::new(limit));
        *a.peer.lock() = Arc::downgrade(&b);
        *b.peer.lock() = Arc::downgrade(&a);
        (a, b)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The opposite endpoint, retained, if it is still alive.
    pub fn peer(&self) -> Option<Arc<Channel>> {
        self.peer.lock().upgrade()
    }

    /// Allocate the next conversation ID on this channel. Monotonic; never
    /// returns 0 (0 means "no conversation").
    pub fn conversation_create(&self) -> u64 {
        self.conversation_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// True once this endpoint has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Messages currently queued on this endpoint.
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    // --- The split send protocol ---------------------------------------

    /// Acquire this endpoint's send lock. The caller validates everything it
    /// must before this point; between `lock_send` and the guard's release
    /// only [`send_locked`](Channel::send_locked) may touch the queue tail.
    pub fn lock_send(&self) -> SendGuard<'_> {
        SendGuard {
            _guard: self.send_lock.lock(),
        }
    }

    /// Commit one message into this endpoint's queue under the held send
    /// lock. On failure the message is returned untouched.
    pub fn send_locked(
        &self,
        _guard: &SendGuard<'_>,
        mut message: Message,
    ) -> core::result::Result<u64, SendError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err((Kind::PermanentOutage, message));
        }
        if inner.queue.len() >= inner.limit {
            return Err((Kind::ResourceUnavailable, message));
        }
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        message.message_id = message_id;
        inner.queue.push_back(message);
        drop(inner);
        self.msg_arrival_wq.wake_all();
        Ok(message_id)
    }

    /// Enqueue `message` on the peer's queue. The whole-message form of the
    /// protocol: fails without observable effect, handing the message back.
    ///
    /// `start_conversation` allocates a fresh conversation ID on this
    /// channel and stamps the message with it before the commit.
    pub fn send(
        &self,
        mut message: Message,
        start_conversation: bool,
    ) -> core::result::Result<u64, SendError> {
        if self.is_closed() {
            return Err((Kind::PermanentOutage, message));
        }
        let Some(peer) = self.peer() else {
            return Err((Kind::PermanentOutage, message));
        };
        if start_conversation {
            message.conversation_id = self.conversation_create();
        }
        let guard = peer.lock_send();
        peer.send_locked(&guard, message)
    }

    // --- Receive --------------------------------------------------------

    /// Inspect the head of the queue without consuming it.
    pub fn peek(&self) -> Result<MessagePreview> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(Kind::PermanentOutage);
        }
        match inner.queue.front() {
            Some(m) => Ok(m.preview()),
            None => {
                drop(inner);
                Err(self.empty_receive_kind())
            }
        }
    }

    /// Dequeue the head message. With `match_message_id`, only consume the
    /// head if its ID matches; a different head reports
    /// `resource_unavailable` without consuming.
    pub fn receive(&self, match_message_id: Option<u64>) -> Result<Message> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Kind::PermanentOutage);
        }
        let Some(head) = inner.queue.front() else {
            drop(inner);
            return Err(self.empty_receive_kind());
        };
        if let Some(wanted) = match_message_id {
            if head.message_id != wanted {
                return Err(Kind::ResourceUnavailable);
            }
        }
        let message = inner.queue.pop_front().expect("head vanished under lock");
        let emptied = inner.queue.is_empty();
        drop(inner);

        // A removal frees queue space: wake removal subscribers and any
        // parked senders; announce the drain if the queue just emptied.
        self.queue_removal_wq.wake_all();
        self.queue_full_wq.wake_all();
        if emptied {
            self.queue_empty_wq.wake_all();
        }
        Ok(message)
    }

    /// Error for an empty-queue receive: `permanent_outage` once nothing
    /// more can ever arrive, `resource_unavailable` otherwise.
    fn empty_receive_kind(&self) -> Kind {
        let peer_gone = match self.peer() {
            Some(peer) => peer.is_closed(),
            None => true,
        };
        if peer_gone {
            Kind::PermanentOutage
        } else {
            Kind::ResourceUnavailable
        }
    }

    // --- Close ----------------------------------------------------------

    /// Close this endpoint. One-way: the peer keeps draining messages
    /// already queued on its side, then observes `permanent_outage`.
    /// Parked senders and receivers touching this endpoint are woken so
    /// their retried operations see the closed state.
    pub fn close(&self) {
        let undelivered = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            std::mem::take(&mut inner.queue)
        };
        // Undelivered messages die with the endpoint; dropping them outside
        // the lock releases every attachment reference they carried, and a
        // nested endpoint drop never runs under this queue's lock.
        drop(undelivered);
        log::debug!("[chan] channel {} closed", self.id);

        // Our own waiters fail their retried operations.
        self.msg_arrival_wq.wake_all();
        self.queue_full_wq.wake_all();

        if let Some(peer) = self.peer() {
            // The peer's close queue observes peer-closed; its parked
            // receivers re-check and drain-then-fail. Senders on this
            // endpoint park on the peer's queue-full queue, so waking it
            // aborts our pending sends too.
            peer.close_wq.wake_all();
            peer.msg_arrival_wq.wake_all();
            peer.queue_full_wq.wake_all();
        }
    }

    // --- Wait queues ----------------------------------------------------

    pub fn arrival_wq(&self) -> &Waitq {
        &self.msg_arrival_wq
    }

    pub fn empty_wq(&self) -> &Waitq {
        &self.queue_empty_wq
    }

    pub fn removal_wq(&self) -> &Waitq {
        &self.queue_removal_wq
    }

    pub fn full_wq(&self) -> &Waitq {
        &self.queue_full_wq
    }

    pub fn close_wq(&self) -> &Waitq {
        &self.close_wq
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Last reference gone: implicit close so the peer is not left
        // waiting on a channel nobody can send to.
        let closed = self.inner.lock().closed;
        if !closed {
            self.close();
        }
    }
}
