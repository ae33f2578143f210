// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Socket-based inter-task IPC: descriptor tables, bounded message
//! queues, connect/close, and peer wakeup — `spec.md` §3/§4.F.
//!
//! The destroy sequence below follows the order `spec.md` §9 prescribes
//! exactly (remove-from-bucket → null-endpoint → drain-pending →
//! emit-or-free → free-link) to sidestep both defects the original's
//! revisions carried: a `_free_socket` loop that read `msg->next` after
//! freeing `msg`, and a `_socket_destroy` path missing the
//! remove-from-bucket step. Freeing the socket and its queued messages
//! needs no explicit code at all here: a `Socket` is owned by its
//! `SocketLink`s' `Arc<Socket>` fields and by nothing else, so the last
//! link to drop frees it (and every message still queued, via
//! `VecDeque<Message>`'s own `Drop`) the ordinary way.

use crate::config;
use crate::task::Task;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use log::warn;
use spin::Mutex;

/// `spec.md` §3's Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Connect = 0,
    Data = 1,
    RemoteClosed = 2,
    RemoteKilled = 3,
    RemoteExit = 4,
    RemoteMemoryFault = 5,
}

/// `{ type, length, payload[<= 0xFE8] }`.
#[derive(Debug, Clone)]
pub struct Message {
    pub ty: MessageType,
    pub payload: Vec<u8>,
}

impl Message {
    /// Builds a `DATA` message, copying up to `MAX_MESSAGE_LEN` bytes.
    /// Returns `None` if `data` is longer than that.
    pub fn data(data: &[u8]) -> Option<Message> {
        if data.len() > config::MAX_MESSAGE_LEN {
            return None;
        }
        Some(Message { ty: MessageType::Data, payload: Vec::from(data) })
    }

    fn control(ty: MessageType, payload: u32) -> Message {
        Message { ty, payload: Vec::from(payload.to_le_bytes()) }
    }
}

struct Endpoints {
    connector: Option<Weak<SocketLink>>,
    receiver: Option<Weak<SocketLink>>,
}

struct Queues {
    /// Messages sent by the connector, waiting for the receiver.
    to_receiver: VecDeque<Message>,
    /// Messages sent by the receiver, waiting for the connector.
    to_connector: VecDeque<Message>,
}

/// The shared backbone between two endpoints — `spec.md` §3's Socket.
pub struct Socket {
    endpoints: Mutex<Endpoints>,
    queues: Mutex<Queues>,
}

struct Teardown {
    is_closed: bool,
    refcount: u64,
    close_code: u32,
    /// The message type `destroy` sends to the remaining peer, if any.
    /// `RemoteClosed` for an ordinary client-initiated close;
    /// `RemoteKilled`/`RemoteExit`/`RemoteMemoryFault` when kill
    /// machinery (`crate::kill`) closes a dying task's sockets on its
    /// behalf instead (`spec.md` §4.G step 5).
    close_type: MessageType,
}

/// A task-local handle onto a socket — `spec.md` §3's SocketLink.
pub struct SocketLink {
    socket: Arc<Socket>,
    descriptor: usize,
    is_connector: bool,
    task: Weak<Task>,
    teardown: Mutex<Teardown>,
}

impl SocketLink {
    pub fn descriptor(&self) -> usize {
        self.descriptor
    }

    pub fn is_connector(&self) -> bool {
        self.is_connector
    }

    pub fn task(&self) -> Option<Arc<Task>> {
        self.task.upgrade()
    }

    /// Creates a fresh socket and this task's connector-side link to
    /// it: `spec.md` §4.F's `socket_new`.
    pub fn new_socket(task: &Arc<Task>) -> Option<Arc<SocketLink>> {
        let socket = Arc::new(Socket {
            endpoints: Mutex::new(Endpoints { connector: None, receiver: None }),
            queues: Mutex::new(Queues { to_receiver: VecDeque::new(), to_connector: VecDeque::new() }),
        });
        Self::new_link(task, socket, true)
    }

    fn new_link(task: &Arc<Task>, socket: Arc<Socket>, is_connector: bool) -> Option<Arc<SocketLink>> {
        let descriptor = task.descriptors().lock().get()?;
        let link = Arc::new(SocketLink {
            socket,
            descriptor,
            is_connector,
            task: Arc::downgrade(task),
            teardown: Mutex::new(Teardown {
                is_closed: false,
                refcount: 1,
                close_code: 0,
                close_type: MessageType::RemoteClosed,
            }),
        });
        {
            let weak = Arc::downgrade(&link);
            let mut endpoints = link.socket.endpoints.lock();
            if is_connector {
                endpoints.connector = Some(weak);
            } else {
                endpoints.receiver = Some(weak);
            }
        }
        let bucket = descriptor & (config::SOCKET_BUCKETS - 1);
        task.sockets().lock()[bucket].push_back(Arc::clone(&link));
        Some(link)
    }

    /// Scans the owning task's descriptor table for `descriptor` and
    /// returns a referenced link on a match — `spec.md` §4.F's
    /// `for_descriptor`.
    pub fn for_descriptor(task: &Arc<Task>, descriptor: usize) -> Option<Arc<SocketLink>> {
        let bucket = descriptor & (config::SOCKET_BUCKETS - 1);
        let sockets = task.sockets().lock();
        let found = sockets[bucket]
            .iter()
            .find(|link| link.descriptor == descriptor)
            .cloned()?;
        drop(sockets);
        if found.try_reference() {
            Some(found)
        } else {
            None
        }
    }

    /// Attempts to take a transient reference: fails once the link is
    /// closed. `spec.md` §4.F's `reference`.
    pub fn try_reference(&self) -> bool {
        let mut teardown = self.teardown.lock();
        if teardown.is_closed {
            return false;
        }
        teardown.refcount += 1;
        true
    }

    /// Releases a transient reference. If this drains the count to zero
    /// and the link is closed, destroys it — `spec.md` §4.F's
    /// `dereference`.
    pub fn dereference(self: &Arc<SocketLink>) {
        let should_destroy = {
            let mut teardown = self.teardown.lock();
            debug_assert!(teardown.refcount > 0, "dereference without a matching reference");
            teardown.refcount -= 1;
            teardown.refcount == 0 && teardown.is_closed
        };
        if should_destroy {
            SocketLink::destroy(Arc::clone(self));
        }
    }

    /// Marks the link closed. Actual teardown is deferred to the final
    /// `dereference` — `spec.md` §4.F's `close`.
    pub fn close(&self, code: u32) {
        let mut teardown = self.teardown.lock();
        teardown.is_closed = true;
        teardown.close_code = code;
        teardown.close_type = MessageType::RemoteClosed;
    }

    /// The kill-machinery equivalent of [`SocketLink::close`]: marks the
    /// link closed so the peer is notified with `ty` (a task's actual
    /// kill reason) instead of a generic `RemoteClosed` once the final
    /// `dereference` destroys it — `spec.md` §4.G step 5's "identical
    /// protocol to client-initiated close".
    pub(crate) fn close_for_kill(&self, ty: MessageType) {
        let mut teardown = self.teardown.lock();
        teardown.is_closed = true;
        teardown.close_code = 0;
        teardown.close_type = ty;
    }

    /// Enqueues `message` on the direction opposite this link, failing
    /// (and returning the message back) only if it is a `DATA` message
    /// and that direction already holds `MAX_BUF` entries — `spec.md`
    /// §4.F's `msg`. On success, logically consumes `self`'s reference
    /// (the caller's own `Arc` clone should be dropped; the explicit
    /// refcount this releases is distinct from that).
    pub fn msg(self: &Arc<SocketLink>, message: Message) -> Result<(), Message> {
        {
            let mut queues = self.socket.queues.lock();
            let queue = if self.is_connector { &mut queues.to_receiver } else { &mut queues.to_connector };
            if matches!(message.ty, MessageType::Data) && queue.len() >= config::MAX_BUF {
                return Err(message);
            }
            queue.push_back(message);
        }
        wake_peer(&self.socket, self.is_connector);
        self.dereference();
        Ok(())
    }

    /// Pops the head of the inbound direction (opposite of `msg`'s
    /// outbound direction) — `spec.md` §4.F's `read`.
    pub fn read(&self) -> Option<Message> {
        let mut queues = self.socket.queues.lock();
        let queue = if self.is_connector { &mut queues.to_connector } else { &mut queues.to_receiver };
        queue.pop_front()
    }

    /// Creates a receiver-side link in `peer_task` onto the same
    /// socket, registers it in the peer's descriptor table, enqueues a
    /// `CONNECT` message carrying the new descriptor so the receiver
    /// learns its own handle, and wakes the peer — `spec.md` §4.F's
    /// `connect`.
    pub fn connect(self: &Arc<SocketLink>, peer_task: &Arc<Task>) -> bool {
        let peer_link = match Self::new_link(peer_task, Arc::clone(&self.socket), false) {
            Some(link) => link,
            None => return false,
        };
        {
            let mut queues = self.socket.queues.lock();
            queues
                .to_receiver
                .push_back(Message::control(MessageType::Connect, peer_link.descriptor as u32));
        }
        wake_peer(&self.socket, true);
        true
    }

    fn bucket(&self) -> usize {
        self.descriptor & (config::SOCKET_BUCKETS - 1)
    }

    /// Tears the link down in the order `spec.md` §9 prescribes. Only
    /// called once, by `dereference`, when a closed link's refcount
    /// drains to zero.
    fn destroy(link: Arc<SocketLink>) {
        if let Some(task) = link.task.upgrade() {
            // 1. remove from descriptor bucket.
            let mut sockets = task.sockets().lock();
            sockets[link.bucket()].retain(|l| !Arc::ptr_eq(l, &link));
            drop(sockets);
            task.descriptors().lock().put(link.descriptor);

            // 3. remove from pending list (ahead of step 2 textually
            // above in source order, but no ordering dependency exists
            // between the two — neither observes the other).
            task.pending().lock().retain(|l| !Arc::ptr_eq(l, &link));
        }

        // 2. null out this side; observe whether the other still exists.
        let other_exists = {
            let mut endpoints = link.socket.endpoints.lock();
            if link.is_connector {
                endpoints.connector = None;
                endpoints.receiver.is_some()
            } else {
                endpoints.receiver = None;
                endpoints.connector.is_some()
            }
        };

        // 4. emit-or-free: best-effort REMOTE_CLOSED to whichever side
        // remains. If nothing remains, there is nothing further to do —
        // the socket and its queued messages are freed automatically
        // once every `Arc<Socket>` (one per link) drops, which happens
        // as `link` itself is dropped at the end of this function.
        if other_exists {
            let (code, ty) = {
                let teardown = link.teardown.lock();
                (teardown.close_code, teardown.close_type)
            };
            let message = Message::control(ty, code);
            let mut queues = link.socket.queues.lock();
            let queue = if link.is_connector { &mut queues.to_receiver } else { &mut queues.to_connector };
            // Control messages normally bypass backpressure, but a
            // socket mid-teardown is, by definition, abandoned by one
            // side; `spec.md` §9 explicitly allows dropping this one
            // best-effort notification rather than growing the queue
            // without bound.
            if queue.len() < config::MAX_BUF {
                queue.push_back(message);
                drop(queues);
                wake_peer(&link.socket, link.is_connector);
            } else {
                warn!("dropping REMOTE_CLOSED notification: peer queue already full");
            }
        }

        // 5/6. free the link: `link`'s `Arc<Socket>` drops here, and if
        // it was the last one, so does the socket (and its queues).
    }
}

/// Wakes whichever side is opposite the sender. `sender_is_connector`
/// true means the message just went into `to_receiver`, so the
/// receiver side is who should wake — `spec.md` §4.F's "peer wakeup".
fn wake_peer(socket: &Arc<Socket>, sender_is_connector: bool) {
    let target = {
        let endpoints = socket.endpoints.lock();
        let weak = if sender_is_connector { &endpoints.receiver } else { &endpoints.connector };
        weak.as_ref().and_then(Weak::upgrade)
    };
    let peer_link = match target {
        Some(link) if link.try_reference() => link,
        _ => return,
    };
    let peer_task = match peer_link.task.upgrade().and_then(|t| t.try_reference()) {
        Some(task) => task,
        None => {
            peer_link.dereference();
            return;
        }
    };

    {
        let mut pending = peer_task.pending().lock();
        if !pending.iter().any(|l| Arc::ptr_eq(l, &peer_link)) {
            pending.push_back(Arc::clone(&peer_link));
        }
    }

    // Scanning the task's thread list for the first polling thread and
    // switching to it needs the run queue and the real `switch`
    // primitive, both owned by `crate::scheduler`; this function's job
    // ends at getting the peer link onto the pending list.
    //
    // `wake_one` reports whether it actually switched to a thread of
    // `peer_task`. If it did, `peer_task`'s reference was logically
    // moved into that thread's new "current" bookkeeping (to be
    // balanced later by `crate::scheduler::push_current`/`switch_to`
    // when that thread stops being current) and must not also be
    // dropped here; if no thread was polling, this function still owns
    // it and must release it itself.
    let consumed = crate::scheduler::wake_one(&peer_task);

    peer_link.dereference();
    if !consumed {
        peer_task.dereference();
    }
}

#[cfg(test)]
impl SocketLink {
    /// A link with no real task, for tests that only need `Arc<SocketLink>`
    /// to exist (e.g. to populate a `pending` deque) without exercising
    /// any socket protocol.
    pub(crate) fn new_dummy_for_test() -> Arc<SocketLink> {
        let socket = Arc::new(Socket {
            endpoints: Mutex::new(Endpoints { connector: None, receiver: None }),
            queues: Mutex::new(Queues { to_receiver: VecDeque::new(), to_connector: VecDeque::new() }),
        });
        Arc::new(SocketLink {
            socket,
            descriptor: 0,
            is_connector: true,
            task: Weak::new(),
            teardown: Mutex::new(Teardown {
                is_closed: false,
                refcount: 1,
                close_code: 0,
                close_type: MessageType::RemoteClosed,
            }),
        })
    }
}
