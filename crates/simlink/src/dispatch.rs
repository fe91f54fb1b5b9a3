//! See [`Dispatcher`].

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    thread::JoinHandle,
};

use ahash::AHashMap;
use simlink_proto::kind::MessageKind;

use crate::message::InboundMessage;

/// A subscriber callback for one message kind.
pub type Handler = Arc<dyn Fn(&InboundMessage) + Send + Sync + 'static>;

/// Token returned by registration, used to unregister the same handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type HandlerList = Arc<[(HandlerId, Handler)]>;

enum Job {
    Deliver(InboundMessage),
    Run(Box<dyn FnOnce() + Send + 'static>),
    Stop,
}

#[derive(Default)]
struct HandlerTable {
    handlers: RwLock<AHashMap<MessageKind, HandlerList>>,
}

impl HandlerTable {
    fn snapshot(&self, kind: MessageKind) -> Option<HandlerList> {
        self.handlers.read().unwrap().get(&kind).cloned()
    }

    fn deliver(&self, message: &InboundMessage) {
        let Some(handlers) = self.snapshot(message.kind) else {
            tracing::trace!(kind = %message.kind, "inbound message with no subscribers");
            return;
        };
        for (_, handler) in handlers.iter() {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                tracing::error!(kind = %message.kind, "message handler panicked");
            }
        }
    }
}

/// Routes decoded inbound messages to subscribers, on a dedicated scheduler
/// thread so handlers never run on the I/O threads or the sender tick.
///
/// The handler table is copy-on-write: delivery grabs an immutable snapshot
/// of a kind's handler list, so registration and unregistration are safe
/// against concurrent dispatch. A panicking handler is caught, logged, and
/// does not take the scheduler down.
pub struct Dispatcher {
    table: Arc<HandlerTable>,
    next_id: AtomicU64,
    tx: flume::Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        let table = Arc::new(HandlerTable::default());
        let (tx, rx) = flume::unbounded::<Job>();
        let worker_table = table.clone();
        let worker = std::thread::Builder::new()
            .name("simlink-dispatch".into())
            .spawn(move || {
                for job in rx.iter() {
                    match job {
                        Job::Deliver(message) => worker_table.deliver(&message),
                        Job::Run(f) => {
                            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                                tracing::error!("scheduled callback panicked");
                            }
                        }
                        Job::Stop => break,
                    }
                }
            })
            .expect("failed to spawn dispatch thread");
        Self {
            table,
            next_id: AtomicU64::new(1),
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Subscribes `handler` to messages of `kind`.
    pub fn register(&self, kind: MessageKind, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.table.handlers.write().unwrap();
        let mut next: Vec<_> = handlers
            .get(&kind)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default();
        next.push((id, handler));
        handlers.insert(kind, Arc::from(next));
        id
    }

    /// Removes a previously registered handler. Returns whether it was
    /// still subscribed.
    pub fn unregister(&self, kind: MessageKind, id: HandlerId) -> bool {
        let mut handlers = self.table.handlers.write().unwrap();
        let Some(list) = handlers.get(&kind) else {
            return false;
        };
        let next: Vec<_> = list
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        let removed = next.len() != list.len();
        if next.is_empty() {
            handlers.remove(&kind);
        } else {
            handlers.insert(kind, Arc::from(next));
        }
        removed
    }

    /// Enqueues a message for delivery on the scheduler thread.
    pub(crate) fn deliver(&self, message: InboundMessage) {
        let _ = self.tx.send(Job::Deliver(message));
    }

    /// Runs an arbitrary callback on the scheduler thread.
    pub(crate) fn run_async(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Job::Run(Box::new(f)));
    }

    /// Stops the scheduler thread after draining already queued jobs ahead
    /// of the stop marker.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Job::Stop);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("kinds", &self.table.handlers.read().unwrap().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use bytes::Bytes;
    use simlink_proto::bucket::TokenBucket;
    use uuid::Uuid;

    use super::*;
    use crate::{
        circuit::{Circuit, SessionInfo},
        config::TransportConfig,
    };

    fn message(kind: MessageKind) -> InboundMessage {
        let now = Instant::now();
        let circuit = Circuit::new(
            &SessionInfo {
                agent_id: Uuid::new_v4(),
                session_id: Uuid::new_v4(),
                circuit_code: 1,
                position: [0.0; 3],
                facing: [0.0; 3],
            },
            false,
            &TransportConfig::default(),
            &Arc::new(TokenBucket::new(0, 0, now)),
            now,
        );
        InboundMessage {
            circuit,
            kind,
            body: Bytes::from_static(b"body"),
            received_at: now,
        }
    }

    fn wait_for(counter: &AtomicUsize, expect: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < expect {
            assert!(Instant::now() < deadline, "dispatch did not arrive");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn delivers_to_subscribed_kind_only() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let seen = hits.clone();
        dispatcher.register(
            MessageKind(100),
            Arc::new(move |msg| {
                assert_eq!(MessageKind(100), msg.kind);
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        dispatcher.deliver(message(MessageKind(100)));
        dispatcher.deliver(message(MessageKind(200)));
        dispatcher.deliver(message(MessageKind(100)));

        wait_for(&hits, 2);
        dispatcher.shutdown();
        assert_eq!(2, hits.load(Ordering::SeqCst));
    }

    #[test]
    fn unregister_stops_delivery() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let seen = hits.clone();
        let id = dispatcher.register(
            MessageKind(5),
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        dispatcher.deliver(message(MessageKind(5)));
        wait_for(&hits, 1);

        assert!(dispatcher.unregister(MessageKind(5), id));
        assert!(!dispatcher.unregister(MessageKind(5), id));
        dispatcher.deliver(message(MessageKind(5)));
        dispatcher.shutdown();
        assert_eq!(1, hits.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_handler_does_not_stop_the_scheduler() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.register(
            MessageKind(9),
            Arc::new(|_| panic!("handler exploded")),
        );
        let seen = hits.clone();
        dispatcher.register(
            MessageKind(9),
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        dispatcher.deliver(message(MessageKind(9)));
        wait_for(&hits, 1);
        dispatcher.shutdown();
    }
}
