//! Broadcast dispatcher.
//!
//! Published messages go through an unbounded queue to a single delivery
//! worker, which fans each one out to a registry snapshot. Publishers are
//! never blocked by delivery, and because one worker handles messages in
//! queue order, every connection sees broadcasts in publish order with no
//! interleaving inside a frame.

use crate::message::Message;
use crate::registry::Registry;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Dispatcher errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The dispatcher has stopped accepting messages.
    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

/// Outcome of delivering one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections in the snapshot.
    pub recipients: usize,
    /// Connections the frame was queued to.
    pub delivered: usize,
    /// Connections dropped because their transport was gone.
    pub dropped: usize,
}

/// Deliver `message` to every connection currently in `registry`.
///
/// A connection whose sink fails is unregistered and counted as dropped;
/// failures never stop delivery to the rest of the snapshot.
pub fn deliver(registry: &Registry, message: &Message) -> DeliveryReport {
    let snapshot = registry.snapshot();
    let mut report = DeliveryReport {
        recipients: snapshot.len(),
        ..DeliveryReport::default()
    };

    for connection in snapshot {
        match connection.deliver(message.frame().clone()) {
            Ok(()) => {
                trace!(connection = %connection.id(), "Frame queued");
                report.delivered += 1;
            }
            Err(e) => {
                debug!(connection = %connection.id(), error = %e, "Dropping connection after failed delivery");
                registry.unregister(connection.id().as_str());
                report.dropped += 1;
            }
        }
    }

    report
}

struct Job {
    message: Message,
    done: Option<oneshot::Sender<DeliveryReport>>,
}

/// Queue plus delivery worker.
pub struct Dispatcher {
    queue: mpsc::UnboundedSender<Job>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the delivery worker on the current tokio runtime.
    #[must_use]
    pub fn spawn(registry: Arc<Registry>) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(run_worker(registry, rx, shutdown_rx));

        Self {
            queue,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Publish a message and wait until it has been handed to every sink in
    /// the snapshot taken for it.
    ///
    /// Connections registered after this returns never see the message.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ShutdownInProgress`] once shutdown has begun.
    pub async fn publish(
        &self,
        message: impl Into<Message>,
    ) -> Result<DeliveryReport, DispatchError> {
        let (done, report) = oneshot::channel();
        self.enqueue(Job {
            message: message.into(),
            done: Some(done),
        })?;
        report.await.map_err(|_| DispatchError::ShutdownInProgress)
    }

    /// Publish a message without waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ShutdownInProgress`] once shutdown has begun.
    pub fn publish_detached(&self, message: impl Into<Message>) -> Result<(), DispatchError> {
        self.enqueue(Job {
            message: message.into(),
            done: None,
        })
    }

    fn enqueue(&self, job: Job) -> Result<(), DispatchError> {
        if *self.shutdown.borrow() {
            return Err(DispatchError::ShutdownInProgress);
        }
        self.queue
            .send(job)
            .map_err(|_| DispatchError::ShutdownInProgress)
    }

    /// Stop accepting messages, deliver everything already queued, and wait
    /// for the worker to exit.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Dispatcher worker ended abnormally");
            }
        }
    }
}

async fn run_worker(
    registry: Arc<Registry>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Dispatcher worker started");

    loop {
        tokio::select! {
            biased;

            job = rx.recv() => match job {
                Some(job) => run_job(&registry, job),
                None => break,
            },

            _ = shutdown.changed() => {
                rx.close();
                let mut drained = 0usize;
                while let Some(job) = rx.recv().await {
                    run_job(&registry, job);
                    drained += 1;
                }
                info!(drained, "Dispatcher queue drained");
                break;
            }
        }
    }

    debug!("Dispatcher worker stopped");
}

fn run_job(registry: &Registry, job: Job) {
    let report = deliver(registry, &job.message);
    trace!(
        recipients = report.recipients,
        delivered = report.delivered,
        dropped = report.dropped,
        "Broadcast delivered"
    );
    if let Some(done) = job.done {
        // The publisher may have stopped waiting.
        let _ = done.send(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{channel_sink, ConnectionState, FrameSink, SinkError};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn register(registry: &Registry) -> (String, UnboundedReceiver<Bytes>) {
        let (sink, rx) = channel_sink();
        let reg = registry.register(Box::new(sink)).unwrap();
        (reg.id.to_string(), rx)
    }

    struct FailingSink;

    impl FrameSink for FailingSink {
        fn send(&self, _frame: Bytes) -> Result<(), SinkError> {
            Err(SinkError::Gone)
        }
    }

    struct CountingSink(Arc<AtomicUsize>);

    impl FrameSink for CountingSink {
        fn send(&self, _frame: Bytes) -> Result<(), SinkError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_deliver_to_all() {
        let registry = Registry::new();
        let mut receivers: Vec<_> = (0..3).map(|_| register(&registry).1).collect();

        let report = deliver(&registry, &Message::new("hello"));
        assert_eq!(
            report,
            DeliveryReport {
                recipients: 3,
                delivered: 3,
                dropped: 0
            }
        );

        for rx in &mut receivers {
            assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"5;hello;"));
        }
    }

    #[test]
    fn test_failed_sink_is_unregistered() {
        let registry = Registry::new();
        let (_, mut rx1) = register(&registry);
        let (_, mut rx2) = register(&registry);
        let failing = registry.register(Box::new(FailingSink)).unwrap();

        let report = deliver(&registry, &Message::new("hello"));

        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(rx1.try_recv().unwrap(), Bytes::from_static(b"5;hello;"));
        assert_eq!(rx2.try_recv().unwrap(), Bytes::from_static(b"5;hello;"));
        assert!(registry.lookup(failing.id.as_str()).is_none());
        assert_eq!(failing.lifecycle.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_dropped_receiver_is_unregistered() {
        let registry = Registry::new();
        let (id, rx) = register(&registry);
        drop(rx);

        let report = deliver(&registry, &Message::new("x"));
        assert_eq!(report.dropped, 1);
        assert!(registry.lookup(&id).is_none());
    }

    #[test]
    fn test_closing_connection_is_skipped() {
        let registry = Registry::new();
        let (id, mut rx) = register(&registry);
        registry.request_close(&id);

        let report = deliver(&registry, &Message::new("x"));
        assert_eq!(report.delivered, 0);
        assert!(rx.try_recv().is_err());
        assert!(registry.lookup(&id).is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_only_registered_connections() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::spawn(Arc::clone(&registry));
        let mut receivers: Vec<_> = (0..3).map(|_| register(&registry).1).collect();

        let report = dispatcher.publish("hello").await.unwrap();
        assert_eq!(report.delivered, 3);

        let (_, mut late) = register(&registry);
        for rx in &mut receivers {
            assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"5;hello;"));
        }
        assert!(late.try_recv().is_err());

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_per_connection_fifo() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::spawn(Arc::clone(&registry));
        let (_, mut rx) = register(&registry);

        for i in 0..100 {
            dispatcher.publish_detached(format!("m{i}")).unwrap();
        }
        dispatcher.publish("end").await.unwrap();

        for i in 0..100 {
            let expected = trickle_protocol::encode(&format!("m{i}"));
            assert_eq!(rx.recv().await.unwrap(), expected);
        }
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"3;end;"));

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue_then_rejects() {
        let registry = Arc::new(Registry::new());
        let counter = Arc::new(AtomicUsize::new(0));
        registry
            .register(Box::new(CountingSink(Arc::clone(&counter))))
            .unwrap();

        let dispatcher = Dispatcher::spawn(Arc::clone(&registry));
        for _ in 0..10 {
            dispatcher.publish_detached("queued").unwrap();
        }
        dispatcher.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(
            dispatcher.publish("late").await.unwrap_err(),
            DispatchError::ShutdownInProgress
        );
        assert_eq!(
            dispatcher.publish_detached("late").unwrap_err(),
            DispatchError::ShutdownInProgress
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publishers() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Arc::new(Dispatcher::spawn(Arc::clone(&registry)));
        let mut receivers: Vec<_> = (0..5).map(|_| register(&registry).1).collect();

        let publishers: Vec<_> = (0..4)
            .map(|p| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    for i in 0..25 {
                        dispatcher.publish(format!("p{p}-{i}")).await.unwrap();
                    }
                })
            })
            .collect();
        for publisher in publishers {
            publisher.await.unwrap();
        }

        // Every receiver sees the same global order, and each publisher's
        // own messages in the order it sent them.
        let mut orders = Vec::new();
        for rx in &mut receivers {
            let mut order = Vec::new();
            while let Ok(frame) = rx.try_recv() {
                order.push(frame);
            }
            assert_eq!(order.len(), 100);
            orders.push(order);
        }
        assert!(orders.windows(2).all(|w| w[0] == w[1]));

        dispatcher.shutdown().await;
    }
}
