//! The bounded event queue shared by admission and audit producers, and the
//! worker pool that persists and alerts on its events.
//!
//! Producers enqueue through an [`EventSink`], which never waits: a full
//! queue drops the event and counts it. Workers save each event to the
//! [`Store`], retrying failed writes with exponential backoff, and hand
//! persisted events to the [`AlertRouter`].

use crate::{
    alert::AlertRouter,
    metrics::{DropReason, PipelineMetrics},
};
use futures::{future, FutureExt};
use kubetrail_controller_core::{ChangeEvent, Store};
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        Mutex,
    },
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Copy, Clone, Debug)]
pub struct PipelineConfig {
    pub capacity: usize,
    pub workers: usize,
    pub retry: Backoff,
}

/// Delays between store write attempts: `base`, `base * factor`, ...
#[derive(Copy, Clone, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub factor: u32,
    pub retries: u32,
}

/// A cloneable, non-blocking handle for enqueueing events.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<ChangeEvent>,
    closed: CancellationToken,
    metrics: PipelineMetrics,
}

pub struct EventPipeline {
    sink: EventSink,
    rx: Arc<Mutex<mpsc::Receiver<ChangeEvent>>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicU64>,
    store: Arc<dyn Store>,
    metrics: PipelineMetrics,
}

#[derive(Clone)]
struct Worker {
    rx: Arc<Mutex<mpsc::Receiver<ChangeEvent>>>,
    closed: CancellationToken,
    in_flight: Arc<AtomicU64>,
    store: Arc<dyn Store>,
    router: AlertRouter,
    retry: Backoff,
    metrics: PipelineMetrics,
}

// === impl PipelineConfig ===

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            workers: 4,
            retry: Backoff::default(),
        }
    }
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            factor: 4,
            retries: 3,
        }
    }
}

impl Backoff {
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let Self {
            base,
            factor,
            retries,
        } = *self;
        (0..retries).map(move |i| base * factor.pow(i))
    }
}

// === impl EventSink ===

impl EventSink {
    /// Offers an event to the queue. Returns false if the event was dropped
    /// because the queue is full or the pipeline is shutting down.
    pub fn try_enqueue(&self, event: ChangeEvent) -> bool {
        if self.closed.is_cancelled() {
            self.metrics.dropped(DropReason::Closed);
            debug!(event = %event.id, "Pipeline closed; dropping event");
            return false;
        }

        match self.tx.try_send(event) {
            Ok(()) => {
                self.metrics.enqueued();
                true
            }
            Err(TrySendError::Full(event)) => {
                self.metrics.dropped(DropReason::Full);
                debug!(event = %event.id, "Queue full; dropping event");
                false
            }
            Err(TrySendError::Closed(event)) => {
                self.metrics.dropped(DropReason::Closed);
                debug!(event = %event.id, "Pipeline closed; dropping event");
                false
            }
        }
    }
}

// === impl EventPipeline ===

impl EventPipeline {
    /// Spawns the worker pool.
    pub fn start(
        config: PipelineConfig,
        store: Arc<dyn Store>,
        router: AlertRouter,
        metrics: PipelineMetrics,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let closed = CancellationToken::new();
        let in_flight = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            rx: rx.clone(),
            closed: closed.clone(),
            in_flight: in_flight.clone(),
            store: store.clone(),
            router,
            retry: config.retry,
            metrics: metrics.clone(),
        };
        let workers = (0..config.workers.max(1))
            .map(|id| {
                let worker = worker.clone();
                tokio::spawn(worker.run().instrument(info_span!("worker", id)))
            })
            .collect();

        Self {
            sink: EventSink {
                tx,
                closed,
                metrics: metrics.clone(),
            },
            rx,
            workers,
            in_flight,
            store,
            metrics,
        }
    }

    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    /// Stops accepting events and processes what is already queued. Events
    /// still queued or in progress when `grace` elapses are abandoned and
    /// counted as dropped. Returns the number of abandoned events.
    pub async fn drain(self, grace: Duration) -> u64 {
        let Self {
            sink,
            rx,
            mut workers,
            in_flight,
            store,
            metrics,
        } = self;

        info!(?grace, "Draining event pipeline");
        sink.closed.cancel();

        if time::timeout(grace, future::join_all(workers.iter_mut()))
            .await
            .is_err()
        {
            for worker in &workers {
                worker.abort();
            }
            future::join_all(workers).await;
        }

        let mut abandoned = in_flight.load(Ordering::Acquire);
        {
            let mut rx = rx.lock().await;
            rx.close();
            while rx.try_recv().is_ok() {
                abandoned += 1;
            }
        }

        if abandoned > 0 {
            metrics.dropped_by(DropReason::Shutdown, abandoned);
            warn!(abandoned, "Grace period expired; abandoned queued events");
        } else {
            info!("Event pipeline drained");
        }

        if let Err(error) = store.close().await {
            error!(%error, "Failed to close store");
        }
        abandoned
    }
}

// === impl Worker ===

impl Worker {
    async fn run(self) {
        while let Some(event) = self.next().await {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            let span = info_span!(
                "event",
                id = %event.id,
                ns = %event.namespace,
                resource = %event.name,
                op = %event.operation,
            );
            let res = AssertUnwindSafe(self.process(event).instrument(span))
                .catch_unwind()
                .await;
            if res.is_err() {
                self.metrics.panicked();
                error!("Event processing panicked");
            }
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        debug!("Worker stopped");
    }

    /// Waits for the next event. Once the pipeline is closed, only events
    /// already queued are returned.
    async fn next(&self) -> Option<ChangeEvent> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => rx.try_recv().ok(),
            event = rx.recv() => event,
        }
    }

    async fn process(&self, event: ChangeEvent) {
        let mut delays = self.retry.delays();
        loop {
            match self.store.save(&event).await {
                Ok(()) => break,
                Err(error) => {
                    self.metrics.store_error();
                    match delays.next() {
                        Some(delay) => {
                            debug!(%error, ?delay, "Failed to persist event; retrying");
                            time::sleep(delay).await;
                        }
                        None => {
                            self.metrics.dropped(DropReason::Store);
                            error!(%error, "Failed to persist event; dropping");
                            return;
                        }
                    }
                }
            }
        }

        self.metrics.persisted();
        self.router.dispatch(&Arc::new(event));
    }
}
