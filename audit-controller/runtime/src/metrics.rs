use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct AdmissionMetrics {
    reviews: Family<ResultLabels, Counter>,
}

#[derive(Clone, Debug, Default)]
pub struct PipelineMetrics {
    enqueued: Counter,
    dropped: Family<ReasonLabels, Counter>,
    persisted: Counter,
    store_errors: Counter,
    panics: Counter,
}

#[derive(Clone, Debug, Default)]
pub struct AlertMetrics {
    sent: Counter,
    failed: Counter,
}

#[derive(Clone, Debug, Default)]
pub struct AuditMetrics {
    entries: Family<ResultLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ResultLabels {
    result: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ReasonLabels {
    reason: &'static str,
}

/// Why the pipeline discarded an event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The queue was at capacity.
    Full,
    /// The pipeline stopped accepting events.
    Closed,
    /// The event was still queued when the drain grace period expired.
    Shutdown,
    /// The store rejected the event after all retries.
    Store,
}

// === impl DropReason ===

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Closed => "closed",
            Self::Shutdown => "shutdown",
            Self::Store => "store",
        }
    }
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reviews = Family::default();
        reg.register(
            "reviews",
            "Count of admission reviews by result",
            reviews.clone(),
        );
        Self { reviews }
    }

    pub(crate) fn inc(&self, result: &'static str) {
        self.reviews.get_or_create(&ResultLabels { result }).inc();
    }

    #[cfg(test)]
    pub(crate) fn get(&self, result: &'static str) -> u64 {
        self.reviews.get_or_create(&ResultLabels { result }).get()
    }
}

// === impl PipelineMetrics ===

impl PipelineMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let enqueued = Counter::default();
        reg.register(
            "enqueued",
            "Count of events accepted into the queue",
            enqueued.clone(),
        );

        let dropped = Family::default();
        reg.register(
            "dropped",
            "Count of events discarded by the pipeline",
            dropped.clone(),
        );

        let persisted = Counter::default();
        reg.register(
            "persisted",
            "Count of events saved to the store",
            persisted.clone(),
        );

        let store_errors = Counter::default();
        reg.register(
            "store_errors",
            "Count of failed store writes, including retried attempts",
            store_errors.clone(),
        );

        let panics = Counter::default();
        reg.register(
            "panics",
            "Count of events whose processing panicked",
            panics.clone(),
        );

        Self {
            enqueued,
            dropped,
            persisted,
            store_errors,
            panics,
        }
    }

    pub(crate) fn enqueued(&self) {
        self.enqueued.inc();
    }

    pub(crate) fn dropped(&self, reason: DropReason) {
        self.dropped_by(reason, 1);
    }

    pub(crate) fn dropped_by(&self, reason: DropReason, n: u64) {
        self.dropped
            .get_or_create(&ReasonLabels {
                reason: reason.as_str(),
            })
            .inc_by(n);
    }

    pub(crate) fn persisted(&self) {
        self.persisted.inc();
    }

    pub(crate) fn store_error(&self) {
        self.store_errors.inc();
    }

    pub(crate) fn panicked(&self) {
        self.panics.inc();
    }

    #[cfg(test)]
    pub(crate) fn dropped_count(&self, reason: DropReason) -> u64 {
        self.dropped
            .get_or_create(&ReasonLabels {
                reason: reason.as_str(),
            })
            .get()
    }

    #[cfg(test)]
    pub(crate) fn persisted_count(&self) -> u64 {
        self.persisted.get()
    }

    #[cfg(test)]
    pub(crate) fn panic_count(&self) -> u64 {
        self.panics.get()
    }
}

// === impl AlertMetrics ===

impl AlertMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let sent = Counter::default();
        reg.register("sent", "Count of delivered alert notifications", sent.clone());

        let failed = Counter::default();
        reg.register(
            "failed",
            "Count of alert notifications that failed or timed out",
            failed.clone(),
        );

        Self { sent, failed }
    }

    pub(crate) fn sent(&self) {
        self.sent.inc();
    }

    pub(crate) fn failed(&self) {
        self.failed.inc();
    }

    #[cfg(test)]
    pub(crate) fn counts(&self) -> (u64, u64) {
        (self.sent.get(), self.failed.get())
    }
}

// === impl AuditMetrics ===

impl AuditMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let entries = Family::default();
        reg.register(
            "entries",
            "Count of audit log entries by result",
            entries.clone(),
        );
        Self { entries }
    }

    pub(crate) fn inc(&self, result: &'static str) {
        self.entries.get_or_create(&ResultLabels { result }).inc();
    }

    #[cfg(test)]
    pub(crate) fn get(&self, result: &'static str) -> u64 {
        self.entries.get_or_create(&ResultLabels { result }).get()
    }
}
