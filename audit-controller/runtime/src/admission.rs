//! Validating admission decisions.
//!
//! A review is decided entirely from the active policy snapshot. The only
//! side effect is a non-blocking offer to the event pipeline, so the response
//! never waits on storage or alert delivery.

use crate::{metrics::AdmissionMetrics, pipeline::EventSink, policy::Policy};
use anyhow::{anyhow, Result};
use kube::core::{admission, DynamicObject};
use kubetrail_controller_core::{Actor, ChangeEvent, Decision, Mutation, Operation};
use tracing::{debug, info, trace, warn};

type AdmissionRequest = admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = admission::AdmissionResponse;
pub(crate) type AdmissionReview = admission::AdmissionReview<DynamicObject>;

#[derive(Clone, Debug)]
pub struct Admission {
    policy: Policy,
    sink: EventSink,
    record_blocked: bool,
    metrics: AdmissionMetrics,
}

// === impl Admission ===

impl Admission {
    pub fn new(policy: Policy, sink: EventSink, metrics: AdmissionMetrics) -> Self {
        Self {
            policy,
            sink,
            record_blocked: false,
            metrics,
        }
    }

    /// Also records blocked requests, with a `Blocked` decision.
    pub fn with_record_blocked(mut self, record_blocked: bool) -> Self {
        self.record_blocked = record_blocked;
        self
    }

    /// Decides a serialized `AdmissionReview`. Unparseable input is denied.
    pub fn review_body(&self, body: &[u8]) -> AdmissionReview {
        let review: AdmissionReview = match serde_json::from_slice(body) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "Failed to parse request body");
                self.metrics.inc("invalid");
                return AdmissionResponse::invalid(error).into_review();
            }
        };
        trace!(?review);

        let rsp = match review.try_into() {
            Ok(req) => self.review(req),
            Err(error) => {
                warn!(%error, "Invalid admission request");
                self.metrics.inc("invalid");
                AdmissionResponse::invalid(error)
            }
        };
        debug!(?rsp);
        rsp.into_review()
    }

    pub fn review(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let dry_run = req.dry_run;

        let mutation = match to_mutation(req) {
            Ok(mutation) => mutation,
            Err(error) => {
                warn!(%error, "Invalid admission request");
                self.metrics.inc("invalid");
                return rsp.deny(format!("invalid admission request: {error}"));
            }
        };

        let policy = self.policy.current();

        if let Some(rule) = policy.blocking_rule(&mutation) {
            info!(
                kind = %mutation.kind,
                ns = %mutation.namespace,
                resource = %mutation.name,
                op = %mutation.operation,
                user = %mutation.actor.username,
                %rule,
                "Denied"
            );
            let reason = format!("blocked by policy rule {rule}");
            if self.record_blocked && !dry_run {
                self.sink
                    .try_enqueue(ChangeEvent::new(mutation, Decision::Blocked));
            }
            self.metrics.inc("denied");
            return rsp.deny(reason);
        }
        self.metrics.inc("allowed");

        if dry_run {
            trace!("Dry run; not recording");
            return rsp;
        }

        if policy.is_ignored(&mutation) {
            trace!(ns = %mutation.namespace, resource = %mutation.name, "Ignored by policy");
            return rsp;
        }

        // The response is the same whether or not the pipeline has room.
        self.sink
            .try_enqueue(ChangeEvent::new(mutation, Decision::Allowed));
        rsp
    }
}

fn to_mutation(req: AdmissionRequest) -> Result<Mutation> {
    let operation = match req.operation {
        admission::Operation::Create => Operation::Create,
        admission::Operation::Update => Operation::Update,
        admission::Operation::Delete => Operation::Delete,
        admission::Operation::Connect => Operation::Connect,
    };

    let old_object = req.old_object.as_ref().map(serde_json::to_value).transpose()?;
    let new_object = req.object.as_ref().map(serde_json::to_value).transpose()?;

    // Creates with `generateName` are reviewed before a name is assigned.
    let name = if req.name.is_empty() {
        req.object
            .as_ref()
            .or(req.old_object.as_ref())
            .and_then(|o| o.metadata.name.clone().or(o.metadata.generate_name.clone()))
            .unwrap_or_default()
    } else {
        req.name
    };

    if req.kind.kind.is_empty() {
        return Err(anyhow!("admission request has no kind"));
    }

    Ok(Mutation {
        timestamp: None,
        kind: req.kind.kind,
        namespace: req.namespace.unwrap_or_default(),
        name,
        operation,
        actor: Actor {
            username: req.user_info.username.unwrap_or_default(),
            groups: req.user_info.groups.unwrap_or_default(),
        },
        old_object,
        new_object,
        source_ip: None,
        user_agent: None,
    })
}
