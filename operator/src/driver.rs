use crate::{
    committer::{StatusDelta, commit},
    converge::{Ensured, ManagedKind, ensure_resource},
    events,
    manager::Context,
    metrics::ReconcileMetrics,
    telemetry, Metrics,
};
use async_trait::async_trait;
use chrono::Utc;
use common::{
    Error, Phase, Result,
    conditions::{ApplicationCondition, POD_TEMPLATE_SPEC_VALID, READY},
    k8sworkload::parse_pod_template,
    platform::{Managed, Platform},
    status::{ObservedStatus, StatusResource},
};
use kube::{Resource, ResourceExt, runtime::controller::Action};
use std::{sync::Arc, time::Duration};
use tracing::{Span, debug, field, info, instrument, warn};

/// Result of one pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Converged, wait for the next change
    Done,
    /// Something outside of this object is not there yet
    Requeue(Duration),
    /// The object cannot be converged as written, retrying will not help
    Terminal(String),
}

impl From<Outcome> for Action {
    fn from(outcome: Outcome) -> Action {
        match outcome {
            Outcome::Done | Outcome::Terminal(_) => Action::await_change(),
            Outcome::Requeue(d) => Action::requeue(d),
        }
    }
}

/// Answer of the validation phases
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid(String),
    Wait(Duration),
}

/// Whether a phase lets the pass go on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    Requeue(Duration),
}

/// Per-kind behavior plugged into [`drive`].
///
/// Every phase writes what it learns into the delta, nothing is written to the status
/// before the single commit at the end of the pass.
#[async_trait]
pub trait Reconciler<P: Platform>: StatusResource {
    /// Finalizer owned by the kind, `None` when owner references are enough
    fn finalizer() -> Option<&'static str> {
        None
    }

    /// Structural and cross-reference checks
    async fn validate(&self, _ctx: &Context<P>, _delta: &mut StatusDelta<Self::Status>) -> Result<Verdict> {
        Ok(Verdict::Valid)
    }

    /// Create or update the managed resources
    async fn converge(&self, ctx: &Context<P>, delta: &mut StatusDelta<Self::Status>) -> Result<Step>;

    /// Derive phase, url and kind specific status fields from what is running
    async fn observe(&self, _ctx: &Context<P>, _delta: &mut StatusDelta<Self::Status>) -> Result<()> {
        Ok(())
    }

    /// Cleanup before the finalizer is dropped
    async fn finalize(&self, _ctx: &Context<P>) -> Result<Step> {
        Ok(Step::Continue)
    }

    fn metrics(metrics: &Metrics) -> &ReconcileMetrics;
}

/// Delay before looking again for a configuration created earlier in the pass
pub static CHECKSUM_BACKOFF: Duration = Duration::from_secs(5);
/// Retry delays after a failed pass
pub static CONFLICT_BACKOFF: Duration = Duration::from_secs(1);
pub static TRANSIENT_BACKOFF: Duration = Duration::from_secs(10);
pub static PERMANENT_BACKOFF: Duration = Duration::from_secs(60);

pub fn generation<K: Managed>(obj: &K) -> i64 {
    obj.meta().generation.unwrap_or_default()
}

/// The workload waits for its configuration `configmap` to be visible
pub fn waiting_for<S: ObservedStatus>(delta: &mut StatusDelta<S>, configmap: &str) -> Step {
    debug!("ConfigMap {configmap} is not visible yet");
    delta.phase(Phase::Pending, format!("Waiting for ConfigMap {configmap}"));
    Step::Requeue(CHECKSUM_BACKOFF)
}

/// A user supplied pod template must parse, its condition goes away with the field
pub fn validate_pod_template<S: ObservedStatus>(
    raw: Option<&serde_json::Value>,
    generation: i64,
    delta: &mut StatusDelta<S>,
) -> Verdict {
    let Some(raw) = raw else {
        delta.remove_condition(POD_TEMPLATE_SPEC_VALID);
        return Verdict::Valid;
    };
    if let Err(e) = parse_pod_template(raw) {
        let msg = e.to_string();
        delta.condition(ApplicationCondition::ko(POD_TEMPLATE_SPEC_VALID, "InvalidPodTemplateSpec", &msg, generation));
        return Verdict::Invalid(msg);
    }
    delta.condition(ApplicationCondition::ok(
        POD_TEMPLATE_SPEC_VALID,
        "ValidPodTemplateSpec",
        "podTemplateSpec is valid",
        generation,
    ));
    Verdict::Valid
}

fn has_finalizer<K: Managed>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Publish an event about `obj`, failures are only logged
pub async fn publish<P: Platform, K: Managed>(ctx: &Context<P>, obj: &K, ev: kube::runtime::events::Event) {
    if let Err(e) = ctx.platform.publish(&obj.object_ref(&()), ev).await {
        warn!("Failed to publish an event for {} {}: {e}", K::kind(&()), obj.name_any());
    }
}

/// Converge one managed resource of `owner`, with a Normal event on every write
pub async fn ensure<P: Platform, O: Managed, K: ManagedKind>(
    ctx: &Context<P>,
    owner: &O,
    desired: &K,
) -> Result<Ensured> {
    let res = ensure_resource(&ctx.platform, desired).await?;
    let ev = match &res {
        Ensured::Created => events::from_create(&O::kind(&()), &owner.name_any(), &K::kind(&()), &desired.name_any()),
        Ensured::Updated(fields) => events::from_update(
            &O::kind(&()),
            &owner.name_any(),
            &K::kind(&()),
            &desired.name_any(),
            fields,
        ),
        Ensured::Unchanged => return Ok(res),
    };
    publish(ctx, owner, ev).await;
    Ok(res)
}

/// One reconcile pass for `ns/name`.
///
/// Fetch, deletion, finalizer, validation, convergence, observation, then a single status commit.
pub async fn drive<P: Platform, K: Reconciler<P>>(ctx: &Context<P>, ns: &str, name: &str) -> Result<Outcome> {
    // ── Fetch ─────────────────────────────────────────────────────────────
    let Some(obj) = ctx.platform.get::<K>(ns, name).await? else {
        debug!("{} {ns}/{name} is gone", K::kind(&()));
        return Ok(Outcome::Done);
    };
    let generation = generation(&obj);

    // ── Deletion ──────────────────────────────────────────────────────────
    if obj.meta().deletion_timestamp.is_some() {
        return match K::finalizer() {
            Some(finalizer) if has_finalizer(&obj, finalizer) => match obj.finalize(ctx).await? {
                Step::Requeue(d) => Ok(Outcome::Requeue(d)),
                Step::Continue => {
                    let mut released = obj.clone();
                    released.finalizers_mut().retain(|f| f != finalizer);
                    info!("Releasing {} {ns}/{name}", K::kind(&()));
                    ctx.platform.replace(ns, &released).await?;
                    Ok(Outcome::Done)
                }
            },
            Some(_) => Ok(Outcome::Done),
            None => {
                let mut delta = StatusDelta::new();
                delta.phase(Phase::Terminating, format!("{} is being deleted", K::kind(&())));
                commit::<P, K>(&ctx.platform, ns, name, delta).await?;
                Ok(Outcome::Done)
            }
        };
    }

    // ── Finalizer ─────────────────────────────────────────────────────────
    let obj = match K::finalizer() {
        Some(finalizer) if !has_finalizer(&obj, finalizer) => {
            let mut guarded = obj.clone();
            guarded.finalizers_mut().push(finalizer.to_string());
            ctx.platform.replace(ns, &guarded).await?
        }
        _ => obj,
    };

    // ── Validation ────────────────────────────────────────────────────────
    let mut delta = StatusDelta::new();
    match obj.validate(ctx, &mut delta).await? {
        Verdict::Valid => {}
        Verdict::Invalid(message) => {
            warn!("{} {ns}/{name} is invalid: {message}", K::kind(&()));
            if !delta.carries(READY) {
                delta.condition(ApplicationCondition::ko(READY, "ValidationFailed", &message, generation));
            }
            delta.phase(Phase::Failed, message.clone());
            delta.observed_generation(generation);
            publish(ctx, &obj, events::invalid(&K::kind(&()), name, &message)).await;
            commit::<P, K>(&ctx.platform, ns, name, delta).await?;
            return Ok(Outcome::Terminal(message));
        }
        Verdict::Wait(d) => {
            commit::<P, K>(&ctx.platform, ns, name, delta).await?;
            return Ok(Outcome::Requeue(d));
        }
    }

    // ── Convergence ───────────────────────────────────────────────────────
    if let Step::Requeue(d) = obj.converge(ctx, &mut delta).await? {
        commit::<P, K>(&ctx.platform, ns, name, delta).await?;
        return Ok(Outcome::Requeue(d));
    }

    // ── Observation and commit ────────────────────────────────────────────
    obj.observe(ctx, &mut delta).await?;
    delta.observed_generation(generation);
    commit::<P, K>(&ctx.platform, ns, name, delta).await?;
    Ok(Outcome::Done)
}

// ── Controller entry points ───────────────────────────────────────────────────

/// Entry point called by the kube controller. Wires tracing and metrics then [`drive`]s the object.
#[instrument(skip(ctx, obj), fields(trace_id))]
pub async fn reconcile<P: Platform, K: Reconciler<P>>(obj: Arc<K>, ctx: Arc<Context<P>>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _mes = K::metrics(&ctx.metrics).count_and_measure(&trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = obj
        .namespace()
        .ok_or_else(|| Error::Validation(format!("{} {} has no namespace", K::kind(&()), obj.name_any())))?;
    let outcome = drive::<P, K>(&ctx, &ns, &obj.name_any()).await?;
    Ok(outcome.into())
}

fn retry_delay(error: &Error) -> Duration {
    match error {
        // somebody else wrote first, the next pass reads their version
        Error::Conflict(_) => CONFLICT_BACKOFF,
        e if e.is_transient() => TRANSIENT_BACKOFF,
        _ => PERMANENT_BACKOFF,
    }
}

#[must_use]
pub fn error_policy<P: Platform, K: Reconciler<P>>(obj: Arc<K>, error: &Error, ctx: Arc<Context<P>>) -> Action {
    let instance = format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any());
    warn!("reconcile failed for {} '{instance}': {:?}", K::kind(&()), error);
    K::metrics(&ctx.metrics).reconcile_failure(&instance, error);
    Action::requeue(retry_delay(error))
}
