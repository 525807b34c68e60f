//! DNS reconciliation engine
//!
//! Converges the records at one hostname toward a single desired record.
//!
//! ## Pass
//!
//! ```text
//! zone_id ──▶ list_records ──▶ classify ──▶ execute ──▶ ReconciliationOutcome
//!                                              │
//!                                              └── undo log (one step per mutation)
//! ```
//!
//! Every pass re-reads the zone; nothing is cached between passes. Mutations
//! are a small saga: each applied step records its inverse, and a step that
//! fails undoes the ones before it (newest first). A retriable provider error
//! (throttling, 5xx) restarts the whole pass after a backoff, so the retry acts
//! on fresh state rather than on the listing that preceded the failure.

mod decision;

pub use decision::{ReconciliationDecision, UnresolvableReason, classify, competing_records};

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DnsConfig;
use crate::error::{Error, FailureContext, Result};
use crate::traits::{DnsProvider, DnsRecord, RecordSpec, RecordType};

/// Per-call overrides of the reconciler's defaults
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// TTL of the written record
    pub ttl: Option<u32>,
    /// Proxied flag of the written record
    pub proxied: Option<bool>,
    /// Host suffix that tunnel targets live under
    pub tunnel_target_suffix: Option<String>,
    /// Stops retrying; observed before each pass and during backoff
    pub cancel: Option<CancellationToken>,
}

/// Inverse of one applied mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoStep {
    /// A record was created; undo by deleting it
    DeleteCreated { zone_id: String, record_id: String },
    /// A record was overwritten; undo by writing its prior fields back
    Restore {
        zone_id: String,
        record_id: String,
        prior: RecordSpec,
    },
    /// A record was deleted; undo by creating it again
    Recreate { zone_id: String, prior: RecordSpec },
}

/// Result of one reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationOutcome {
    /// Hostname that was reconciled
    pub hostname: String,
    /// Zone that owns the hostname
    pub zone_id: String,
    /// The decision computed from the zone's state
    pub decision: ReconciliationDecision,
    /// The record that now points the hostname at the target, if any
    pub record: Option<DnsRecord>,
    /// Inverses of the applied mutations, oldest first
    pub undo: Vec<UndoStep>,
}

impl ReconciliationOutcome {
    /// Whether the zone now holds the desired record
    pub fn is_converged(&self) -> bool {
        !matches!(self.decision, ReconciliationDecision::Unresolvable { .. })
    }

    /// Whether this outcome mutated the zone
    pub fn changed(&self) -> bool {
        !self.undo.is_empty()
    }

    /// Turn an unresolvable outcome into its error
    pub fn ensure_converged(self) -> Result<Self> {
        match self.decision {
            ReconciliationDecision::Unresolvable {
                reason: UnresolvableReason::CrossAccountConflict { ref message },
            } => Err(Error::cross_account(format!("{}: {}", self.hostname, message))),
            ReconciliationDecision::Unresolvable { ref reason } => {
                Err(Error::ambiguous(format!("{}: {}", self.hostname, reason)))
            }
            _ => Ok(self),
        }
    }
}

/// Reconciles DNS records through a [`DnsProvider`]
pub struct Reconciler {
    provider: Arc<dyn DnsProvider>,
    config: DnsConfig,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("provider", &self.provider.provider_name())
            .field("config", &self.config)
            .finish()
    }
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(provider: Arc<dyn DnsProvider>, config: DnsConfig) -> Self {
        Self { provider, config }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }

    /// DNS settings in use
    pub fn config(&self) -> &DnsConfig {
        &self.config
    }

    /// CNAME target of a named tunnel: `<tunnel-id>.<tunnel_target_suffix>`
    pub fn tunnel_target(&self, tunnel_id: &str) -> String {
        format!(
            "{}.{}",
            tunnel_id.trim(),
            self.config.tunnel_target_suffix.trim().trim_start_matches('.')
        )
    }

    /// Converge `hostname` to one record of `record_type` pointing at `content`
    ///
    /// Returns `Ok` with an `Unresolvable` decision when the engine declines
    /// to act; use [`ReconciliationOutcome::ensure_converged`] to treat that as
    /// an error.
    pub async fn reconcile(
        &self,
        hostname: &str,
        record_type: RecordType,
        content: &str,
        options: &ReconcileOptions,
    ) -> Result<ReconciliationOutcome> {
        let desired = RecordSpec::new(record_type, hostname.trim().trim_end_matches('.'), content.trim())
            .with_ttl(options.ttl.unwrap_or(self.config.ttl))
            .with_proxied(options.proxied.unwrap_or(self.config.proxied));
        let suffix = options
            .tunnel_target_suffix
            .as_deref()
            .unwrap_or(&self.config.tunnel_target_suffix);

        let cancel = options.cancel.clone().unwrap_or_default();

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(&desired.name));
            }
            match self.reconcile_once(&desired, suffix).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retriable() && attempt < self.config.max_rate_limit_retries => {
                    let delay = self.backoff(attempt, e.retry_after());
                    attempt += 1;
                    warn!(
                        hostname = %desired.name,
                        attempt,
                        max = self.config.max_rate_limit_retries,
                        ?delay,
                        error = %e,
                        "DNS reconciliation failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(cancelled(&desired.name)),
                    }
                }
                Err(e) => {
                    warn!(hostname = %desired.name, kind = %e.kind(), error = %e, "DNS reconciliation failed");
                    return Err(e);
                }
            }
        }
    }

    /// Undo the mutations recorded in `outcome`, newest first
    ///
    /// Records already gone count as undone. Returns the first error after
    /// attempting every step.
    pub async fn rollback(&self, outcome: &ReconciliationOutcome) -> Result<()> {
        if outcome.undo.is_empty() {
            debug!(hostname = %outcome.hostname, "Nothing to roll back");
            return Ok(());
        }

        info!(
            hostname = %outcome.hostname,
            steps = outcome.undo.len(),
            "Rolling back DNS changes"
        );

        match self.undo_steps(&outcome.hostname, &outcome.undo).await {
            (_, Some(e)) => Err(e),
            (_, None) => Ok(()),
        }
    }

    /// Replay `steps` newest first
    ///
    /// Returns the steps that could not be undone (oldest first) and the first
    /// error.
    async fn undo_steps(&self, hostname: &str, steps: &[UndoStep]) -> (Vec<UndoStep>, Option<Error>) {
        let mut pending = Vec::new();
        let mut first_error = None;
        for step in steps.iter().rev() {
            if let Err(e) = self.undo_step(step).await {
                warn!(hostname, ?step, error = %e, "Rollback step failed");
                pending.push(step.clone());
                first_error.get_or_insert(e);
            }
        }
        pending.reverse();
        (pending, first_error)
    }

    async fn reconcile_once(&self, desired: &RecordSpec, suffix: &str) -> Result<ReconciliationOutcome> {
        let zone_id = self.provider.zone_id(&desired.name).await?;
        let existing = self.provider.list_records(&zone_id, &desired.name).await?;
        let decision = classify(&existing, desired, suffix);

        info!(
            hostname = %desired.name,
            zone_id = %zone_id,
            existing = existing.len(),
            decision = decision.label(),
            "DNS reconciliation decision"
        );

        let mut outcome = ReconciliationOutcome {
            hostname: desired.name.clone(),
            zone_id: zone_id.clone(),
            decision: decision.clone(),
            record: None,
            undo: Vec::new(),
        };

        let result = self.execute(&decision, &existing, desired, &mut outcome).await;
        match result {
            Ok(()) => Ok(outcome),
            Err(e) => {
                let (pending, undo_err) = self.undo_steps(&desired.name, &outcome.undo).await;
                if let Some(undo_err) = undo_err {
                    error!(
                        hostname = %desired.name,
                        pending = ?pending,
                        error = %undo_err,
                        "Could not undo partial DNS changes"
                    );
                }
                match e {
                    Error::CrossAccountConflict(message) => {
                        warn!(hostname = %desired.name, %message, "DNS target owned by another account");
                        outcome.decision = ReconciliationDecision::Unresolvable {
                            reason: UnresolvableReason::CrossAccountConflict { message },
                        };
                        outcome.record = None;
                        // Steps that failed to undo stay replayable through `rollback`
                        outcome.undo = pending;
                        Ok(outcome)
                    }
                    other => Err(other),
                }
            }
        }
    }

    async fn execute(
        &self,
        decision: &ReconciliationDecision,
        existing: &[DnsRecord],
        desired: &RecordSpec,
        outcome: &mut ReconciliationOutcome,
    ) -> Result<()> {
        let zone_id = outcome.zone_id.clone();
        let find = |id: &str| existing.iter().find(|r| r.id == id);

        match decision {
            ReconciliationDecision::NoopAlreadyCorrect => {
                outcome.record = competing_records(existing, desired).first().map(|r| (*r).clone());
            }
            ReconciliationDecision::CreateNew => {
                let created = self.provider.create_record(&zone_id, desired).await?;
                info!(hostname = %desired.name, record_id = %created.id, content = %created.content, "Created DNS record");
                outcome.undo.push(UndoStep::DeleteCreated {
                    zone_id,
                    record_id: created.id.clone(),
                });
                outcome.record = Some(created);
            }
            ReconciliationDecision::UpdateInPlace { record_id } => {
                let prior = find(record_id)
                    .ok_or_else(|| Error::not_found(record_id.clone()))?
                    .spec();
                let updated = self.provider.update_record(&zone_id, record_id, desired).await?;
                info!(
                    hostname = %desired.name,
                    record_id = %record_id,
                    from = %prior.content,
                    to = %updated.content,
                    "Updated DNS record"
                );
                outcome.undo.push(UndoStep::Restore {
                    zone_id,
                    record_id: record_id.clone(),
                    prior,
                });
                outcome.record = Some(updated);
            }
            ReconciliationDecision::DeleteThenCreate { stale_record_id } => {
                let prior = find(stale_record_id)
                    .ok_or_else(|| Error::not_found(stale_record_id.clone()))?
                    .spec();

                match self.provider.delete_record(&zone_id, stale_record_id).await {
                    Ok(()) => {
                        info!(hostname = %desired.name, record_id = %stale_record_id, content = %prior.content, "Deleted stale DNS record");
                        outcome.undo.push(UndoStep::Recreate {
                            zone_id: zone_id.clone(),
                            prior,
                        });
                    }
                    Err(Error::NotFound(_)) => {
                        debug!(hostname = %desired.name, record_id = %stale_record_id, "Stale record already gone");
                    }
                    Err(e) => return Err(e),
                }

                let created = self.provider.create_record(&zone_id, desired).await?;
                info!(hostname = %desired.name, record_id = %created.id, content = %created.content, "Created DNS record");
                outcome.undo.push(UndoStep::DeleteCreated {
                    zone_id,
                    record_id: created.id.clone(),
                });
                outcome.record = Some(created);
            }
            ReconciliationDecision::Unresolvable { reason } => {
                warn!(hostname = %desired.name, %reason, "DNS state needs operator attention, not acting");
            }
        }

        Ok(())
    }

    async fn undo_step(&self, step: &UndoStep) -> Result<()> {
        match step {
            UndoStep::DeleteCreated { zone_id, record_id } => {
                match self.provider.delete_record(zone_id, record_id).await {
                    Ok(()) | Err(Error::NotFound(_)) => {
                        info!(record_id = %record_id, "Removed DNS record created by this attempt");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            UndoStep::Restore {
                zone_id,
                record_id,
                prior,
            } => match self.provider.update_record(zone_id, record_id, prior).await {
                Ok(_) => {
                    info!(record_id = %record_id, content = %prior.content, "Restored DNS record");
                    Ok(())
                }
                Err(Error::NotFound(_)) => {
                    self.provider.create_record(zone_id, prior).await?;
                    info!(name = %prior.name, content = %prior.content, "Recreated overwritten DNS record");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            UndoStep::Recreate { zone_id, prior } => {
                let record = self.provider.create_record(zone_id, prior).await?;
                info!(record_id = %record.id, content = %prior.content, "Recreated deleted DNS record");
                Ok(())
            }
        }
    }

    fn backoff(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .config
            .retry_base_delay()
            .saturating_mul(1u32 << attempt.min(16));
        retry_after.map_or(exponential, |hint| hint.max(exponential))
    }
}

fn cancelled(hostname: &str) -> Error {
    info!(hostname, "DNS reconciliation cancelled");
    Error::Cancelled {
        context: FailureContext::default(),
    }
}
