//! Single-writer run lease stored in the `leases` namespace.
//!
//! Exactly one non-expired lease may exist per state store. A stale lease
//! (expired `expires_epoch`) can be displaced by a new run; the displaced
//! process loses the CAS on its next write and must abort.

use chrono::Utc;

use crate::contracts::{now_iso, Lease, LeasesPayload};
use crate::state_store::{Namespace, StateError, StateResult, StateStore};

const MIN_TTL_SECONDS: i64 = 30;

/// Lease lifetime: at least 30 s, and at least twice the backend timeout so a
/// slow specialist call cannot outlive its own lease.
pub fn lease_ttl_seconds(timeout_seconds: f64) -> i64 {
    MIN_TTL_SECONDS.max((2.0 * timeout_seconds).ceil() as i64)
}

/// Claim the active lease for `run_id`.
///
/// Refuses when another run holds a non-expired lease, unless `resume` is set
/// and the lease belongs to the resumed run id. Acquisition is CAS-protected:
/// losing the race surfaces as a lease conflict.
pub fn acquire_lease(
    store: &StateStore,
    run_id: &str,
    timeout_seconds: f64,
    resume: bool,
) -> StateResult<Lease> {
    let envelope = store.envelope(Namespace::Leases)?;
    let payload: LeasesPayload = serde_json::from_value(envelope.data).unwrap_or_default();
    let now_epoch = Utc::now().timestamp();

    if let Some(active) = &payload.active {
        let same_run = active.run_id == run_id;
        if !active.is_expired(now_epoch) && !same_run && !resume {
            return Err(StateError::Other(format!(
                "Another run holds the active lease (run_id={}, expires_epoch={}). \
                 Use resume or wait for the lease to expire.",
                active.run_id, active.expires_epoch
            )));
        }
    }

    let lease = Lease {
        run_id: run_id.to_string(),
        heartbeat_at: now_iso(),
        expires_epoch: now_epoch + lease_ttl_seconds(timeout_seconds),
        task_id: None,
    };
    store
        .set(
            Namespace::Leases,
            &LeasesPayload {
                active: Some(lease.clone()),
            },
            Some(envelope.revision),
        )
        .map_err(|err| match err {
            StateError::Concurrency(_) => {
                StateError::Other("Lease conflict: another process claimed the lease.".into())
            }
            other => other,
        })?;
    Ok(lease)
}

/// Refresh the heartbeat and expiry for the running lease. A lease owned by
/// a different run id is left alone.
pub fn heartbeat_lease(
    store: &StateStore,
    run_id: &str,
    task_id: Option<&str>,
    timeout_seconds: f64,
) -> StateResult<()> {
    let run_id = run_id.to_string();
    let task_id = task_id.map(str::to_string);
    store.update(Namespace::Leases, move |mut payload: LeasesPayload| {
        if let Some(active) = payload.active.as_mut() {
            if active.run_id == run_id {
                active.heartbeat_at = now_iso();
                active.expires_epoch = Utc::now().timestamp() + lease_ttl_seconds(timeout_seconds);
                active.task_id = task_id.clone();
            }
        }
        payload
    })?;
    Ok(())
}

/// Release the lease if this run still owns it.
pub fn release_lease(store: &StateStore, run_id: &str) -> StateResult<()> {
    let run_id = run_id.to_string();
    store.update(Namespace::Leases, move |mut payload: LeasesPayload| {
        if payload
            .active
            .as_ref()
            .is_some_and(|active| active.run_id == run_id)
        {
            payload.active = None;
        }
        payload
    })?;
    Ok(())
}
