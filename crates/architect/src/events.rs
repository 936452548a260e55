//! Backend telemetry recording.
//!
//! The dispatcher only emits events; this hook is where they land: appended
//! to the bounded `metrics.backend_events` history, with retry/fallback
//! counters bumped along the way.

use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::backends::BackendEventHook;
use crate::contracts::{keep_last, now_iso, Metrics, BACKEND_EVENTS_LIMIT};
use crate::state_store::{Namespace, StateStore};

/// Build an event hook that records dispatcher telemetry into the metrics
/// namespace.
pub fn metrics_event_hook(store: Arc<StateStore>) -> BackendEventHook {
    Arc::new(move |event: Value| {
        let result = store.update(Namespace::Metrics, |mut metrics: Metrics| {
            let mut stamped = event.clone();
            if let Value::Object(map) = &mut stamped {
                map.insert("at".into(), Value::String(now_iso()));
            }
            metrics.backend_events.push(stamped);
            keep_last(&mut metrics.backend_events, BACKEND_EVENTS_LIMIT);

            match event.get("event").and_then(Value::as_str) {
                Some("backend_retry") => metrics.backend_retry_count += 1,
                Some("backend_fallback_success") => metrics.backend_fallback_count += 1,
                _ => {}
            }
            metrics
        });
        if let Err(err) = result {
            warn!(error = %err, "failed to record backend event");
        }
    })
}
