//! Fan-out of one webhook payload across all (alert, receiver) pairs.

use crate::{
    alertmanager::{Status, WebhookPayload},
    format::format_message,
    gateway::GatewayConfig,
    metrics::Metrics,
    twilio::SmsTransport,
};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info};

/// Aggregated result of one dispatch pass, also the JSON body of the
/// `POST /send` response.
#[derive(Clone, Debug, Serialize)]
pub struct DispatchSummary {
    /// One entry per failed (alert, receiver) unit. Order is nondeterministic.
    pub errors: Vec<String>,
    pub sent: usize,
    pub failed: usize,
    /// True iff no unit failed.
    pub success: bool,
}

impl DispatchSummary {
    /// Summary for a payload that was not dispatched at all.
    fn skipped() -> Self {
        Self {
            errors: Vec::new(),
            sent: 0,
            failed: 0,
            success: true,
        }
    }
}

#[derive(Default)]
struct Aggregate {
    sent: usize,
    failed: usize,
    errors: Vec<String>,
}

/// Dispatch a webhook payload: format and send one SMS per
/// (alert, receiver) pair, all pairs concurrently.
///
/// Only firing payloads are dispatched, plus resolved payloads when
/// `send_resolved` is configured; anything else returns an all-zero summary.
/// Units are isolated: one pair's formatting or transport failure never
/// cancels its siblings, and all units are joined before the summary is
/// produced. In dry-run mode formatting still happens and is logged, but no
/// network call is made and the unit counts as sent.
pub async fn dispatch(
    payload: &WebhookPayload,
    receivers: &[String],
    config: &Arc<GatewayConfig>,
    transport: &Arc<dyn SmsTransport>,
    metrics: &Metrics,
) -> DispatchSummary {
    let proceed = match payload.status {
        Status::Firing => true,
        Status::Resolved => config.send_resolved,
        Status::Unknown => false,
    };
    if !proceed {
        info!("Skipping payload with status {:?}", payload.status);
        return DispatchSummary::skipped();
    }

    metrics.inc_alerts_processed();

    let aggregate = Arc::new(Mutex::new(Aggregate::default()));
    let mut units = JoinSet::new();

    for alert in &payload.alerts {
        for receiver in receivers {
            // Each unit owns its alert and receiver copies: the loop values
            // must not be shared across concurrently running units.
            let alert = alert.clone();
            let receiver = receiver.clone();
            let status = payload.status;
            let config = config.clone();
            let transport = transport.clone();
            let aggregate = aggregate.clone();

            units.spawn(async move {
                let outcome = async {
                    let body = format_message(&alert, status, &config)
                        .map_err(|err| err.to_string())?;

                    if config.dry_run {
                        info!("Dry run: would send to {receiver}: {body}");
                        return Ok(());
                    }

                    transport
                        .send_message(&receiver, &config.sender, &body)
                        .await
                        .map_err(|err| err.to_string())
                }
                .await;

                // Lock held only for the counter update, never across I/O
                let mut agg = aggregate.lock().expect("aggregate lock poisoned");
                match outcome {
                    Ok(()) => {
                        info!("Message sent to {receiver}");
                        agg.sent += 1;
                    }
                    Err(cause) => {
                        error!("Failed to send SMS to {receiver}: {cause}");
                        agg.failed += 1;
                        agg.errors.push(format!("Failed to send to {receiver}: {cause}"));
                    }
                }
            });
        }
    }

    while let Some(joined) = units.join_next().await {
        if let Err(err) = joined {
            error!("Dispatch unit panicked: {err}");
        }
    }

    let agg = std::mem::take(
        &mut *aggregate.lock().expect("aggregate lock poisoned"),
    );

    for _ in 0..agg.sent {
        metrics.inc_sms_sent();
    }
    for _ in 0..agg.failed {
        metrics.inc_sms_failed();
    }

    DispatchSummary {
        success: agg.failed == 0,
        sent: agg.sent,
        failed: agg.failed,
        errors: agg.errors,
    }
}
