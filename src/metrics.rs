//! Process-wide counters for the gateway, rendered in Prometheus text
//! exposition format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for the service. Safe for concurrent increment.
///
/// Owned by the [`crate::Gateway`] instance rather than being a global, so
/// tests can construct independent instances.
#[derive(Debug, Default)]
pub struct Metrics {
    alerts_processed_total: AtomicU64,
    sms_sent_total: AtomicU64,
    sms_failed_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the alert-batches-processed counter.
    pub fn inc_alerts_processed(&self) {
        self.alerts_processed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the SMS sent counter.
    pub fn inc_sms_sent(&self) {
        self.sms_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the SMS failed counter.
    pub fn inc_sms_failed(&self) {
        self.sms_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Render the counters in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, help, value) in [
            (
                "sms_gateway_alerts_processed_total",
                "Total number of alert batches processed via POST /send.",
                self.alerts_processed_total.load(Ordering::Relaxed),
            ),
            (
                "sms_gateway_sms_sent_total",
                "Total SMS messages sent successfully.",
                self.sms_sent_total.load(Ordering::Relaxed),
            ),
            (
                "sms_gateway_sms_failed_total",
                "Total SMS messages that failed to send.",
                self.sms_failed_total.load(Ordering::Relaxed),
            ),
        ] {
            writeln!(&mut out, "# HELP {name} {help}").unwrap();
            writeln!(&mut out, "# TYPE {name} counter").unwrap();
            writeln!(&mut out, "{name} {value}").unwrap();
        }
        out
    }
}
