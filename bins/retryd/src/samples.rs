//! Demo handlers: a notifier retried on a fixed interval and a billing
//! method retried on a cron schedule. Both fail the first time they see an
//! odd id, so every odd id goes through one replay.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::bail;
use retry_core::{BackendKind, MethodHandler, RetryAttrs, RetryEngine, RetryHandler, RetryListener, RetryTask};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const NOTIFY_IDENTITY: &str = "order.paid.notify";
pub const CHARGE_IDENTITY: &str = "billing.charge";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPaid {
    pub order_id: u64,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub invoice_id: u64,
    pub customer: String,
    pub amount_cents: i64,
}

/// Remembers ids it has already refused once.
#[derive(Default)]
struct FirstTry {
    seen: Mutex<HashSet<u64>>,
}

impl FirstTry {
    fn refuses(&self, id: u64) -> bool {
        id % 2 == 1 && self.seen.lock().unwrap_or_else(PoisonError::into_inner).insert(id)
    }
}

#[derive(Default)]
pub struct OrderPaidNotifier {
    downstream: FirstTry,
}

impl RetryHandler for OrderPaidNotifier {
    type Arg = OrderPaid;
    type Output = ();

    fn identity(&self) -> &str {
        NOTIFY_IDENTITY
    }
    fn name(&self) -> &str {
        "notify order paid"
    }
    fn interval_secs(&self) -> Option<u64> {
        Some(5)
    }
    fn backend(&self) -> Option<BackendKind> {
        Some(BackendKind::Local)
    }
    fn handle(&self, event: &OrderPaid) -> anyhow::Result<()> {
        if self.downstream.refuses(event.order_id) {
            bail!("order {}: notification endpoint unavailable", event.order_id);
        }
        info!(order_id = event.order_id, amount_cents = event.amount_cents, "order paid notification sent");
        Ok(())
    }
}

#[derive(Default)]
pub struct Billing {
    gateway: FirstTry,
}

impl Billing {
    pub fn charge(&self, req: &ChargeRequest) -> anyhow::Result<String> {
        if req.amount_cents <= 0 {
            bail!("invoice {}: nothing to charge", req.invoice_id);
        }
        if self.gateway.refuses(req.invoice_id) {
            bail!("invoice {}: payment gateway timed out", req.invoice_id);
        }
        let receipt = format!("rcpt-{}-{}", req.customer, req.invoice_id);
        info!(invoice_id = req.invoice_id, %receipt, "invoice charged");
        Ok(receipt)
    }
}

/// Logs how replayed charges end up.
struct ChargeAudit;

impl RetryListener for ChargeAudit {
    fn on_retry_success(&self, task: &RetryTask) {
        info!(task = %task.id, attempts = task.attempts + 1, "charge settled on replay");
    }
    fn on_retry_failure(&self, task: &RetryTask, error: &anyhow::Error) {
        warn!(task = %task.id, attempts = task.attempts + 1, error = %error, "charge replay failed");
    }
}

pub struct Samples {
    pub notifier: Arc<OrderPaidNotifier>,
    pub billing: Arc<Billing>,
}

pub fn register(engine: &RetryEngine) -> retry_core::Result<Samples> {
    let notifier = Arc::new(OrderPaidNotifier::default());
    engine.register_shared(notifier.clone())?;

    let billing = Arc::new(Billing::default());
    engine.register(
        MethodHandler::new(
            billing.clone(),
            RetryAttrs::new(CHARGE_IDENTITY).name("charge invoice").cron("*/10 * * * * *"),
            Billing::charge,
        )
        .with_listener(Arc::new(ChargeAudit)),
    )?;

    Ok(Samples { notifier, billing })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_ids_fail_once() {
        let billing = Billing::default();
        let req = ChargeRequest { invoice_id: 7, customer: "acme".into(), amount_cents: 100 };
        assert!(billing.charge(&req).is_err());
        assert_eq!(billing.charge(&req).unwrap(), "rcpt-acme-7");

        let even = ChargeRequest { invoice_id: 8, ..req };
        assert!(billing.charge(&even).is_ok());
    }

    #[test]
    fn notifier_metadata() {
        let n = OrderPaidNotifier::default();
        assert_eq!(n.identity(), NOTIFY_IDENTITY);
        assert_eq!(n.interval_secs(), Some(5));
        assert!(n.cron().is_none());
        assert!(n.handle(&OrderPaid { order_id: 2, amount_cents: 10 }).is_ok());
    }
}
