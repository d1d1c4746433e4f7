use std::sync::Arc;

use retry_core::RetryHandler;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::module::{Module, ModuleCtx};
use crate::samples::{Billing, ChargeRequest, OrderPaid, OrderPaidNotifier, CHARGE_IDENTITY};

/// Feeds the sample handlers through the interceptors, one call each per period.
pub struct Traffic {
    period: Duration,
    notifier: Arc<OrderPaidNotifier>,
    billing: Arc<Billing>,
}

impl Traffic {
    pub fn new(period: Duration, notifier: Arc<OrderPaidNotifier>, billing: Arc<Billing>) -> Self {
        Self { period, notifier, billing }
    }
}

impl Module for Traffic {
    fn name(&self) -> &'static str { "traffic" }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let classes = ctx.engine.class_interceptor();
            let functions = ctx.engine.function_interceptor();
            let mut tick = interval(self.period);
            let mut seq: u64 = 0;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        seq += 1;
                        let event = OrderPaid { order_id: seq, amount_cents: 1_000 + seq as i64 };
                        // Not registered (retries off): call straight through.
                        let sent = classes
                            .intercept(&*self.notifier, &event)
                            .unwrap_or_else(|| self.notifier.handle(&event));
                        if let Err(e) = sent {
                            warn!(order_id = seq, error = %e, "notification failed");
                        }

                        let req = ChargeRequest { invoice_id: seq, customer: "acme".into(), amount_cents: 2_500 };
                        let charged = functions
                            .intercept::<Billing, ChargeRequest, String>(CHARGE_IDENTITY, &req)
                            .unwrap_or_else(|| self.billing.charge(&req));
                        if let Err(e) = charged {
                            warn!(invoice_id = seq, error = %e, "charge failed");
                        }
                    }
                    changed = ctx.shutdown.changed() => {
                        if changed.is_err() || *ctx.shutdown.borrow() {
                            info!(sent = seq, "traffic stopping");
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}
