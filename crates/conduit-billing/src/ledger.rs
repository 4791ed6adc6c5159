//! Prepaid quota protocol
//!
//! A request reserves its estimated cost up front, then settles the
//! difference once the real cost is known. A request that delivers
//! nothing gets the reservation back. The session state guarantees a
//! reservation is settled or refunded exactly once.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use conduit_core::{ChannelId, DispatchContext, Quote, RelayError, Usage};

use crate::error::LedgerError;
use crate::recorder::{UsageKind, UsageLog, UsageRecorder};
use crate::store::QuotaStore;

/// Ledger operations shared by the dispatch path and the task reconciler
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    recorder: UsageRecorder,
    trust_quota: i64,
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("trust_quota", &self.trust_quota)
            .finish_non_exhaustive()
    }
}

/// A task whose quota can be trued up after the fact
pub trait ChargedTask {
    fn task_id(&self) -> &str;
    fn tenant_id(&self) -> i64;
    fn model(&self) -> &str;
    fn channel_id(&self) -> ChannelId;
    /// Quota currently held for the task
    fn quota(&self) -> i64;
    fn set_quota(&mut self, quota: i64);
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, recorder: UsageRecorder, trust_quota: i64) -> Self {
        Self {
            store,
            recorder,
            trust_quota,
        }
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    pub const fn recorder(&self) -> &UsageRecorder {
        &self.recorder
    }

    /// Reserve the quoted amount before the provider call
    ///
    /// Free quotes and trusted tenants reserve nothing. The amount actually
    /// reserved is written back into the context.
    pub async fn pre_consume(&self, ctx: &mut DispatchContext, quote: Quote) -> Result<BillingSession, RelayError> {
        let tenant_id = ctx.tenant.id;
        let reserved = if quote.is_free() {
            0
        } else {
            self.reserve(tenant_id, quote.amount).await?
        };

        ctx.reserved = reserved;
        ctx.quote = Some(quote.clone());

        tracing::debug!(
            tenant_id,
            request_id = %ctx.request_id,
            quoted = quote.amount,
            reserved,
            "quota pre-consumed"
        );

        Ok(BillingSession {
            inner: Arc::new(SessionInner {
                ledger: self.clone(),
                tenant_id,
                model: ctx.model.clone(),
                request_id: ctx.request_id.clone(),
                quote,
                reserved,
                started: Instant::now(),
                state: Mutex::new(SessionState::default()),
            }),
        })
    }

    async fn reserve(&self, tenant_id: i64, amount: i64) -> Result<i64, RelayError> {
        let balance = self.store.balance(tenant_id).await.map_err(quota_error)?;

        if balance <= 0 {
            return Err(RelayError::Quota("tenant quota is exhausted".to_owned()));
        }

        if balance < amount {
            return Err(RelayError::Quota(format!(
                "pre-consume quota {amount} exceeds remaining quota {balance}"
            )));
        }

        if self.trust_quota > 0 && balance > self.trust_quota {
            tracing::debug!(tenant_id, balance, "tenant above trust quota, skipping reservation");
            return Ok(0);
        }

        self.store.debit(tenant_id, amount).await.map_err(quota_error)?;

        Ok(amount)
    }

    /// Settle a task's quota to its actual cost
    ///
    /// Returns the signed adjustment applied.
    pub async fn true_up<T: ChargedTask + Send>(&self, task: &mut T, actual: i64, reason: &str) -> i64 {
        let delta = actual - task.quota();

        if delta == 0 {
            tracing::info!(task_id = task.task_id(), quota = actual, "task quota already matches actual cost");
            return 0;
        }

        let (kind, result) = if delta > 0 {
            (UsageKind::Consume, self.store.debit(task.tenant_id(), delta).await)
        } else {
            (UsageKind::Refund, self.store.credit(task.tenant_id(), -delta).await)
        };

        if let Err(e) = result {
            tracing::warn!(task_id = task.task_id(), delta, error = %e, "failed to adjust task quota");
        }

        task.set_quota(actual);

        let mut log = UsageLog::new(kind, task.tenant_id(), task.model(), delta.abs());
        log.channel_id = Some(task.channel_id());
        log.reason = reason.to_owned();
        log.reference = Some(task.task_id().to_owned());
        self.recorder.record(log);

        tracing::info!(task_id = task.task_id(), delta, actual, "task quota trued up");

        delta
    }

    /// True up from a token count and ratios, skipping when either is not positive
    pub async fn true_up_by_tokens<T: ChargedTask + Send>(
        &self,
        task: &mut T,
        tokens: i64,
        model_ratio: f64,
        group_ratio: f64,
        reason: &str,
    ) -> i64 {
        let ratio = model_ratio * group_ratio;

        if tokens <= 0 || ratio <= 0.0 {
            return 0;
        }

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let actual = (tokens as f64 * ratio).floor() as i64;

        self.true_up(task, actual, reason).await
    }

    /// Return a task's whole quota, returning whether anything moved
    pub async fn refund_task<T: ChargedTask + Send + Sync>(&self, task: &T, reason: &str) -> bool {
        let quota = task.quota();

        if quota == 0 {
            return false;
        }

        if let Err(e) = self.store.credit(task.tenant_id(), quota).await {
            tracing::warn!(task_id = task.task_id(), quota, error = %e, "failed to refund task");
            return false;
        }

        let mut log = UsageLog::new(UsageKind::Refund, task.tenant_id(), task.model(), quota);
        log.channel_id = Some(task.channel_id());
        log.reason = reason.to_owned();
        log.reference = Some(task.task_id().to_owned());
        self.recorder.record(log);

        tracing::info!(task_id = task.task_id(), quota, reason, "task refunded");

        true
    }
}

fn quota_error(e: LedgerError) -> RelayError {
    match e {
        LedgerError::InsufficientBalance { .. } => RelayError::Quota(e.to_string()),
        LedgerError::UnknownTenant(_) | LedgerError::UnpricedModel(_) => RelayError::internal(e),
    }
}

#[derive(Debug, Default)]
struct SessionState {
    settled: bool,
    refunded: bool,
}

struct SessionInner {
    ledger: QuotaLedger,
    tenant_id: i64,
    model: String,
    request_id: String,
    quote: Quote,
    reserved: i64,
    started: Instant,
    state: Mutex<SessionState>,
}

/// Billing state of one request
#[derive(Clone)]
pub struct BillingSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for BillingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingSession")
            .field("tenant_id", &self.inner.tenant_id)
            .field("request_id", &self.inner.request_id)
            .field("reserved", &self.inner.reserved)
            .finish_non_exhaustive()
    }
}

impl BillingSession {
    pub fn reserved(&self) -> i64 {
        self.inner.reserved
    }

    pub fn quote(&self) -> &Quote {
        &self.inner.quote
    }

    /// Claim the session for one terminal transition
    fn claim(&self, refund: bool) -> bool {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.settled || state.refunded {
            return false;
        }

        if refund {
            if self.inner.reserved <= 0 {
                return false;
            }
            state.refunded = true;
        } else {
            state.settled = true;
        }

        true
    }

    /// Settle the reservation against the actual cost
    ///
    /// A second call is a no-op. A failed debit is logged, never surfaced.
    pub async fn finalize(&self, actual: i64, channel_id: ChannelId, usage: Usage) {
        if !self.claim(false) {
            return;
        }

        let inner = &self.inner;
        let delta = actual - inner.reserved;

        let result = match delta {
            d if d > 0 => inner.ledger.store.debit(inner.tenant_id, d).await.map(|_| ()),
            d if d < 0 => inner.ledger.store.credit(inner.tenant_id, -d).await.map(|_| ()),
            _ => Ok(()),
        };

        if let Err(e) = result {
            tracing::warn!(
                tenant_id = inner.tenant_id,
                request_id = %inner.request_id,
                delta,
                error = %e,
                "failed to settle quota"
            );
        }

        let mut log = UsageLog::new(UsageKind::Consume, inner.tenant_id, &inner.model, actual);
        log.channel_id = Some(channel_id);
        log.prompt_tokens = usage.prompt_tokens;
        log.completion_tokens = usage.completion_tokens;
        log.elapsed_ms = u64::try_from(inner.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        log.reference = Some(inner.request_id.clone());
        inner.ledger.recorder.record(log);
    }

    /// Return the whole reservation, returning whether anything moved
    ///
    /// Only acts once, and never after the session was finalized.
    pub async fn refund(&self, reason: &str) -> bool {
        if !self.claim(true) {
            return false;
        }

        let inner = &self.inner;

        if let Err(e) = inner.ledger.store.credit(inner.tenant_id, inner.reserved).await {
            tracing::warn!(
                tenant_id = inner.tenant_id,
                request_id = %inner.request_id,
                reserved = inner.reserved,
                error = %e,
                "failed to refund reservation"
            );
            return false;
        }

        let mut log = UsageLog::new(UsageKind::Refund, inner.tenant_id, &inner.model, inner.reserved);
        log.reason = reason.to_owned();
        log.elapsed_ms = u64::try_from(inner.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        log.reference = Some(inner.request_id.clone());
        inner.ledger.recorder.record(log);

        tracing::info!(
            tenant_id = inner.tenant_id,
            request_id = %inner.request_id,
            reserved = inner.reserved,
            "reservation refunded"
        );

        true
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::Tenant;

    use super::*;
    use crate::recorder::MemoryUsageSink;
    use crate::store::InMemoryQuotaStore;

    struct Fixture {
        store: Arc<InMemoryQuotaStore>,
        sink: Arc<MemoryUsageSink>,
        ledger: QuotaLedger,
    }

    fn fixture(balance: i64, trust_quota: i64) -> Fixture {
        let store = Arc::new(InMemoryQuotaStore::new());
        store.set_balance(7, balance);
        let sink = Arc::new(MemoryUsageSink::new());
        let ledger = QuotaLedger::new(store.clone(), UsageRecorder::new(sink.clone()), trust_quota);

        Fixture { store, sink, ledger }
    }

    fn ctx() -> DispatchContext {
        DispatchContext::new(
            Tenant {
                id: 7,
                name: "acme".to_owned(),
                group: "default".to_owned(),
                admin: false,
            },
            "gpt-4o",
        )
    }

    fn quote(amount: i64) -> Quote {
        Quote {
            amount,
            model_ratio: 1.0,
            completion_ratio: 1.0,
            group_ratio: 1.0,
            fixed_price: false,
        }
    }

    #[tokio::test]
    async fn pre_consume_reserves_and_records_in_context() {
        let f = fixture(1000, 0);
        let mut ctx = ctx();

        let session = f.ledger.pre_consume(&mut ctx, quote(300)).await.unwrap();
        assert_eq!(session.reserved(), 300);
        assert_eq!(ctx.reserved, 300);
        assert_eq!(f.store.balance(7).await.unwrap(), 700);
    }

    #[tokio::test]
    async fn pre_consume_rejects_insufficient_balance() {
        let f = fixture(100, 0);
        let err = f.ledger.pre_consume(&mut ctx(), quote(300)).await.unwrap_err();
        assert!(matches!(err, RelayError::Quota(_)));
        assert!(err.is_skip_retry());

        let f = fixture(0, 0);
        let err = f.ledger.pre_consume(&mut ctx(), quote(1)).await.unwrap_err();
        assert!(matches!(err, RelayError::Quota(ref m) if m.contains("exhausted")));
    }

    #[tokio::test]
    async fn free_quote_skips_the_ledger() {
        let f = fixture(0, 0);
        let session = f.ledger.pre_consume(&mut ctx(), quote(0)).await.unwrap();
        assert_eq!(session.reserved(), 0);
        assert!(!session.refund("failed").await);
    }

    #[tokio::test]
    async fn trusted_tenant_reserves_nothing() {
        let f = fixture(10_000, 5_000);
        let mut ctx = ctx();
        let session = f.ledger.pre_consume(&mut ctx, quote(300)).await.unwrap();

        assert_eq!(session.reserved(), 0);
        assert_eq!(ctx.reserved, 0);
        assert_eq!(f.store.balance(7).await.unwrap(), 10_000);

        session.finalize(250, 1, Usage::default()).await;
        assert_eq!(f.store.balance(7).await.unwrap(), 9_750);
    }

    #[tokio::test]
    async fn finalize_settles_the_difference_once() {
        let f = fixture(1000, 0);
        let session = f.ledger.pre_consume(&mut ctx(), quote(300)).await.unwrap();

        session.finalize(120, 3, Usage::default()).await;
        assert_eq!(f.store.balance(7).await.unwrap(), 880);

        session.finalize(999, 3, Usage::default()).await;
        assert!(!session.refund("late").await);
        assert_eq!(f.store.balance(7).await.unwrap(), 880);

        f.ledger.recorder().flush().await;
        let logs = f.sink.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, UsageKind::Consume);
        assert_eq!(logs[0].quota, 120);
        assert_eq!(logs[0].channel_id, Some(3));
    }

    #[tokio::test]
    async fn finalize_above_reservation_debits_more() {
        let f = fixture(1000, 0);
        let session = f.ledger.pre_consume(&mut ctx(), quote(300)).await.unwrap();
        session.finalize(450, 1, Usage::default()).await;
        assert_eq!(f.store.balance(7).await.unwrap(), 550);
    }

    #[tokio::test]
    async fn refund_happens_exactly_once_under_contention() {
        let f = fixture(1000, 0);
        let session = f.ledger.pre_consume(&mut ctx(), quote(300)).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.refund("all attempts failed").await })
            })
            .collect();

        let mut refunds = 0;
        for handle in handles {
            if handle.await.unwrap() {
                refunds += 1;
            }
        }

        assert_eq!(refunds, 1);
        assert_eq!(f.store.balance(7).await.unwrap(), 1000);

        session.finalize(100, 1, Usage::default()).await;
        assert_eq!(f.store.balance(7).await.unwrap(), 1000);

        f.ledger.recorder().flush().await;
        let refunds = f.sink.of_kind(UsageKind::Refund);
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].quota, 300);
        assert!(f.sink.of_kind(UsageKind::Consume).is_empty());
    }

    struct TestTask {
        quota: i64,
    }

    impl ChargedTask for TestTask {
        fn task_id(&self) -> &str {
            "task-1"
        }

        fn tenant_id(&self) -> i64 {
            7
        }

        fn model(&self) -> &str {
            "sora-2"
        }

        fn channel_id(&self) -> ChannelId {
            2
        }

        fn quota(&self) -> i64 {
            self.quota
        }

        fn set_quota(&mut self, quota: i64) {
            self.quota = quota;
        }
    }

    #[tokio::test]
    async fn true_up_refunds_the_overcharge() {
        let f = fixture(1000, 0);
        let mut task = TestTask { quota: 500 };

        let delta = f.ledger.true_up(&mut task, 450, "actual usage").await;
        assert_eq!(delta, -50);
        assert_eq!(task.quota, 450);
        assert_eq!(f.store.balance(7).await.unwrap(), 1050);

        f.ledger.recorder().flush().await;
        let refunds = f.sink.of_kind(UsageKind::Refund);
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].quota, 50);
        assert_eq!(refunds[0].reference.as_deref(), Some("task-1"));
    }

    #[tokio::test]
    async fn true_up_charges_the_shortfall() {
        let f = fixture(1000, 0);
        let mut task = TestTask { quota: 500 };

        assert_eq!(f.ledger.true_up(&mut task, 600, "actual usage").await, 100);
        assert_eq!(f.store.balance(7).await.unwrap(), 900);
        assert_eq!(f.ledger.true_up(&mut task, 600, "again").await, 0);

        f.ledger.recorder().flush().await;
        assert_eq!(f.sink.logs().len(), 1);
    }

    #[tokio::test]
    async fn true_up_by_tokens_skips_non_positive_inputs() {
        let f = fixture(1000, 0);
        let mut task = TestTask { quota: 500 };

        assert_eq!(f.ledger.true_up_by_tokens(&mut task, 0, 2.0, 1.0, "tokens").await, 0);
        assert_eq!(f.ledger.true_up_by_tokens(&mut task, 100, 0.0, 1.0, "tokens").await, 0);
        assert_eq!(task.quota, 500);

        assert_eq!(f.ledger.true_up_by_tokens(&mut task, 101, 2.5, 1.0, "tokens").await, -248);
        assert_eq!(task.quota, 252);
    }

    #[tokio::test]
    async fn refund_task_returns_quota() {
        let f = fixture(1000, 0);
        assert!(f.ledger.refund_task(&TestTask { quota: 200 }, "failed").await);
        assert!(!f.ledger.refund_task(&TestTask { quota: 0 }, "failed").await);
        assert_eq!(f.store.balance(7).await.unwrap(), 1200);
    }
}
