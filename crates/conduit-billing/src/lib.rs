#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

pub mod error;
pub mod ledger;
pub mod pricing;
pub mod recorder;
pub mod store;

pub use error::LedgerError;
pub use ledger::{BillingSession, ChargedTask, QuotaLedger};
pub use pricing::{Pricing, estimate_prompt_tokens};
pub use recorder::{LogUsageSink, MemoryUsageSink, UsageKind, UsageLog, UsageRecorder, UsageSink};
pub use store::{InMemoryQuotaStore, QuotaStore};
