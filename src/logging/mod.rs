pub mod database;
pub mod database_keys;
pub mod database_ledger;
pub mod database_models;
pub mod ledger;
pub mod time;
pub mod types;

pub use database::DatabaseLogger;
pub use ledger::{LedgerWriter, Settlement};
pub use types::{CompletionsResult, UsageLedgerEntry, UsageRecord, UsageTotals};
