pub mod account_registry;
pub mod revenue_split;
pub mod subscription_ledger;
pub mod transaction_ledger;
