pub mod account_repo;
pub mod event_repo;
pub mod plan_repo;
pub mod split_repo;
pub mod subscription_repo;
pub mod tenant_repo;
pub mod transaction_repo;
