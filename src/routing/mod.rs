pub mod credential_pool;
pub mod load_balancer;
pub mod model_resolver;
pub mod types;

pub use credential_pool::CredentialPool;
pub use load_balancer::{BalanceError, pick_weighted};
pub use model_resolver::{Caller, CallerGrant, ModelResolver};
