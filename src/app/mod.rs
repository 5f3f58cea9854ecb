pub mod backend;
pub mod breaker;
pub mod errors;
pub mod factory;
pub mod failed;
pub mod local;
pub mod remote;
pub mod resilient;

pub use backend::{CreateOutcome, SearchBackend};
pub use errors::AppError;
pub use factory::AppFactory;
