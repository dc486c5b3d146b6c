pub mod commands;
pub mod executor;
pub mod memory;
pub mod retry;
pub mod scripts;

pub use commands::{Guard, GuardTag, HistoryIndexTarget, IndexRange, Presence, StoreOp, TransactOutcome, TransactPlan};
pub use executor::{RedisStore, StoreExecutor, execute_plan, parse_script_response};
pub use memory::{MemoryStore, StoreStats};
pub use retry::{RetryPolicy, with_deadline, with_retry};
