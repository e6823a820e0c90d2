pub mod block_executive;
pub mod error;
pub mod executor_manager;
pub mod key_locks;
pub mod message;
pub mod pipeline;
pub mod traits;

mod batch;
mod executive;

pub use block_executive::BlockExecutive;
pub use error::SchedulerError;
pub use executor_manager::ExecutorManager;
pub use key_locks::KeyLockTable;
pub use message::{ContextId, ExecutionMessage, ExecutiveResult, MessageKind, Seq, DEFAULT_TX_GAS};
pub use pipeline::SchedulerPipeline;
pub use traits::{Entry, ShardExecutor, Storage};
