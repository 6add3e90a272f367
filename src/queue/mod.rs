mod memory;
mod sqs;
mod types;

pub use memory::MemoryQueue;
pub use sqs::SqsJobQueue;
pub use types::{JobQueue, QueueError, QueueMessage};
