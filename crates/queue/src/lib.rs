//! Task queue plumbing: the broker capability, its Redis and in-memory
//! implementations, weighted queue selection and the consumer server.

pub mod broker;
pub mod error;
pub mod priority;
pub mod server;
pub mod task;

pub use broker::{Broker, Disposition, MemoryBroker, RedisBroker};
pub use error::QueueError;
pub use priority::QueuePriorities;
pub use server::{ConsumerConfig, ConsumerServer, ServeMux, TaskHandler};
pub use task::{NewTask, Task, TaskInfo};
