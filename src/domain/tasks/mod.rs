//! Task queue vocabulary: tasks, priority queues, retry policy.

mod event_task;
mod queue;
mod retry;
mod task;

pub use event_task::EventTask;
pub use queue::{QueueName, QueueWeights, WeightedSchedule};
pub use retry::RetryPolicy;
pub use task::{task_types, Task, TaskMessage};
