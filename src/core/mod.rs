pub mod batch;
pub mod limit;
pub mod models;
pub mod observer;
pub mod progress;
pub mod scheduler;
pub mod transport;

pub use batch::{BatchAggregate, BatchExport, BatchKey};
pub use limit::ConcurrencyLimit;
pub use models::{
    Job, JobId, JobKind, JobPayload, JobResult, JobStatus, Operation, SourceFile, TaskId,
};
pub use observer::{ChannelObserver, Fanout, SchedulerEvent, SchedulerObserver, TracingObserver};
pub use progress::{ProgressChannel, ProgressEvent, ProgressStatus};
pub use scheduler::{QueueStats, Scheduler, SchedulerError};
pub use transport::{HttpTransport, SimulatedTransport, TransportClient, TransportError};
