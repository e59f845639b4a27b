pub mod dispatch;
pub mod dispatcher;
pub mod error;
pub mod error_codes;
pub mod execution;
pub mod memory;
pub mod model;
pub mod process;
pub mod queue;
pub mod registry;
pub mod repo;
pub mod retry;
pub mod runner;

pub use dispatch::{ClientDispatch, Operation};
pub use dispatcher::ClientDispatcher;
pub use error::{ProcessError, ProcessResult};
pub use error_codes::ErrorCode;
pub use execution::{ExecutionContext, ExecutionFailure, ExecutionOutcome, Transition};
pub use memory::InMemoryProcessRepo;
pub use model::{ClientProcess, ProcessStatus};
pub use process::AsynchronousProcess;
pub use queue::{JobQueue, LeaseQueue, NewJob, PgJobQueue, QueuedJob};
pub use registry::{ResourcePolicy, ResourceRegistry};
pub use repo::{PgProcessRepo, ProcessRepository};
pub use runner::ProcessRunner;
