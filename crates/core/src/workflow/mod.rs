pub mod graph;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod sort;
pub mod step_executor;

pub use graph::{build_graph, StepGraph};
pub use orchestrator::{merge_inputs, WorkflowOrchestrator};
pub use queue::{JobHandle, JobTransport, StepJob, WorkflowQueue};
pub use registry::{TaskContext, TaskExecutor, TaskOutcome, TaskRegistry};
pub use sort::{preview_order, PlanEntry};
pub use step_executor::StepExecutor;
