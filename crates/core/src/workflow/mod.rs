pub mod coordinator;
pub mod graph;
pub mod node_executor;
pub mod scheduler;
pub mod state;

pub use coordinator::RunCoordinator;
pub use graph::ValidatedGraph;
pub use node_executor::{NodeExecutor, NodeOutcome, RunContext};
pub use scheduler::{RunOutcome, Scheduler, WorkerPool};
pub use state::RunState;
