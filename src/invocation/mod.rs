mod events;
mod gate;
mod pipeline;
mod supervisor;
mod table;

pub use events::EventSink;
pub use gate::{ApprovalGate, ApprovalTicket, GateOutcome};
pub use pipeline::InvocationPipeline;
pub use supervisor::{ExecutionSupervisor, RetryPolicy};
pub use table::InvocationTable;
