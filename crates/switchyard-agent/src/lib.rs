pub mod builtin;
pub mod bus;
pub mod completion;
pub mod expr;
pub mod handler;
pub mod pause;
pub mod registry;
pub mod routing;
pub mod runtime;
pub mod store;

pub use builtin::{ConstantStep, DeserializeStep, PassthroughStep};
pub use bus::{Delivery, Envelope, HandlerTable, InvocationHandle, InvocationReport, MessageBus};
pub use completion::{CompletionHandle, CompletionRegistrar, Resolution, DEFAULT_RESOLVED_HISTORY};
pub use expr::PathEvaluator;
pub use handler::{AgentHandler, CompiledStep, PipelineOutcome};
pub use pause::PauseController;
pub use registry::{StepFactory, StepRegistry};
pub use routing::{select_routes, validate_route, RouteDecision};
pub use runtime::{Runtime, RuntimeBuilder};
pub use store::{WorkflowLease, WorkflowStore};
