pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;
pub mod types;

pub use config::SwitchyardConfig;
pub use error::{Result, StepError, SwitchyardError};
pub use event::EventBus;
pub use state::{ScopedState, WorkflowScope};
pub use traits::{ExpressionEvaluator, StepBundle, StepContext, StepExecutor};
pub use types::*;
