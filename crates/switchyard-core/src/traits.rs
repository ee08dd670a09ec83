use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::StepDefinition;
use crate::error::{Result, StepError};
use crate::types::TopicId;

/// Named values passed into or produced by a step.
pub type StepBundle = Map<String, Value>;

/// Per-call context handed to a step executor.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The topic identity whose invocation is running this step.
    pub topic: TopicId,
    /// Topic name of the owning agent.
    pub agent: String,
    /// Position of the step within the pipeline.
    pub index: usize,
    /// Cancelled when the publish chain that started this invocation is.
    pub cancel: CancellationToken,
}

/// The uniform contract every step type satisfies.
pub trait StepExecutor: Send + Sync + 'static {
    /// Step type name, as referenced from agent definitions.
    fn step_type(&self) -> &str;

    /// Declared I/O contract. Documentation only; the runtime binds by key.
    fn definition(&self) -> StepDefinition {
        StepDefinition::named(self.step_type())
    }

    /// Produce an output bundle from resolved inputs and the step's config.
    fn execute<'a>(
        &'a self,
        inputs: StepBundle,
        config: &'a Value,
        ctx: StepContext,
    ) -> BoxFuture<'a, std::result::Result<StepBundle, StepError>>;
}

/// Expression evaluator used for route conditions and transforms.
pub trait ExpressionEvaluator: Send + Sync + 'static {
    /// Evaluate an expression against a state view.
    fn evaluate(&self, expr: &str, state: &Value) -> Result<Value>;

    /// Reject malformed expressions at build time.
    fn validate(&self, expr: &str) -> Result<()> {
        let _ = expr;
        Ok(())
    }
}

/// Truthiness of a condition result: null, false, 0, "", [] and {} are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!([0])));
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!({})));
    }
}
