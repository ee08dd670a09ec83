//! Built-in steps that need no external services.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use switchyard_core::config::StepDefinition;
use switchyard_core::error::{Result, StepError, SwitchyardError};
use switchyard_core::traits::{StepBundle, StepContext, StepExecutor};
use switchyard_core::types::kind_of;

/// Parses a JSON document held in a string.
///
/// Input `text`, output `value`. Markdown code fences around the document are
/// stripped unless `config.strip_code_fences` is `false`. Non-string inputs are
/// passed through unchanged.
pub struct DeserializeStep;

impl StepExecutor for DeserializeStep {
    fn step_type(&self) -> &str {
        "deserialize"
    }

    fn definition(&self) -> StepDefinition {
        StepDefinition::named("deserialize")
            .with_description("Parse a JSON string into structured state")
            .input("text", "string")
            .output("value", "any")
    }

    fn execute<'a>(
        &'a self,
        mut inputs: StepBundle,
        config: &'a Value,
        _ctx: StepContext,
    ) -> BoxFuture<'a, std::result::Result<StepBundle, StepError>> {
        Box::pin(async move {
            let text = inputs
                .remove("text")
                .ok_or_else(|| StepError::new("missing input 'text'"))?;
            let strip = config
                .get("strip_code_fences")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);

            let value = match text {
                Value::String(s) => {
                    let body = if strip { strip_code_fences(&s) } else { s.as_str() };
                    serde_json::from_str(body)
                        .map_err(|e| StepError::new(format!("invalid JSON: {}", e)))?
                }
                other => other,
            };

            let mut out = StepBundle::new();
            out.insert("value".into(), value);
            Ok(out)
        })
    }
}

fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop an optional language tag on the opening fence line
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Emits `config.value` as output `value`.
pub struct ConstantStep {
    value: Value,
}

impl ConstantStep {
    pub fn from_config(config: &Value) -> Result<Arc<dyn StepExecutor>> {
        let value = config
            .get("value")
            .cloned()
            .ok_or_else(|| SwitchyardError::InvalidStepConfig {
                step_type: "constant".into(),
                reason: format!("expected a mapping with 'value', got {}", kind_of(config)),
            })?;
        Ok(Arc::new(Self { value }))
    }
}

impl StepExecutor for ConstantStep {
    fn step_type(&self) -> &str {
        "constant"
    }

    fn definition(&self) -> StepDefinition {
        StepDefinition::named("constant")
            .with_description("Emit a configured value")
            .output("value", "any")
    }

    fn execute<'a>(
        &'a self,
        _inputs: StepBundle,
        _config: &'a Value,
        _ctx: StepContext,
    ) -> BoxFuture<'a, std::result::Result<StepBundle, StepError>> {
        Box::pin(async move {
            let mut out = StepBundle::new();
            out.insert("value".into(), self.value.clone());
            Ok(out)
        })
    }
}

/// Copies input `value` to output `value`; useful for promoting a key to a
/// wider scope.
pub struct PassthroughStep;

impl StepExecutor for PassthroughStep {
    fn step_type(&self) -> &str {
        "passthrough"
    }

    fn definition(&self) -> StepDefinition {
        StepDefinition::named("passthrough")
            .with_description("Copy a value, typically into another scope")
            .input("value", "any")
            .output("value", "any")
    }

    fn execute<'a>(
        &'a self,
        mut inputs: StepBundle,
        _config: &'a Value,
        _ctx: StepContext,
    ) -> BoxFuture<'a, std::result::Result<StepBundle, StepError>> {
        Box::pin(async move {
            let value = inputs
                .remove("value")
                .ok_or_else(|| StepError::new("missing input 'value'"))?;
            let mut out = StepBundle::new();
            out.insert("value".into(), value);
            Ok(out)
        })
    }
}
