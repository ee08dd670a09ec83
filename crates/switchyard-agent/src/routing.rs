use serde_json::Value;
use tracing::debug;

use switchyard_core::config::{RouteDefinition, RoutePolicy};
use switchyard_core::error::{Result, SwitchyardError};
use switchyard_core::traits::{is_truthy, ExpressionEvaluator};
use switchyard_core::types::{kind_of, WorkflowState};

/// A route whose condition held, with the state it will carry.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    /// Index of the route in declaration order.
    pub route: usize,
    /// Topic names to publish to; empty for a side-effect-only route.
    pub receivers: Vec<String>,
    /// Outgoing state: the transform result, or the forwarded state.
    pub state: WorkflowState,
}

impl RouteDecision {
    /// A terminal route that yields a result without republishing.
    pub fn is_side_effect_only(&self) -> bool {
        self.receivers.is_empty()
    }
}

/// Check a route at build time.
pub fn validate_route(
    agent: &str,
    index: usize,
    route: &RouteDefinition,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<()> {
    let malformed = |reason: String| SwitchyardError::MalformedRoute {
        agent: agent.to_string(),
        index,
        reason,
    };

    if route.condition.trim().is_empty() {
        return Err(malformed("condition is empty".into()));
    }
    if route.receivers.is_empty() && route.transform.is_none() {
        return Err(malformed("route has neither receivers nor a transform".into()));
    }
    if let Some(blank) = route.receivers.iter().find(|r| r.trim().is_empty()) {
        return Err(malformed(format!("receiver name `{}` is blank", blank)));
    }
    evaluator
        .validate(&route.condition)
        .map_err(|e| malformed(e.to_string()))?;
    if let Some(transform) = &route.transform {
        evaluator
            .validate(transform)
            .map_err(|e| malformed(e.to_string()))?;
    }
    Ok(())
}

/// Evaluate routes in declaration order against the merged state.
///
/// `merged` is what conditions and transforms see; `outgoing` is forwarded
/// as-is by routes without a transform. Zero matches is not an error.
pub fn select_routes(
    routes: &[RouteDefinition],
    policy: RoutePolicy,
    evaluator: &dyn ExpressionEvaluator,
    merged: &WorkflowState,
    outgoing: &WorkflowState,
) -> Result<Vec<RouteDecision>> {
    let view = merged.to_value();
    let mut decisions = Vec::new();

    for (index, route) in routes.iter().enumerate() {
        let verdict = evaluator.evaluate(&route.condition, &view)?;
        if !is_truthy(&verdict) {
            debug!(route = index, condition = %route.condition, "Route condition not met");
            continue;
        }

        let state = match &route.transform {
            Some(transform) => match evaluator.evaluate(transform, &view)? {
                Value::Object(data) => WorkflowState {
                    correlation_id: merged.correlation_id.clone(),
                    data,
                },
                other => {
                    return Err(SwitchyardError::expression(
                        transform.as_str(),
                        format!("transform must produce a mapping, got {}", kind_of(&other)),
                    ))
                }
            },
            None => outgoing.clone(),
        };

        decisions.push(RouteDecision {
            route: index,
            receivers: route.receivers.clone(),
            state,
        });

        if policy == RoutePolicy::FirstMatch {
            break;
        }
    }

    Ok(decisions)
}
