use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use switchyard_core::config::RuntimeSettings;
use switchyard_core::error::{Result, SwitchyardError};
use switchyard_core::event::EventBus;
use switchyard_core::state::WorkflowScope;
use switchyard_core::traits::ExpressionEvaluator;
use switchyard_core::types::{CorrelationId, RuntimeEvent, TopicId, WorkflowState};

use crate::completion::{CompletionHandle, CompletionRegistrar, Resolution};
use crate::handler::AgentHandler;
use crate::pause::PauseController;
use crate::routing::select_routes;
use crate::store::{WorkflowLease, WorkflowStore};

/// An accepted publish, queued or in flight.
#[derive(Debug)]
pub struct Envelope {
    pub topic: TopicId,
    pub state: WorkflowState,
    pub cancel: CancellationToken,
    /// Publishes chained before this one.
    pub hops: usize,
    /// Keeps the workflow's layer alive until this publish is finished with.
    lease: WorkflowLease,
}

/// What happened to an accepted publish.
#[derive(Debug)]
pub enum Delivery {
    /// An agent invocation was started.
    Dispatched(InvocationHandle),
    /// The publish landed on a completion; only the first one resolves it.
    Resolved,
    /// The topic is paused; the publish is held.
    Queued { depth: usize },
}

impl Delivery {
    /// The invocation handle, if an agent was invoked.
    pub fn into_invocation(self) -> Option<InvocationHandle> {
        match self {
            Self::Dispatched(handle) => Some(handle),
            _ => None,
        }
    }
}

/// Summary of one agent invocation.
#[derive(Debug, Clone)]
pub struct InvocationReport {
    pub topic: TopicId,
    pub steps_run: usize,
    /// Indices of routes whose condition held.
    pub routes_matched: Vec<usize>,
    /// Downstream identities that accepted a publish.
    pub published: Vec<TopicId>,
    /// States produced by side-effect-only routes.
    pub responses: Vec<WorkflowState>,
    pub elapsed_ms: u64,
}

/// A running agent invocation. Dropping it detaches the task.
#[derive(Debug)]
pub struct InvocationHandle {
    topic: TopicId,
    task: JoinHandle<Result<InvocationReport>>,
}

impl InvocationHandle {
    pub fn topic(&self) -> &TopicId {
        &self.topic
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for this invocation (not its downstream agents) to finish.
    pub async fn join(self) -> Result<InvocationReport> {
        self.task
            .await
            .map_err(|e| SwitchyardError::Join(e.to_string()))?
    }
}

/// Compiled handlers keyed by topic name. One handler per topic.
#[derive(Debug, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<AgentHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to its topic name.
    pub fn subscribe(&mut self, handler: AgentHandler) -> Result<()> {
        let topic = handler.topic().to_string();
        if self.handlers.contains_key(&topic) {
            return Err(SwitchyardError::DuplicateTopic(topic));
        }
        self.handlers.insert(topic, Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, topic: &str) -> Option<Arc<AgentHandler>> {
        self.handlers.get(topic).cloned()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    /// Subscribed topic names, sorted.
    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        topics.sort_unstable();
        topics
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Topic-addressed dispatcher.
///
/// Delivers each publish to the registered completion for that exact identity,
/// or else to the handler subscribed to the topic name, which runs as its own
/// task. Publishing never waits on downstream agents.
pub struct MessageBus {
    handlers: HandlerTable,
    evaluator: Arc<dyn ExpressionEvaluator>,
    completions: CompletionRegistrar,
    pauses: PauseController<Envelope>,
    workflows: WorkflowStore,
    events: Arc<EventBus>,
    max_hops: usize,
}

impl MessageBus {
    pub fn new(
        handlers: HandlerTable,
        evaluator: Arc<dyn ExpressionEvaluator>,
        settings: &RuntimeSettings,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            handlers,
            evaluator,
            completions: CompletionRegistrar::new(),
            pauses: PauseController::new(settings.pause_queue),
            workflows: WorkflowStore::new(),
            events,
            max_hops: settings.max_hops,
        }
    }

    /// Publish `state` to `topic`. Must be called within a tokio runtime.
    pub fn publish(
        self: &Arc<Self>,
        state: WorkflowState,
        topic: TopicId,
        cancel: CancellationToken,
    ) -> Result<Delivery> {
        self.deliver(topic, state, cancel, 0)
    }

    /// Return the pending completion for `topic`, registering it if needed.
    ///
    /// The workflow's layer is kept until the completion resolves. A caller
    /// that stops waiting first hands it back with `abandon_workflow`.
    pub fn completion(&self, topic: &TopicId) -> CompletionHandle {
        self.workflows.await_completion(topic.correlation_id());
        self.completions.get_or_create(topic)
    }

    pub fn completions(&self) -> &CompletionRegistrar {
        &self.completions
    }

    /// Hold future publishes to `topic` until resumed.
    pub fn pause(&self, topic: &TopicId) -> bool {
        let newly = self.pauses.pause(topic);
        if newly {
            info!(topic = %topic, "Topic paused");
        }
        newly
    }

    /// Unpause `topic` and dispatch whatever was held, in arrival order.
    pub fn resume(self: &Arc<Self>, topic: &TopicId) -> Vec<Result<Delivery>> {
        let held = self.pauses.resume(topic);
        info!(topic = %topic, released = held.len(), "Topic resumed");
        self.events.publish(RuntimeEvent::Resumed {
            topic: topic.clone(),
            released: held.len(),
        });
        held.into_iter().map(|env| self.dispatch(env)).collect()
    }

    pub fn is_paused(&self, topic: &TopicId) -> bool {
        self.pauses.is_paused(topic)
    }

    pub fn queued(&self, topic: &TopicId) -> usize {
        self.pauses.queued(topic)
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The Workflow-scope layer of a running workflow.
    pub fn workflow_scope(&self, correlation_id: &CorrelationId) -> Option<WorkflowScope> {
        self.workflows.scope(correlation_id)
    }

    pub fn has_workflow_scope(&self, correlation_id: &CorrelationId) -> bool {
        self.workflows.contains(correlation_id)
    }

    /// Publishes of a workflow that are queued or still running.
    pub fn outstanding(&self, correlation_id: &CorrelationId) -> usize {
        self.workflows.live(correlation_id)
    }

    /// The driver of `correlation_id` stopped waiting; its layer goes once
    /// outstanding publishes finish.
    pub fn abandon_workflow(&self, correlation_id: &CorrelationId) -> bool {
        self.workflows.settle(correlation_id)
    }

    fn deliver(
        self: &Arc<Self>,
        topic: TopicId,
        state: WorkflowState,
        cancel: CancellationToken,
        hops: usize,
    ) -> Result<Delivery> {
        if cancel.is_cancelled() {
            return Err(SwitchyardError::Cancelled);
        }
        if hops > self.max_hops {
            return Err(SwitchyardError::HopLimitExceeded {
                topic,
                limit: self.max_hops,
            });
        }
        if !self.completions.accepts(&topic) && !self.handlers.contains(topic.topic())
        {
            warn!(topic = %topic, "Publish to unrouted topic");
            return Err(SwitchyardError::UnroutedTopic(topic));
        }

        let env = Envelope {
            lease: self.workflows.lease(topic.correlation_id()),
            topic: topic.clone(),
            state,
            cancel,
            hops,
        };
        match self.pauses.hold(&topic, env) {
            Ok(depth) => {
                info!(topic = %topic, depth, "Topic paused, publish held");
                self.events.publish(RuntimeEvent::Queued { topic, depth });
                Ok(Delivery::Queued { depth })
            }
            Err(env) => self.dispatch(env),
        }
    }

    fn dispatch(self: &Arc<Self>, env: Envelope) -> Result<Delivery> {
        let Envelope {
            topic,
            state,
            cancel,
            hops,
            lease,
        } = env;
        if cancel.is_cancelled() {
            return Err(SwitchyardError::Cancelled);
        }

        let state = match self.completions.resolve(&topic, state) {
            Ok(Resolution::Resolved) => {
                info!(topic = %topic, "Workflow completed");
                self.workflows.settle(topic.correlation_id());
                self.events.publish(RuntimeEvent::Completed { topic });
                return Ok(Delivery::Resolved);
            }
            Ok(Resolution::AlreadyResolved) => {
                debug!(topic = %topic, "Completion already resolved, publish ignored");
                return Ok(Delivery::Resolved);
            }
            Err(state) => state,
        };

        let handler = self
            .handlers
            .get(topic.topic())
            .ok_or_else(|| SwitchyardError::UnroutedTopic(topic.clone()))?;

        self.events.publish(RuntimeEvent::Published {
            topic: topic.clone(),
            at: Utc::now(),
        });
        let env = Envelope {
            topic: topic.clone(),
            state,
            cancel,
            hops,
            lease,
        };
        let task = tokio::spawn(Arc::clone(self).run_invocation(handler, env));
        Ok(Delivery::Dispatched(InvocationHandle { topic, task }))
    }

    fn run_invocation(
        self: Arc<Self>,
        handler: Arc<AgentHandler>,
        env: Envelope,
    ) -> BoxFuture<'static, Result<InvocationReport>> {
        Box::pin(async move {
            let topic = env.topic.clone();
            let started = Instant::now();
            info!(
                agent = %handler.topic(),
                correlation_id = %topic.correlation_id(),
                hops = env.hops,
                "Invoking agent"
            );
            self.events
                .publish(RuntimeEvent::AgentStarted { topic: topic.clone() });

            let result = self.invoke(&handler, env, started).await;
            match &result {
                Ok(report) => {
                    info!(
                        agent = %handler.topic(),
                        correlation_id = %topic.correlation_id(),
                        routes_matched = report.routes_matched.len(),
                        elapsed_ms = report.elapsed_ms,
                        "Agent invocation complete"
                    );
                    self.events.publish(RuntimeEvent::AgentCompleted {
                        topic,
                        routes_matched: report.routes_matched.len(),
                        elapsed_ms: report.elapsed_ms,
                    });
                }
                Err(e) => {
                    error!(
                        agent = %handler.topic(),
                        correlation_id = %topic.correlation_id(),
                        error = %e,
                        "Agent invocation failed"
                    );
                    self.events.publish(RuntimeEvent::AgentFailed {
                        topic,
                        error: e.to_string(),
                    });
                }
            }
            result
        })
    }

    async fn invoke(
        self: &Arc<Self>,
        handler: &AgentHandler,
        env: Envelope,
        started: Instant,
    ) -> Result<InvocationReport> {
        let Envelope {
            topic,
            state,
            cancel,
            hops,
            lease,
        } = env;

        let outcome = handler
            .run_pipeline(state, lease.scope().clone(), &topic, &cancel, &self.events)
            .await?;
        let merged = outcome.state.merged().await;
        let outgoing = outcome.state.into_outgoing();

        let decisions = select_routes(
            handler.routes(),
            handler.route_policy(),
            self.evaluator.as_ref(),
            &merged,
            &outgoing,
        )?;

        let mut report = InvocationReport {
            topic: topic.clone(),
            steps_run: outcome.steps_run,
            routes_matched: Vec::with_capacity(decisions.len()),
            published: Vec::new(),
            responses: Vec::new(),
            elapsed_ms: 0,
        };
        let mut first_error = None;

        for decision in decisions {
            report.routes_matched.push(decision.route);
            self.events.publish(RuntimeEvent::RouteMatched {
                topic: topic.clone(),
                route: decision.route,
                receivers: decision.receivers.clone(),
            });

            if decision.is_side_effect_only() {
                debug!(agent = %handler.topic(), route = decision.route, "Side-effect route produced a response");
                report.responses.push(decision.state);
                continue;
            }

            for receiver in &decision.receivers {
                let target = topic.sibling(receiver.as_str());
                match self.deliver(target.clone(), decision.state.clone(), cancel.clone(), hops + 1) {
                    Ok(_) => report.published.push(target),
                    Err(e) => {
                        warn!(from = %topic, to = %target, error = %e, "Route publish failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        // downstream publishes hold their own leases by now
        drop(lease);
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}
