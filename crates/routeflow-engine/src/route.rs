//! Per-route execution loop.
//!
//! A running route is two tasks joined by a bounded queue:
//!
//! - the pump pulls triggers from the source and queues them, dropping (and
//!   counting) triggers once the queue is full;
//! - the worker takes one queued trigger at a time, acquires the route's
//!   permits from the global semaphore and runs the pipeline to a terminal
//!   outcome before taking the next one.
//!
//! Stopping cancels the `shutdown` token, which ends both loops at their
//! next wait. In-flight executions get the grace period to finish before
//! the `abort` token cancels them.

use futures::FutureExt;
use routeflow_tools::{MessageContext, TemplateEngine};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::{AdapterRegistry, Message, Sink, Source};
use crate::definition::{RetryOn, RouteDefinition};
use crate::error::{error_chain, ConfigError, DeliveryError, RouteError};
use crate::outcome::ExecutionResult;
use crate::processor::{ChainOutcome, ProcessorChain, StepServices};
use crate::status::{RouteState, StatusTracker};

const DEFAULT_FAILURE_MESSAGE: &str =
    "Route '{{ route }}' failed after {{ attempt }} attempt(s): {{ last_error }}";

const SOURCE_BACKOFF_MIN: Duration = Duration::from_millis(100);
const SOURCE_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Where a retried attempt picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    Step(usize),
    Delivery,
}

enum Attempt {
    Delivered(Vec<DeliveryError>),
    FilteredOut { step: usize, reason: String },
}

/// Await `fut` unless `token` is cancelled first.
async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> Result<F::Output, RouteError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(RouteError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Compiled processor chain plus built sinks of one route.
pub struct RoutePipeline {
    definition: Arc<RouteDefinition>,
    chain: ProcessorChain,
    sinks: Vec<Arc<dyn Sink>>,
    notify: Option<Arc<dyn Sink>>,
    templates: Arc<TemplateEngine>,
    env: HashMap<String, String>,
}

impl RoutePipeline {
    pub fn definition(&self) -> &RouteDefinition {
        &self.definition
    }

    /// Run one trigger to a terminal outcome, retrying and notifying per the
    /// route's error handlers.
    pub async fn execute(&self, message: Message, abort: &CancellationToken) -> ExecutionResult {
        let ctx = self.context(&message);
        self.run(ctx, message, Resume::Step(0), abort).await
    }

    /// When an aggregate step's window closes, with the step index.
    pub fn flush_deadline(&self) -> Option<(usize, tokio::time::Instant)> {
        self.chain.next_flush()
    }

    /// Release the expired aggregate buffer at `step` and run the rest of
    /// the route with it. Returns `None` when nothing was due.
    pub async fn flush(&self, step: usize, abort: &CancellationToken) -> Option<ExecutionResult> {
        let trigger = Message::new(serde_json::Value::Null).with_metadata("flush", serde_json::json!(true));
        let mut ctx = self.context(&trigger);
        if !self.chain.flush(step, &mut ctx) {
            return None;
        }
        let message = Message {
            payload: ctx.payload.clone(),
            metadata: trigger.metadata,
        };
        Some(self.run(ctx, message, Resume::Step(step + 1), abort).await)
    }

    fn context(&self, message: &Message) -> MessageContext {
        MessageContext::new(&self.definition.name, message.payload.clone())
            .with_meta(message.metadata.clone())
            .with_env(self.env.clone())
    }

    async fn run(
        &self,
        mut ctx: MessageContext,
        message: Message,
        mut resume: Resume,
        abort: &CancellationToken,
    ) -> ExecutionResult {
        let def = &self.definition;
        let max_attempts = def.handlers.max_attempts();

        loop {
            let (error, failed_at) = match self.attempt(&mut ctx, &message, resume, abort).await {
                Ok(Attempt::Delivered(failed_sinks)) => {
                    return ExecutionResult::Delivered {
                        attempts: ctx.attempt,
                        failed_sinks,
                    }
                }
                Ok(Attempt::FilteredOut { step, reason }) => {
                    return ExecutionResult::FilteredOut {
                        step,
                        reason,
                        attempts: ctx.attempt,
                    }
                }
                Err(failure) => failure,
            };

            if matches!(error, RouteError::Cancelled) {
                return ExecutionResult::Failed {
                    error,
                    attempts: ctx.attempt,
                };
            }

            let retry = def.handlers.retry.as_ref().filter(|policy| {
                ctx.attempt < max_attempts
                    && match policy.on {
                        RetryOn::Any => true,
                        RetryOn::Timeout => error.is_timeout(),
                    }
            });

            let Some(policy) = retry else {
                let attempts = ctx.attempt;
                self.on_failure(&mut ctx, &message, &error, abort).await;
                return ExecutionResult::Failed { error, attempts };
            };

            let delay = policy.delay_after(ctx.attempt);
            let cause = error.to_string();
            tracing::warn!(
                route = %def.name,
                attempt = ctx.attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %cause,
                "Attempt failed, retrying"
            );

            if cancellable(abort, tokio::time::sleep(delay)).await.is_err() {
                return ExecutionResult::Failed {
                    error: RouteError::Cancelled,
                    attempts: ctx.attempt,
                };
            }
            ctx.begin_retry(cause);
            resume = failed_at;
        }
    }

    /// One pass from `resume` through delivery.
    async fn attempt(
        &self,
        ctx: &mut MessageContext,
        message: &Message,
        resume: Resume,
        abort: &CancellationToken,
    ) -> Result<Attempt, (RouteError, Resume)> {
        if let Resume::Step(start) = resume {
            let outcome = cancellable(abort, self.chain.run_from(start, ctx))
                .await
                .map_err(|e| (e, resume))?;
            match outcome {
                ChainOutcome::Completed => {}
                ChainOutcome::FilteredOut { step, reason } => {
                    return Ok(Attempt::FilteredOut { step, reason })
                }
                ChainOutcome::Failed(e) => {
                    let step = e.step;
                    return Err((RouteError::Processor(e), Resume::Step(step)));
                }
            }
        }

        let outgoing = Message {
            payload: ctx.payload.clone(),
            metadata: message.metadata.clone(),
        };
        self.deliver(&outgoing, abort)
            .await
            .map(Attempt::Delivered)
            .map_err(|e| (e, Resume::Delivery))
    }

    /// Fan out to every sink in declared order.
    ///
    /// Returns the failures of individual sinks when at least one succeeded.
    async fn deliver(
        &self,
        message: &Message,
        abort: &CancellationToken,
    ) -> Result<Vec<DeliveryError>, RouteError> {
        let timeout = self.definition.timeout;
        let mut failures = Vec::new();
        let mut delivered = false;

        for sink in &self.sinks {
            match cancellable(abort, tokio::time::timeout(timeout, sink.deliver(message))).await? {
                Ok(Ok(())) => delivered = true,
                Ok(Err(e)) => failures.push(e),
                Err(_) => failures.push(DeliveryError::Timeout {
                    sink: sink.name().to_string(),
                    after: timeout,
                }),
            }
        }

        for failure in &failures {
            tracing::warn!(route = %self.definition.name, error = %failure, "Sink delivery failed");
        }

        if delivered {
            Ok(failures)
        } else {
            Err(RouteError::Delivery(failures))
        }
    }

    /// Run the failure log and notify handlers once attempts are exhausted.
    async fn on_failure(
        &self,
        ctx: &mut MessageContext,
        message: &Message,
        error: &RouteError,
        abort: &CancellationToken,
    ) {
        let handlers = &self.definition.handlers;
        ctx.last_error = Some(error.to_string());

        if let Some(log) = &handlers.log {
            let text = self.render_failure(log.message.as_deref(), ctx, error);
            tracing::error!(route = %ctx.route, origin = "error_handler", "{}", text);
        }

        let (Some(policy), Some(sink)) = (&handlers.notify, &self.notify) else {
            return;
        };

        let text = self.render_failure(policy.message.as_deref(), ctx, error);
        let notification = Message::new(serde_json::json!({
            "route": ctx.route,
            "error": ctx.last_error,
            "attempts": ctx.attempt,
            "message": text,
            "payload": message.payload,
            "context": ctx.to_document(),
        }))
        .with_metadata("notify", serde_json::json!(true));

        let timeout = self.definition.timeout;
        let result = match cancellable(abort, tokio::time::timeout(timeout, sink.deliver(&notification))).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeliveryError::Timeout {
                sink: sink.name().to_string(),
                after: timeout,
            }),
            Err(_) => return,
        };
        if let Err(e) = result {
            tracing::warn!(route = %ctx.route, error = %e, "Failure notification was not delivered");
        }
    }

    fn render_failure(&self, template: Option<&str>, ctx: &MessageContext, error: &RouteError) -> String {
        let template = template.unwrap_or(DEFAULT_FAILURE_MESSAGE);
        self.templates
            .render_with_context(template, ctx)
            .unwrap_or_else(|e| {
                tracing::warn!(route = %ctx.route, error = %e, "Failure message template failed");
                format!(
                    "Route '{}' failed after {} attempt(s): {}",
                    ctx.route, ctx.attempt, error
                )
            })
    }

    /// Emit the single terminal log event of a firing.
    fn report(&self, result: &ExecutionResult) {
        let route = &self.definition.name;
        match result {
            ExecutionResult::Delivered {
                attempts,
                failed_sinks,
            } => tracing::info!(
                route = %route,
                outcome = "delivered",
                attempts,
                failed_sinks = failed_sinks.len(),
                "Route delivered"
            ),
            ExecutionResult::FilteredOut {
                step,
                reason,
                attempts,
            } => tracing::info!(
                route = %route,
                outcome = "filtered_out",
                step,
                reason = %reason,
                attempts,
                "Route filtered out"
            ),
            ExecutionResult::Failed { error, attempts } => tracing::error!(
                route = %route,
                outcome = "failed",
                attempts,
                timeout = error.is_timeout(),
                error = %error,
                causes = ?error_chain(error),
                "Route failed"
            ),
        }
    }
}

/// A route whose adapters and chain are built but not yet running.
pub struct PreparedRoute {
    source: Box<dyn Source>,
    pipeline: Arc<RoutePipeline>,
}

impl PreparedRoute {
    /// Build everything a route needs, failing on the first problem.
    ///
    /// `capacity` is the size of the global semaphore the route will run under.
    pub fn prepare(
        definition: &RouteDefinition,
        registry: &AdapterRegistry,
        services: &StepServices,
        env: &HashMap<String, String>,
        capacity: usize,
    ) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidRoute {
            route: definition.name.clone(),
            message,
        };

        if definition.weight == 0 || definition.weight as usize > capacity {
            return Err(invalid(format!(
                "weight {} exceeds the concurrency capacity of {}",
                definition.weight, capacity
            )));
        }
        if definition.timeout.is_zero() {
            return Err(invalid("timeout must be greater than zero".to_string()));
        }
        if definition.queue_depth == 0 {
            return Err(invalid("queue_depth must be at least 1".to_string()));
        }
        if definition.sinks.is_empty() {
            return Err(invalid("at least one destination is required".to_string()));
        }

        let handlers = &definition.handlers;
        let templates = handlers
            .log
            .as_ref()
            .and_then(|l| l.message.as_deref())
            .into_iter()
            .chain(handlers.notify.as_ref().and_then(|n| n.message.as_deref()));
        for template in templates {
            services
                .templates
                .check_template(template)
                .map_err(|e| invalid(format!("invalid handler message: {}", e)))?;
        }

        let chain = ProcessorChain::compile(
            &definition.name,
            &definition.processors,
            &services.with_timeout(definition.timeout),
        )?;

        let source = registry.create_source(&definition.name, &definition.source)?;
        let sinks = definition
            .sinks
            .iter()
            .map(|endpoint| registry.create_sink(&definition.name, endpoint))
            .collect::<Result<Vec<_>, _>>()?;
        let notify = handlers
            .notify
            .as_ref()
            .map(|n| registry.create_sink(&definition.name, &n.to))
            .transpose()?;

        Ok(Self {
            source,
            pipeline: Arc::new(RoutePipeline {
                definition: Arc::new(definition.clone()),
                chain,
                sinks,
                notify,
                templates: services.templates.clone(),
                env: env.clone(),
            }),
        })
    }

    pub fn pipeline(&self) -> Arc<RoutePipeline> {
        self.pipeline.clone()
    }

    /// Start the pump and worker tasks.
    pub fn spawn(self, semaphore: Arc<Semaphore>, status: StatusTracker) -> RouteHandle {
        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.pipeline.definition.queue_depth);

        tracing::info!(
            route = %self.pipeline.definition.name,
            source = %self.pipeline.definition.source,
            sinks = self.pipeline.sinks.len(),
            steps = self.pipeline.chain.len(),
            "Starting route"
        );

        let pump = tokio::spawn(run_pump(
            self.source,
            tx,
            self.pipeline.definition.name.clone(),
            status.clone(),
            shutdown.clone(),
        ));
        let worker = tokio::spawn(run_worker(
            rx,
            self.pipeline,
            semaphore,
            status.clone(),
            shutdown.clone(),
            abort.clone(),
        ));

        RouteHandle {
            shutdown,
            abort,
            pump,
            worker,
            status,
        }
    }
}

async fn run_pump(
    mut source: Box<dyn Source>,
    queue: mpsc::Sender<Message>,
    route: String,
    status: StatusTracker,
    shutdown: CancellationToken,
) {
    let mut backoff = SOURCE_BACKOFF_MIN;

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = source.next() => next,
        };

        match next {
            Ok(Some(message)) => {
                backoff = SOURCE_BACKOFF_MIN;
                match queue.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        status.record_dropped();
                        tracing::warn!(route = %route, "Route queue is full, dropping trigger");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Ok(None) => {
                tracing::info!(route = %route, "Source exhausted");
                break;
            }
            Err(e) => {
                status.record_source_error(&e.to_string());
                tracing::warn!(
                    route = %route,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "Source failed"
                );
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(SOURCE_BACKOFF_MAX);
            }
        }
    }

    source.close().await;
}

async fn run_worker(
    mut queue: mpsc::Receiver<Message>,
    pipeline: Arc<RoutePipeline>,
    semaphore: Arc<Semaphore>,
    status: StatusTracker,
    shutdown: CancellationToken,
    abort: CancellationToken,
) {
    let weight = pipeline.definition.weight;

    loop {
        status.set_state(RouteState::Idle);
        let flush = pipeline.flush_deadline();
        let trigger = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = queue.recv() => match message {
                Some(message) => Trigger::Message(message),
                None => break,
            },
            step = flush_due(flush) => Trigger::Flush(step),
        };

        status.set_state(RouteState::Triggered);
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = semaphore.clone().acquire_many_owned(weight) => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        status.set_state(RouteState::Running);
        let execution = async {
            match trigger {
                Trigger::Message(message) => Some(pipeline.execute(message, &abort).await),
                Trigger::Flush(step) => pipeline.flush(step, &abort).await,
            }
        };
        let result = match AssertUnwindSafe(execution).catch_unwind().await {
            Ok(Some(result)) => result,
            Ok(None) => continue,
            // The panicking attempt is counted as one.
            Err(panic) => ExecutionResult::Failed {
                error: RouteError::Panicked(panic_message(panic.as_ref())),
                attempts: 1,
            },
        };
        drop(permit);

        status.record(&result);
        pipeline.report(&result);
    }

    status.set_state(RouteState::Stopped);
}

enum Trigger {
    Message(Message),
    /// An aggregate window closed at this step.
    Flush(usize),
}

async fn flush_due(deadline: Option<(usize, tokio::time::Instant)>) -> usize {
    match deadline {
        Some((step, at)) => {
            tokio::time::sleep_until(at).await;
            step
        }
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a running route.
pub struct RouteHandle {
    shutdown: CancellationToken,
    abort: CancellationToken,
    pump: JoinHandle<()>,
    worker: JoinHandle<()>,
    status: StatusTracker,
}

impl RouteHandle {
    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    /// Stop taking triggers, give the in-flight execution `grace` to finish,
    /// then cancel it.
    pub async fn stop(mut self, grace: Duration) {
        let name = self.status.snapshot().name;
        self.shutdown.cancel();

        let finished = match tokio::time::timeout(grace, &mut self.worker).await {
            Ok(finished) => finished,
            Err(_) => {
                tracing::warn!(
                    route = %name,
                    grace_ms = grace.as_millis() as u64,
                    "Grace period elapsed, cancelling in-flight execution"
                );
                self.abort.cancel();
                (&mut self.worker).await
            }
        };
        if let Err(e) = finished {
            tracing::error!(route = %name, error = %e, "Route worker ended abnormally");
        }
        if let Err(e) = self.pump.await {
            tracing::error!(route = %name, error = %e, "Route source task ended abnormally");
        }

        self.status.set_state(RouteState::Stopped);
        tracing::info!(route = %name, "Route stopped");
    }
}
