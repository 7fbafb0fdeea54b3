//! Route scheduler.
//!
//! The engine owns the route registry and the global concurrency semaphore.
//! Every lifecycle operation validates and builds all affected routes before
//! touching any running one, so a configuration error never leaves the
//! engine half started or half reloaded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

use crate::adapters::AdapterRegistry;
use crate::config::EngineConfig;
use crate::definition::RouteDefinition;
use crate::error::{ConfigError, EngineError};
use crate::processor::StepServices;
use crate::route::{PreparedRoute, RouteHandle};
use crate::status::{RouteState, RouteStatus, StatusTracker};

/// What a reload changed, by route name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub restarted: Vec<String>,
    pub unchanged: Vec<String>,
}

#[derive(Default)]
struct EngineState {
    definitions: Vec<RouteDefinition>,
    handles: HashMap<String, RouteHandle>,
    trackers: HashMap<String, StatusTracker>,
    running: bool,
}

/// Runs a set of routes under one concurrency budget.
pub struct Engine {
    config: EngineConfig,
    registry: AdapterRegistry,
    env: HashMap<String, String>,
    semaphore: Arc<Semaphore>,
    services: StepServices,
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        definitions: Vec<RouteDefinition>,
        registry: AdapterRegistry,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_routes));
        let services = StepServices::new(config.default_timeout);
        Self {
            config,
            registry,
            env: HashMap::new(),
            semaphore,
            services,
            state: Mutex::new(EngineState {
                definitions,
                ..EngineState::default()
            }),
        }
    }

    /// Resolved environment variables exposed to templates as `env`.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Validate every enabled route, then start them all.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.running {
            return Err(EngineError::AlreadyRunning);
        }

        check_unique(&state.definitions)?;
        let prepared = self.prepare_all(state.definitions.iter())?;

        state.trackers.clear();
        for def in state.definitions.iter().filter(|d| !d.enabled) {
            let tracker = StatusTracker::new(&def.name);
            tracker.set_state(RouteState::Stopped);
            state.trackers.insert(def.name.clone(), tracker);
        }
        for (name, route) in prepared {
            self.launch(state, name, route);
        }
        state.running = true;

        tracing::info!(
            routes = state.handles.len(),
            capacity = self.capacity(),
            "Engine started"
        );
        Ok(())
    }

    /// Stop every route, giving in-flight executions `grace` to finish.
    pub async fn stop(&self, grace: Duration) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if !state.running {
            return Err(EngineError::NotRunning);
        }

        let handles: Vec<RouteHandle> = state.handles.drain().map(|(_, h)| h).collect();
        tracing::info!(routes = handles.len(), grace_ms = grace.as_millis() as u64, "Stopping engine");
        futures::future::join_all(handles.into_iter().map(|h| h.stop(grace))).await;
        state.running = false;

        tracing::info!(available_permits = self.available_permits(), "Engine stopped");
        Ok(())
    }

    /// Replace the route set.
    ///
    /// Removed routes are stopped, added routes started, changed routes
    /// stopped and started again, and unchanged routes keep running. When
    /// the engine is not running only the stored definitions are replaced.
    pub async fn reload(&self, definitions: Vec<RouteDefinition>) -> Result<ReloadSummary, EngineError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        check_unique(&definitions)?;

        let current: HashMap<&str, &RouteDefinition> = state
            .definitions
            .iter()
            .map(|d| (d.name.as_str(), d))
            .collect();
        let incoming: HashSet<&str> = definitions.iter().map(|d| d.name.as_str()).collect();

        let mut summary = ReloadSummary::default();
        for def in &definitions {
            match current.get(def.name.as_str()) {
                None => summary.added.push(def.name.clone()),
                Some(old) if *old == def => summary.unchanged.push(def.name.clone()),
                Some(_) => summary.restarted.push(def.name.clone()),
            }
        }
        summary.removed = state
            .definitions
            .iter()
            .filter(|d| !incoming.contains(d.name.as_str()))
            .map(|d| d.name.clone())
            .collect();

        if !state.running {
            state.definitions = definitions;
            return Ok(summary);
        }

        let changed: HashSet<&str> = summary
            .added
            .iter()
            .chain(&summary.restarted)
            .map(String::as_str)
            .collect();
        let prepared = self.prepare_all(definitions.iter().filter(|d| changed.contains(d.name.as_str())))?;

        let stopping: Vec<RouteHandle> = summary
            .removed
            .iter()
            .chain(&summary.restarted)
            .filter_map(|name| state.handles.remove(name))
            .collect();
        let grace = self.config.shutdown_grace;
        futures::future::join_all(stopping.into_iter().map(|h| h.stop(grace))).await;

        for name in summary.removed.iter().chain(&summary.restarted) {
            state.trackers.remove(name);
        }
        for def in definitions.iter().filter(|d| !d.enabled && changed.contains(d.name.as_str())) {
            let tracker = StatusTracker::new(&def.name);
            tracker.set_state(RouteState::Stopped);
            state.trackers.insert(def.name.clone(), tracker);
        }
        for (name, route) in prepared {
            self.launch(state, name, route);
        }
        state.definitions = definitions;

        tracing::info!(
            added = summary.added.len(),
            removed = summary.removed.len(),
            restarted = summary.restarted.len(),
            unchanged = summary.unchanged.len(),
            "Engine reloaded"
        );
        Ok(summary)
    }

    /// Status of every known route, sorted by name.
    pub async fn status(&self) -> Vec<RouteStatus> {
        let state = self.state.lock().await;
        let mut statuses: Vec<RouteStatus> = state.trackers.values().map(StatusTracker::snapshot).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub async fn route_status(&self, name: &str) -> Option<RouteStatus> {
        let state = self.state.lock().await;
        state.trackers.get(name).map(StatusTracker::snapshot)
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Names of the loaded routes, in declaration order.
    pub async fn route_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.definitions.iter().map(|d| d.name.clone()).collect()
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.config.max_concurrent_routes
    }

    fn prepare_all<'a>(
        &self,
        definitions: impl Iterator<Item = &'a RouteDefinition>,
    ) -> Result<Vec<(String, PreparedRoute)>, ConfigError> {
        definitions
            .filter(|def| def.enabled)
            .map(|def| {
                PreparedRoute::prepare(def, &self.registry, &self.services, &self.env, self.capacity())
                    .map(|route| (def.name.clone(), route))
            })
            .collect()
    }

    fn launch(&self, state: &mut EngineState, name: String, route: PreparedRoute) {
        let tracker = StatusTracker::new(&name);
        let handle = route.spawn(self.semaphore.clone(), tracker.clone());
        state.trackers.insert(name.clone(), tracker);
        state.handles.insert(name, handle);
    }
}

fn check_unique(definitions: &[RouteDefinition]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for def in definitions {
        if !seen.insert(def.name.as_str()) {
            return Err(ConfigError::DuplicateRoute(def.name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::parse_document;

    fn load(yaml: &str) -> (EngineConfig, Vec<RouteDefinition>) {
        let loaded = parse_document(yaml, |_| None).unwrap();
        (loaded.settings, loaded.routes)
    }

    const TWO_ROUTES: &str = r#"
settings:
  max_concurrent_routes: 4
routes:
  - name: a
    from: timer:1h
    to: memory:a
  - name: b
    from: timer:1h
    to: memory:b
  - name: paused
    from: timer:1h
    to: memory:paused
    enabled: false
"#;

    #[tokio::test]
    async fn test_start_and_stop() {
        let (config, routes) = load(TWO_ROUTES);
        let engine = Engine::new(config, routes, AdapterRegistry::with_builtins());

        engine.start().await.unwrap();
        assert!(engine.is_running().await);
        assert!(matches!(engine.start().await, Err(EngineError::AlreadyRunning)));

        let status = engine.status().await;
        assert_eq!(status.len(), 3);
        assert_eq!(engine.route_status("paused").await.unwrap().state, RouteState::Stopped);

        engine.stop(Duration::ZERO).await.unwrap();
        assert!(!engine.is_running().await);
        assert_eq!(engine.available_permits(), engine.capacity());
        assert_eq!(engine.route_status("a").await.unwrap().state, RouteState::Stopped);
        assert!(matches!(engine.stop(Duration::ZERO).await, Err(EngineError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_is_all_or_nothing() {
        let (config, mut routes) = load(TWO_ROUTES);
        routes[1].sinks[0].scheme = "smtp".to_string();
        let engine = Engine::new(config, routes, AdapterRegistry::with_builtins());

        let err = engine.start().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Config(ConfigError::UnknownAdapter { ref route, .. }) if route == "b"
        ));
        assert!(!engine.is_running().await);
        assert!(engine.status().await.is_empty());
    }

    #[tokio::test]
    async fn test_weight_above_capacity_is_rejected() {
        let (config, mut routes) = load(TWO_ROUTES);
        routes[0].weight = 5;
        let engine = Engine::new(config, routes, AdapterRegistry::with_builtins());
        assert!(matches!(
            engine.start().await,
            Err(EngineError::Config(ConfigError::InvalidRoute { .. }))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_names_are_rejected() {
        let (config, mut routes) = load(TWO_ROUTES);
        routes[1].name = "a".to_string();
        let engine = Engine::new(config, routes, AdapterRegistry::with_builtins());
        assert!(matches!(
            engine.start().await,
            Err(EngineError::Config(ConfigError::DuplicateRoute(_)))
        ));
    }

    #[tokio::test]
    async fn test_reload_while_stopped_only_replaces_definitions() {
        let (config, routes) = load(TWO_ROUTES);
        let engine = Engine::new(config, routes.clone(), AdapterRegistry::with_builtins());

        let summary = engine.reload(routes[..1].to_vec()).await.unwrap();
        assert_eq!(summary.removed, vec!["b".to_string(), "paused".to_string()]);
        assert_eq!(summary.unchanged, vec!["a".to_string()]);
        assert_eq!(engine.route_names().await, vec!["a".to_string()]);
    }
}
