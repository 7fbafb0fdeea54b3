//! Adapter registry keyed by endpoint scheme.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use super::http::default_client;
use super::{
    ChannelSource, FileSink, FileTailPoller, HttpPoller, HttpSink, LogSink, MemorySink, Message,
    PollingSource, Sink, Source, TimerSource,
};
use crate::definition::{Endpoint, RouteDefinition};
use crate::error::ConfigError;

/// Builds a source from a parsed endpoint.
pub type SourceFactory =
    Arc<dyn Fn(&Endpoint) -> Result<Box<dyn Source>, ConfigError> + Send + Sync>;

/// Builds a sink from a parsed endpoint.
pub type SinkFactory = Arc<dyn Fn(&Endpoint) -> Result<Arc<dyn Sink>, ConfigError> + Send + Sync>;

type Channels = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>>>>;

/// Capacity of channels created by [`AdapterRegistry::register_channel`].
pub const CHANNEL_CAPACITY: usize = 1024;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Registry of source and sink kinds.
#[derive(Clone)]
pub struct AdapterRegistry {
    sources: HashMap<String, SourceFactory>,
    sinks: HashMap<String, SinkFactory>,
    channels: Channels,
    memory: Arc<Mutex<HashMap<String, MemorySink>>>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            sinks: HashMap::new(),
            channels: Arc::default(),
            memory: Arc::default(),
        }
    }

    /// Registry with the built-in kinds:
    /// sources `timer`, `file`, `http`, `https`, `channel`;
    /// sinks `log`, `file`, `http`, `https`, `memory`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let client = default_client();

        registry.register_source("timer", |ep: &Endpoint| {
            Ok(Box::new(TimerSource::from_endpoint(ep)?) as Box<dyn Source>)
        });
        registry.register_source("file", |ep: &Endpoint| {
            let every = poll_interval(ep)?;
            Ok(Box::new(PollingSource::new(FileTailPoller::new(&ep.path), every)) as Box<dyn Source>)
        });
        for scheme in ["http", "https"] {
            let client = client.clone();
            registry.register_source(scheme, move |ep: &Endpoint| {
                let every = poll_interval(ep)?;
                let poller = HttpPoller::from_endpoint(client.clone(), ep)?;
                Ok(Box::new(PollingSource::new(poller, every)) as Box<dyn Source>)
            });
        }
        let channels = registry.channels.clone();
        registry.register_source("channel", move |ep: &Endpoint| {
            let receiver = channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&ep.path)
                .cloned()
                .ok_or_else(|| ConfigError::InvalidEndpoint {
                    uri: ep.uri.clone(),
                    message: format!("no channel registered as '{}'", ep.path),
                })?;
            Ok(Box::new(ChannelSource::new(receiver)) as Box<dyn Source>)
        });

        registry.register_sink("log", |ep: &Endpoint| {
            Ok(Arc::new(LogSink::from_endpoint(ep)?) as Arc<dyn Sink>)
        });
        registry.register_sink("file", |ep: &Endpoint| {
            Ok(Arc::new(FileSink::from_endpoint(ep)?) as Arc<dyn Sink>)
        });
        for scheme in ["http", "https"] {
            let client = client.clone();
            registry.register_sink(scheme, move |ep: &Endpoint| {
                Ok(Arc::new(HttpSink::from_endpoint(client.clone(), ep)?) as Arc<dyn Sink>)
            });
        }
        let memory = registry.memory.clone();
        registry.register_sink("memory", move |ep: &Endpoint| {
            Ok(Arc::new(memory_entry(&memory, &ep.path)) as Arc<dyn Sink>)
        });

        registry
    }

    /// Register (or replace) a source kind.
    pub fn register_source<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&Endpoint) -> Result<Box<dyn Source>, ConfigError> + Send + Sync + 'static,
    {
        self.sources
            .insert(scheme.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Register (or replace) a sink kind.
    pub fn register_sink<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&Endpoint) -> Result<Arc<dyn Sink>, ConfigError> + Send + Sync + 'static,
    {
        self.sinks.insert(scheme.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Create the channel behind `channel:<name>` and return its sender.
    ///
    /// Registering the same name again replaces the channel.
    pub fn register_channel(&self, name: &str) -> mpsc::Sender<Message> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(tokio::sync::Mutex::new(rx)));
        tx
    }

    /// The recording sink behind `memory:<name>`, created on first use.
    pub fn memory_sink(&self, name: &str) -> MemorySink {
        memory_entry(&self.memory, name)
    }

    pub fn has_source(&self, scheme: &str) -> bool {
        self.sources.contains_key(&scheme.to_ascii_lowercase())
    }

    pub fn has_sink(&self, scheme: &str) -> bool {
        self.sinks.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Build the source of `route`.
    pub fn create_source(&self, route: &str, endpoint: &Endpoint) -> Result<Box<dyn Source>, ConfigError> {
        let factory = self
            .sources
            .get(&endpoint.scheme)
            .ok_or_else(|| unknown(route, "source", endpoint))?;
        factory(endpoint)
    }

    /// Build one sink (or notify target) of `route`.
    pub fn create_sink(&self, route: &str, endpoint: &Endpoint) -> Result<Arc<dyn Sink>, ConfigError> {
        let factory = self
            .sinks
            .get(&endpoint.scheme)
            .ok_or_else(|| unknown(route, "sink", endpoint))?;
        factory(endpoint)
    }

    /// Check that every adapter of a route is known and constructible.
    pub fn check_route(&self, route: &RouteDefinition) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if let Err(e) = self.create_source(&route.name, &route.source) {
            errors.push(e);
        }
        let notify = route.handlers.notify.as_ref().map(|n| &n.to);
        for endpoint in route.sinks.iter().chain(notify) {
            if let Err(e) = self.create_sink(&route.name, endpoint) {
                errors.push(e);
            }
        }
        errors
    }

    /// Registered kinds as `(sources, sinks)`, sorted.
    pub fn list(&self) -> (Vec<&str>, Vec<&str>) {
        let mut sources: Vec<&str> = self.sources.keys().map(|s| s.as_str()).collect();
        let mut sinks: Vec<&str> = self.sinks.keys().map(|s| s.as_str()).collect();
        sources.sort_unstable();
        sinks.sort_unstable();
        (sources, sinks)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (sources, sinks) = self.list();
        f.debug_struct("AdapterRegistry")
            .field("sources", &sources)
            .field("sinks", &sinks)
            .finish()
    }
}

fn unknown(route: &str, role: &str, endpoint: &Endpoint) -> ConfigError {
    ConfigError::UnknownAdapter {
        route: route.to_string(),
        role: role.to_string(),
        scheme: endpoint.scheme.clone(),
    }
}

fn poll_interval(endpoint: &Endpoint) -> Result<Duration, ConfigError> {
    match endpoint.option_duration("interval")? {
        Some(d) if d.is_zero() => Err(ConfigError::InvalidEndpoint {
            uri: endpoint.uri.clone(),
            message: "interval must be greater than zero".to_string(),
        }),
        Some(d) => Ok(d),
        None => Ok(DEFAULT_POLL_INTERVAL),
    }
}

fn memory_entry(memory: &Mutex<HashMap<String, MemorySink>>, name: &str) -> MemorySink {
    memory
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(name.to_string())
        .or_insert_with(|| MemorySink::new(format!("memory:{}", name)))
        .clone()
}
