//! routeflow engine
//!
//! Runs declarative message routes: each route pulls triggers from a source
//! adapter, passes them through an ordered processor chain and fans the
//! result out to one or more sink adapters, with retry and notify handling
//! under a global concurrency budget.
//!
//! ## Modules
//!
//! - `config` - Global engine settings and duration parsing
//! - `definition` - Configuration document model, loader and validation
//! - `adapters` - Source/sink traits, built-in adapters and the adapter registry
//! - `processor` - Built-in processors and the processor chain
//! - `route` - Per-route execution loop
//! - `engine` - Scheduler with start/stop/reload and status introspection

pub mod adapters;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod logging;
pub mod outcome;
pub mod processor;
pub mod route;
pub mod status;

pub use adapters::{AdapterRegistry, MemorySink, Message, Sink, Source};
pub use config::EngineConfig;
pub use definition::{load_file, parse_document, validate_document, LoadedConfig, RouteDefinition};
pub use engine::{Engine, ReloadSummary};
pub use error::{
    ConfigError, DeliveryError, EngineError, ProcessorError, RouteError, SourceError, StepFailure,
};
pub use outcome::ExecutionResult;
pub use status::{RouteState, RouteStatus};
