//! Configuration document model and loader.
//!
//! - `types` - serde model of the YAML document and the resolved route definitions
//! - `parser` - loading, env resolution and load-time validation

pub mod parser;
pub mod types;

pub use parser::{load_file, parse_document, parse_endpoint, read_config, validate_document, LoadedConfig};
pub use types::{
    AggregateStrategy, Backoff, ConfigDocument, Endpoint, EndpointSpec, EnvVarSpec,
    ErrorHandlerSpec, ErrorHandlers, FailureLogPolicy, NotifyPolicy, ProcessorSpec, RetryOn,
    RetryPolicy, RouteDefinition, RouteSettings, RouteSpec,
};
