//! Out-of-process tool implementations.
//!
//! - `external` - Run a shell command against a serialized message context

mod external;

pub use self::external::{default_shell, ExternalCommand, ExternalTool, INPUT_FILE_VAR};
