//! Template engine module.
//!
//! Provides Jinja2-compatible template rendering and condition evaluation
//! using minijinja, with strict handling of undefined variables.

mod engine;

pub use engine::TemplateEngine;
