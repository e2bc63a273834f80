//! Source-level transform passes and their per-invocation state.

pub mod build;
pub mod context;
pub mod flatten;
pub mod strings;

pub use context::BuildContext;
pub use flatten::flatten_control_flow;
pub use strings::encrypt_strings;
