//! Claude backend for ensemble characters.
//!
//! ```rust,ignore
//! let backend = Arc::new(ClaudeBackend::from_env()?);
//! session.register_builtin_types(backend)?;
//! ```

mod backend;
pub mod client;

pub use backend::{ClaudeBackend, ClaudeConfig};
pub use client::{Claude, Error};
