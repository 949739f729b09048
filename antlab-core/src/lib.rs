pub mod cleanup;
pub mod config;
pub mod detection;
pub mod interaction;
pub mod labels;
pub mod pipeline;
pub mod rendering;
pub mod runtime;
pub mod trajectory;
pub mod video;

// Re-export the top-level error type so callers only need `antlab_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
