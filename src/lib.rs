//! Two-stage document to JSON extraction.
//!
//! A document is read by a vision model into free-form JSON first, then,
//! when a target schema applies, mapped onto that schema by a second call.
//! Pages can also be transcribed to Markdown instead.

pub mod config;
pub mod convert;
pub mod document;
pub mod error;
pub mod extract;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod prompts;
pub mod render;
pub mod schema;
pub mod server;
pub mod transcribe;
