//! Keel Engine Library
//!
//! The reasoning control layer of a coding assistant. It decides what the
//! model sees (memory selection, context compression), whether a response is
//! good enough (quality evaluation, retry policy) and when a task is done
//! (termination detection), and ties these together in the agent loop.
//!
//! Every analysis component is a pure function of its inputs and the
//! configuration; I/O happens only through the collaborator traits in `sdk`.

/// Agent loop core module
pub mod agent;

/// Context compression module
pub mod compression;

/// Configuration management module
pub mod config;

/// Memory store and relevance selection module
pub mod memory;

/// Response quality evaluation module
pub mod quality;

/// Retry policy module
pub mod retry;

/// Termination detection and validation checks module
pub mod termination;

/// Tokenization, hashing and time helpers
pub mod text;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
