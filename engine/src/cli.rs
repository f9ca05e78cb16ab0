//! CLI interface for Keel
//!
//! This module provides the command-line interface using clap's derive API.
//! Each analysis component can be run on its own against JSON input files,
//! which makes it easy to inspect a verdict, a compression pass or a memory
//! selection outside of an agent loop.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Keel reasoning control layer
///
/// Scores model responses, compresses conversations and selects memories for
/// a coding assistant's task loop.
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Score a model response and print the verdict
    Evaluate {
        /// File holding the response text
        #[arg(long, value_name = "FILE")]
        response: PathBuf,

        /// Expected response type (tool_call, text, code, mixed)
        #[arg(long, default_value = "text")]
        expected_type: String,

        /// Query the response should address
        #[arg(long, default_value = "")]
        query: String,

        /// Substring the response must contain (repeatable)
        #[arg(long = "require", value_name = "S")]
        required_outputs: Vec<String>,

        /// Tool the response must call (repeatable)
        #[arg(long = "expect-tool", value_name = "NAME")]
        expected_tools: Vec<String>,

        /// Upper bound on response tokens
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Require at least one code block
        #[arg(long)]
        requires_code: bool,

        /// Language tag required on code blocks
        #[arg(long)]
        code_language: Option<String>,
    },

    /// Compress a conversation against a token limit
    Compress {
        /// JSON array of messages
        #[arg(long, value_name = "FILE")]
        messages: PathBuf,

        /// Tokens currently in use
        #[arg(long)]
        current_tokens: usize,

        /// Token limit of the model input
        #[arg(long)]
        token_limit: usize,

        /// Message id that must not be compressed (repeatable)
        #[arg(long = "preserve", value_name = "ID")]
        preserve: Vec<String>,
    },

    /// Select memories relevant to a query
    Select {
        /// JSON array of memories
        #[arg(long, value_name = "FILE")]
        memories: PathBuf,

        /// Query text
        #[arg(long)]
        query: String,

        /// Token budget (defaults to the orchestrator's memory share)
        #[arg(long)]
        budget: Option<usize>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Validate the configuration file
    Validate,

    /// Print the configuration file path
    Path,
}
