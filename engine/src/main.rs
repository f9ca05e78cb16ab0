// Keel reasoning control layer
// Main entry point for the keel binary

use clap::Parser;
use keel_engine::cli::{Cli, Command, ConfigAction};
use keel_engine::config::Config;
use keel_engine::handlers::{
    handle_compress, handle_config_path, handle_config_show, handle_config_validate,
    handle_evaluate, handle_select, EvaluateArgs, OutputFormat,
};
use keel_engine::quality::TaskConstraints;
use keel_engine::telemetry::{init_telemetry_with_level, DEFAULT_LOG_LEVEL};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Config commands must work on a broken file, so they skip loading it
    if let Command::Config { action } = &cli.command {
        init_telemetry_with_level(cli.log.as_deref().unwrap_or(DEFAULT_LOG_LEVEL));
        match action {
            ConfigAction::Validate => return handle_config_validate(cli.config.as_deref(), format),
            ConfigAction::Path => return handle_config_path(cli.config.as_deref(), format),
            ConfigAction::Show => {}
        }
    }

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the configured level; RUST_LOG wins over both
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");
    tracing::debug!("Keel v{} ({} - {})", version, commit, timestamp);

    match cli.command {
        Command::Evaluate {
            response,
            expected_type,
            query,
            required_outputs,
            expected_tools,
            max_tokens,
            requires_code,
            code_language,
        } => {
            tracing::info!("Evaluating response from {}", response.display());
            let constraints = TaskConstraints {
                required_outputs,
                expected_tools,
                max_tokens,
                requires_code,
                code_language,
            };
            handle_evaluate(
                EvaluateArgs {
                    response,
                    expected_type,
                    query,
                    constraints,
                },
                &config,
                format,
            )
        }

        Command::Compress {
            messages,
            current_tokens,
            token_limit,
            preserve,
        } => {
            tracing::info!(
                "Compressing {} ({} of {} tokens)",
                messages.display(),
                current_tokens,
                token_limit
            );
            handle_compress(messages, current_tokens, token_limit, preserve, &config, format)
        }

        Command::Select {
            memories,
            query,
            budget,
        } => {
            tracing::info!("Selecting memories from {}", memories.display());
            handle_select(memories, query, budget, &config, format)
        }

        Command::Config { .. } => handle_config_show(&config, format),
    }
}
