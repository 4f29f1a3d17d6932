//! grex - Incremental group chat activity extractor
//!
//! Main entry point for the grex command-line tool.

use anyhow::{Context, Result, anyhow};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::Colorize;
use std::io;
use std::sync::Arc;

use grex::logging::{LogConfig, init_logging};
use grex::shutdown::{self, listen_for_os_signals};
use grex::status::{StatusReport, summarize};
use grex::*;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.paths.data_dir = Some(dir.clone());
    }
    if cli.no_color {
        config.output.colors = false;
    }
    if !config.output.colors {
        colored::control::set_override(false);
    }

    init_logging(&LogConfig::from_flags(
        cli.quiet,
        cli.verbose,
        config.output.colors,
    ));

    match &cli.command {
        Commands::Run(args) => {
            let code = cmd_run(&cli, config, args)?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Status(args) => cmd_status(&cli, &config, args),
        Commands::Config(args) => cmd_config(&config, args),
        Commands::Completions(args) => cmd_completions(args.clone()),
    }
}

fn cmd_run(cli: &Cli, mut config: Config, args: &cli::RunArgs) -> Result<i32> {
    if let Some(chat) = &args.chat {
        config.upstream.chat_id = Some(chat.clone());
    }
    if let Some(url) = &args.upstream {
        config.upstream.base_url.clone_from(url);
    }
    if let Some(secs) = args.interval {
        config.extraction.monitoring_interval_secs = secs;
    }
    if let Some(path) = &args.reactions_file {
        config.paths.reactions_file.clone_from(path);
    }
    if args.no_media {
        config.extraction.download_media = false;
    }
    if args.prefer_live_reactions {
        config.extraction.prefer_live_reactions = true;
    }
    config.validate()?;

    let chat_id = config.upstream.chat_id.clone().ok_or_else(|| {
        anyhow!(
            "{}",
            format_error(
                "No chat selected",
                "grex needs to know which group chat to extract.",
                &[
                    "Pass --chat <chat-id>",
                    "Set GREX_CHAT_ID",
                    "Add chat_id under [upstream] in the config file",
                ],
            )
        )
    })?;

    let upstream = HttpUpstream::new(
        &config.upstream.base_url,
        config.upstream.token.clone(),
        config.request_timeout(),
    )?;
    let store = JsonCheckpointStore::new(config.checkpoint_files());

    if !cli.quiet {
        println!("{}", "Extracting group chat activity...".bold().cyan());
        println!("  Chat: {chat_id}");
        println!("  Upstream: {}", config.upstream.base_url);
        println!("  Data: {}", config.data_dir().display());
        println!("  Reactions: {}", config.reactions_path().display());
        println!();
    }

    let settings = config.extractor_settings(&chat_id);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let outcome = runtime.block_on(async move {
        let (trigger, signal) = shutdown::channel();
        listen_for_os_signals(trigger);
        Extractor::new(Arc::new(upstream), Box::new(store), settings, signal)
            .run()
            .await
    });

    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            let suggestions: Vec<&str> = e.suggestion().into_iter().collect();
            eprintln!(
                "{}",
                format_error("Could not start extraction", &e.to_string(), &suggestions)
            );
            return Ok(1);
        }
    };

    if !cli.quiet {
        print_run_summary(&report);
    }
    Ok(report.exit_code())
}

fn print_run_summary(report: &RunReport) {
    let run = &report.run;
    let elapsed = run.end_time.unwrap_or_else(chrono::Utc::now) - run.start_time;

    println!();
    let headline = match report.reason {
        ExitReason::Cancelled => "Extraction stopped".bold().green(),
        ExitReason::AuthRevoked | ExitReason::Failed(_) => {
            format!("Extraction aborted: {}", report.reason).bold().red()
        }
    };
    println!("{headline}");
    println!(
        "  Messages extracted: {}",
        format_number_u64(run.messages_extracted).cyan()
    );
    println!(
        "  Total stored:       {}",
        format_number_usize(report.total_messages).cyan()
    );
    println!("  Batches fetched:    {}", run.batches_fetched);
    println!("  Elapsed:            {}", format_elapsed(elapsed));
    let errors = run.error_count();
    if errors == 0 {
        println!("  Errors:             {}", "0".green());
    } else {
        println!("  Errors:             {}", errors.to_string().yellow());
    }
    if !report.flushed {
        println!(
            "  {} Final checkpoint could not be written",
            "✗".red().bold()
        );
    }
}

fn cmd_status(cli: &Cli, config: &Config, args: &cli::StatusArgs) -> Result<()> {
    let store = JsonCheckpointStore::new(config.checkpoint_files());
    let loaded = store.load().with_context(|| {
        format!(
            "Failed to read checkpoint in {}",
            config.data_dir().display()
        )
    })?;
    let report = summarize(&loaded, args.errors);

    let format = match &cli.format {
        Some(format) => format.clone(),
        None => config.output_format()?,
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&report)?),
        OutputFormat::JsonPretty => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_status(config, &report),
    }
    Ok(())
}

fn print_status(config: &Config, report: &StatusReport) {
    println!("{}", "Extraction Status".bold().cyan());
    println!("{}", "─".repeat(40));
    println!(
        "  {:<22} {}",
        "Data directory:",
        config.data_dir().display()
    );

    if report.total_messages == 0 && report.last_run.is_none() {
        println!();
        println!(
            "  {} Run {} to start extracting.",
            "No messages extracted yet.".yellow(),
            "grex run --chat <chat-id>".bold()
        );
        return;
    }

    println!(
        "  {:<22} {:>10}",
        "Messages:",
        format_number_usize(report.total_messages)
    );
    println!("  {:<22} {:>10}", "  text", report.text_messages);
    println!("  {:<22} {:>10}", "  media", report.media_messages);
    println!("  {:<22} {:>10}", "  system", report.system_messages);
    println!("  {:<22} {:>10}", "  other", report.other_messages);
    println!("  {:<22} {:>10}", "Failed media:", report.failed_media);
    println!("  {:<22} {:>10}", "Links:", report.links);
    println!(
        "  {:<22} {:>10}",
        "With reactions:", report.messages_with_reactions
    );
    println!(
        "  {:<22} {:>10}",
        "  from monitor:", report.reactions_from_monitor
    );
    println!(
        "  {:<22} {:>10}",
        "Participants:", report.current_participants
    );
    println!(
        "  {:<22} {:>10}",
        "Former members:", report.former_participants
    );
    println!("{}", "─".repeat(40));

    if let (Some(oldest), Some(newest)) = (&report.oldest_message, &report.newest_message) {
        println!("  Oldest message: {}", oldest.green());
        println!("  Newest message: {}", newest.green());
    }

    if let Some(run) = &report.last_run {
        println!();
        println!("{}", "Last run".bold());
        println!("  Started:   {}", format_relative_date(run.start_time));
        match run.end_time {
            Some(end) => println!("  Finished:  {}", format_relative_date(end)),
            None => println!("  Finished:  {}", "still running or interrupted".yellow()),
        }
        println!("  Extracted: {}", format_number_u64(run.messages_extracted));
        println!("  Batches:   {}", run.batches_fetched);
        println!("  Errors:    {}", run.error_count);
        println!("  Earlier runs recorded: {}", report.previous_runs);
    }

    if !report.recent_errors.is_empty() {
        println!();
        println!("{}", "Recent errors".bold().yellow());
        for error in &report.recent_errors {
            println!(
                "  {} {}",
                error
                    .timestamp
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
                    .dimmed(),
                error.message
            );
        }
    }
}

fn cmd_config(config: &Config, args: &cli::ConfigArgs) -> Result<()> {
    if args.path {
        match Config::user_config_path() {
            Some(path) => println!("{}", path.display()),
            None => println!("{}", "Could not determine config directory".yellow()),
        }
    }

    if args.init {
        let path = Config::default()
            .save()
            .context("Failed to write config file")?;
        println!(
            "{} Wrote default configuration to {}",
            "✓".green(),
            path.display()
        );
    }

    if args.show || !(args.path || args.init) {
        let content = toml::to_string_pretty(config).context("Failed to render configuration")?;
        println!("{content}");
    }
    Ok(())
}

fn cmd_completions(args: cli::CompletionsArgs) -> Result<()> {
    let mut cmd = Cli::command();
    generate(args.shell, &mut cmd, "grex", &mut io::stdout());
    Ok(())
}
