mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, Detail, GenerateArgs};
use sc_av::ToolRegistry;
use sc_core::config::Config;
use sc_core::events::{EventBus, EventPayload};
use sc_core::{AvatarRequest, DetailLevel, RunOptions, RunOutcome, RunRequest, DEFAULT_THEME};
use sc_pipeline::{build_registry, BindingTable, ProviderRouter};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise derive the filter from --verbose
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "slidecast=trace,sc_pipeline=trace,sc_av=trace,sc_core=debug".to_string()
        } else {
            "slidecast=debug,sc_pipeline=debug,sc_av=debug,sc_core=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Generate(args) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(generate(args, cli.config.as_deref()))
        }
        Commands::Preview {
            document,
            provider,
            max_segments,
            theme,
            output,
        } => {
            let args = GenerateArgs {
                document,
                provider,
                max_segments: Some(max_segments),
                theme,
                avatar: None,
                no_avatar: true,
                voice: None,
                detail: Detail::Standard,
                output,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(generate(args, cli.config.as_deref()))
        }
        Commands::Providers { provider } => show_providers(provider.as_deref(), cli.config.as_deref()),
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("slidecast {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn generate(args: GenerateArgs, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let document = slidecast::read_document(&args.document)?;

    let tools = ToolRegistry::discover(&config.tools);
    let driver = slidecast::build_driver(&config, &tools)
        .context("cannot set up the pipeline; run `slidecast check-tools`")?;

    let avatar = if args.no_avatar {
        None
    } else {
        args.avatar.map(|face_image| AvatarRequest { face_image })
    };
    let request = RunRequest {
        source: args.document.display().to_string(),
        document,
        provider: args.provider,
        options: RunOptions {
            max_segments: args.max_segments,
            theme: args.theme.unwrap_or_else(|| DEFAULT_THEME.to_string()),
            avatar,
            voice: args.voice,
            detail: match args.detail {
                Detail::Standard => DetailLevel::Standard,
                Detail::Intelligent => DetailLevel::Intelligent,
            },
            output_name: args.output,
        },
    };

    let cancellation = CancellationToken::new();
    let ctrl_c = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, cleaning up...");
            ctrl_c.cancel();
        }
    });

    let events = EventBus::default();
    let progress = tokio::spawn(report_progress(events.subscribe()));

    let result = driver.execute(request, cancellation, &events).await;
    progress.abort();
    let summary = result?;

    let metadata = slidecast::write_summary(&summary)?;
    println!();
    match &summary.outcome {
        RunOutcome::PartiallySucceeded { dropped } => {
            println!("Finished with {dropped} segment(s) dropped.");
        }
        _ => println!("Finished."),
    }
    println!("Output: {}", summary.output.display());
    println!("Metadata: {}", metadata.display());
    println!(
        "Duration: {:.1}s across {} segment(s)",
        summary.total_duration.as_secs_f64(),
        summary.segments
    );
    for (stage, used) in &summary.providers_used {
        println!("  {stage}: served by {}", used.join(", "));
    }

    Ok(())
}

/// Print one line per stage transition.
async fn report_progress(mut rx: tokio::sync::broadcast::Receiver<sc_core::events::Event>) {
    while let Ok(event) = rx.recv().await {
        match event.payload {
            EventPayload::StageStarted { stage, .. } => println!("[{stage}] started"),
            EventPayload::StageCompleted {
                stage,
                succeeded,
                failed,
                ..
            } => {
                if failed > 0 {
                    println!("[{stage}] done ({succeeded} ok, {failed} failed)");
                } else {
                    println!("[{stage}] done");
                }
            }
            EventPayload::StageSkipped { stage, reason, .. } => {
                println!("[{stage}] skipped: {reason}")
            }
            EventPayload::StageFailed { stage, error, .. } => {
                println!("[{stage}] failed: {error}")
            }
            _ => {}
        }
    }
}

fn show_providers(provider: Option<&str>, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let tools = ToolRegistry::discover(&config.tools);
    let registry = build_registry(&config, &tools)?;
    let bindings = BindingTable::from_config(&config);

    let Some(provider) = provider else {
        let names: Vec<&str> = bindings.provider_names().collect();
        if names.is_empty() {
            println!("No providers configured; every stage uses the defaults.");
        } else {
            println!("Configured providers:");
            for name in names {
                println!("  {name}");
            }
        }
        println!("\nCapabilities: {}", registry.names().collect::<Vec<_>>().join(", "));
        return Ok(());
    };

    if !bindings.knows_provider(provider) {
        println!("Provider '{provider}' is not configured; defaults apply.");
    }
    let router = ProviderRouter::new(Arc::new(registry), Arc::new(bindings));
    let routes = router.resolve(provider);
    println!("Provider: {}", routes.provider());
    for line in routes.describe() {
        println!("  {line}");
    }
    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    println!("Checking external tools...\n");

    let tools = ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in tools.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Install ffmpeg to compose videos.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let contents = std::fs::read_to_string(p)
                .with_context(|| format!("cannot read {}", p.display()))?;
            Config::from_json(&contents)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("✓ Configuration is valid");
    } else {
        println!("✓ Configuration parsed with {} warning(s):", warnings.len());
        for w in &warnings {
            println!("  - {w}");
        }
    }
    println!(
        "  Output: {}x{} @ {} fps",
        config.composition.width, config.composition.height, config.composition.fps
    );
    println!("  Concurrency: {}", config.pipeline.max_concurrency);
    println!("  Capabilities: {}", config.capabilities.len());
    println!("  Providers: {}", config.providers.len());

    Ok(())
}
