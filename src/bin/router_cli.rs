//! router-cli：路由配置校验、候选链预览与连通性检查的命令行工具
//!
//! Usage:
//!   router-cli validate <config>                   Validate a router config
//!   router-cli rank <config> [conversation-id]     Show the fallback chain ranking
//!   router-cli ping <config> [provider]            Test provider credentials
//!   router-cli chat <config> <text>                Route one message, streaming the reply

use anyhow::{bail, Context};
use provider_router::router::RelayEvent;
use provider_router::{Message, ProviderRouter, RouteOutcome, RouterConfig};
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let result = match args[1].as_str() {
        "validate" => cmd_validate(&args[2..]),
        "rank" => cmd_rank(&args[2..]).await,
        "ping" => cmd_ping(&args[2..]).await,
        "chat" => cmd_chat(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("router-cli {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"router-cli: provider router 命令行工具

USAGE:
    router-cli <COMMAND> [OPTIONS]

COMMANDS:
    validate <config>                  Validate a router config file
    rank <config> [conversation-id]    Rank providers and show the fallback chain
    ping <config> [provider]           Test provider credentials (all when omitted)
    chat <config> <text>               Route one user message and stream the reply
    version                            Show version information
    help                               Show this help message

ENVIRONMENT:
    <PROVIDER>_API_KEY                 Credential fallback when the keyring has none
    ROUTER_BREAKER_FAILURE_THRESHOLD   Consecutive failures before a circuit opens
    ROUTER_BREAKER_COOLDOWN_SECS       Seconds a circuit stays open
    ROUTER_RECENCY_PENALTY             Score penalty for the last used provider
    ROUTER_ATTEMPT_TIMEOUT_MS          Idle limit between chunks (0 disables)
    RUST_LOG                           Log filter (default: warn)"#
    );
}

fn config_arg(args: &[String]) -> anyhow::Result<RouterConfig> {
    let Some(path) = args.first() else {
        bail!("missing <config> argument");
    };
    RouterConfig::load(path).with_context(|| format!("loading {path}"))
}

fn build_router(config: &RouterConfig) -> anyhow::Result<ProviderRouter> {
    Ok(ProviderRouter::builder().from_config(config)?.build()?)
}

fn cmd_validate(args: &[String]) -> anyhow::Result<()> {
    let config = config_arg(args)?;
    let enabled = config.enabled_providers().count();
    println!(
        "OK: {} provider(s), {} enabled",
        config.providers.len(),
        enabled
    );
    for p in &config.providers {
        let mark = if p.enabled { "✓" } else { "-" };
        println!(
            "  {mark} {:<16} {:<10} priority={:<4} {}",
            p.id,
            format!("{:?}", p.kind).to_lowercase(),
            p.priority,
            p.base_url
        );
    }
    Ok(())
}

async fn cmd_rank(args: &[String]) -> anyhow::Result<()> {
    let config = config_arg(args)?;
    let router = build_router(&config)?;
    let conversation_id = args.get(1).map(String::as_str).unwrap_or("");

    println!(
        "{:<16} {:>8} {:>9} {:>8}  {}",
        "PROVIDER", "SCORE", "EFFECTIVE", "PRIORITY", "STATUS"
    );
    for c in router.rank(conversation_id).await {
        let status = match c.excluded {
            Some(reason) => format!("excluded ({})", serde_json::to_string(&reason)?.trim_matches('"')),
            None if c.recently_used => "eligible (recently used)".to_string(),
            None => "eligible".to_string(),
        };
        println!(
            "{:<16} {:>8.3} {:>9.3} {:>8}  {}",
            c.provider_id, c.health_score, c.effective_score, c.priority, status
        );
    }
    let chain = router.preview_chain(conversation_id).await;
    if chain.is_empty() {
        println!("\nchain: (empty, no provider available)");
    } else {
        println!("\nchain: {}", chain.join(" -> "));
    }
    Ok(())
}

async fn cmd_ping(args: &[String]) -> anyhow::Result<()> {
    let config = config_arg(args)?;
    let router = build_router(&config)?;
    let targets = match args.get(1) {
        Some(id) => vec![id.clone()],
        None => router.registry().ids(),
    };

    let mut failures = 0;
    for id in targets {
        let result = router.test_connection(&id).await;
        match result.error {
            None => println!("  ✓ {id:<16} {} ms", result.latency_ms),
            Some(err) => {
                failures += 1;
                println!("  ✗ {id:<16} [{}] {}", err.kind().name(), err.message());
            }
        }
    }
    if failures > 0 {
        bail!("{failures} provider(s) failed");
    }
    Ok(())
}

async fn cmd_chat(args: &[String]) -> anyhow::Result<()> {
    let config = config_arg(args)?;
    let text = args[1..].join(" ");
    if text.trim().is_empty() {
        bail!("missing <text> argument");
    }
    let router = build_router(&config)?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                RelayEvent::AttemptStarted {
                    attempt_number,
                    provider_id,
                } => eprintln!("[attempt {attempt_number}: {provider_id}]"),
                RelayEvent::Delta { text, .. } => {
                    let _ = write!(stdout, "{text}");
                    let _ = stdout.flush();
                }
                RelayEvent::AttemptFailed { error, .. } => {
                    eprintln!("\n[failed: {error}]");
                }
            }
        }
    });

    let outcome = router
        .route_and_save_message("cli", vec![Message::user(text)], cancel, Some(tx))
        .await;
    let _ = printer.await;
    println!();

    match outcome {
        RouteOutcome::Succeeded {
            provider_id,
            usage,
            attempts,
            ..
        } => {
            eprintln!(
                "[done: {provider_id}, {attempts} attempt(s), {} tokens]",
                usage.total_tokens
            );
            Ok(())
        }
        RouteOutcome::Cancelled { .. } => {
            eprintln!("[cancelled]");
            Ok(())
        }
        RouteOutcome::Failed { error, .. } => Err(error.into()),
    }
}
