//! Reciprocity CLI - follow-back audit server and interactive front end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Password, Select};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use reciprocity::api::HttpClientFactory;
use reciprocity::events::{Observed, RunEvent};
use reciprocity::server::{run_server, AppState};
use reciprocity::ui::{self, TerminalObserver};
use reciprocity::{
    Config, Discovery, EventReceiver, FsStore, Launch, ResultRef, RunDispatcher, StartMode,
};

/// Reciprocity CLI - find accounts that don't follow you back.
#[derive(Parser)]
#[command(name = "reciprocity")]
#[command(about = "Follow-back audit for a rate-limited relationship API")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory for sessions and result sets
    #[arg(long, global = true, env = "RECIPROCITY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Base URL of the relationship API
    #[arg(long, global = true, env = "RECIPROCITY_API_BASE")]
    api_base: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP/SSE server
    Serve {
        /// Port to listen on
        #[arg(long, env = "RECIPROCITY_PORT")]
        port: Option<u16>,

        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
    },

    /// Interactive audit in the terminal
    Run {
        /// Account handle (prompted if omitted)
        handle: Option<String>,

        /// Keep avatar URLs in the exports
        #[arg(long)]
        avatars: bool,

        /// Don't offer stored result sets
        #[arg(long)]
        skip_results: bool,
    },

    /// List stored result sets
    Results,

    /// List stored sessions
    Sessions,

    /// Print a stored result set
    Show {
        /// Result folder, e.g. alice_20240102030405
        folder: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("reciprocity=debug,info")
        } else {
            EnvFilter::new("reciprocity=info,warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = Config::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(api_base) = cli.api_base {
        config.api_base = api_base;
    }

    match cli.command {
        Commands::Serve { port, host } => {
            if let Some(port) = port {
                config.port = port;
            }
            let addr = format!("{host}:{}", config.port);
            tracing::info!(
                addr,
                data_dir = %config.data_dir.display(),
                api_base = %config.api_base,
                "Starting server"
            );
            let dispatcher = build_dispatcher(config)?;
            run_server(AppState { dispatcher }, &addr).await
        }
        Commands::Run {
            handle,
            avatars,
            skip_results,
        } => {
            let profile_url_base = config.profile_url_base.clone();
            let dispatcher = build_dispatcher(config)?;
            run_interactive(&dispatcher, handle, avatars, skip_results, &profile_url_base).await
        }
        Commands::Results => run_results(&build_dispatcher(config)?),
        Commands::Sessions => run_sessions(&build_dispatcher(config)?),
        Commands::Show { folder } => {
            let profile_url_base = config.profile_url_base.clone();
            let dispatcher = build_dispatcher(config)?;
            let reference = ResultRef::parse(&folder)?;
            let classification = dispatcher
                .load_result(&reference)
                .with_context(|| format!("Failed to load {folder}"))?;
            ui::print_classification(&classification, &profile_url_base);
            Ok(())
        }
    }
}

fn build_dispatcher(config: Config) -> Result<RunDispatcher> {
    let store = FsStore::new(&config.data_dir)
        .with_profile_url_base(config.profile_url_base.clone())
        .with_legacy_exports(config.legacy_exports);
    let clients = HttpClientFactory::new(&config.api_base, config.page_size, config.http_timeout)
        .context("Failed to build HTTP client")?;
    Ok(RunDispatcher::new(Arc::new(store), Arc::new(clients), config))
}

fn run_results(dispatcher: &RunDispatcher) -> Result<()> {
    let results = dispatcher.list_result_sets()?;
    if results.is_empty() {
        println!("No result sets found.");
        return Ok(());
    }
    for info in &results {
        println!("📁 {}  {}", info.folder, ui::result_label(info));
    }
    println!("\nTotal: {} result sets", results.len());
    Ok(())
}

fn run_sessions(dispatcher: &RunDispatcher) -> Result<()> {
    let sessions = dispatcher.list_sessions()?;
    if sessions.is_empty() {
        println!("No stored sessions.");
        return Ok(());
    }
    for info in &sessions {
        println!("🔑 {}", ui::session_label(info));
    }
    Ok(())
}

async fn run_interactive(
    dispatcher: &RunDispatcher,
    handle: Option<String>,
    fetch_avatars: bool,
    skip_results: bool,
    profile_url_base: &str,
) -> Result<()> {
    ui::print_banner();

    let discovery = dispatcher.discover(skip_results)?;
    let mode = tokio::task::spawn_blocking(move || choose_mode(discovery, handle))
        .await
        .context("Prompt task failed")??;

    let handle = mode.handle().to_string();
    match dispatcher.launch(mode, fetch_avatars)? {
        Launch::Loaded {
            reference,
            classification,
        } => {
            ui::print_success(&format!("Loaded {reference}"));
            ui::print_classification(&classification, profile_url_base);
            Ok(())
        }
        Launch::Running(receiver) => {
            observe(dispatcher, &handle, receiver, profile_url_base).await
        }
    }
}

fn choose_mode(discovery: Discovery, handle: Option<String>) -> Result<StartMode> {
    let theme = ColorfulTheme::default();

    let discovery = match discovery {
        Discovery::FoundResults { results, sessions } => {
            let mut items: Vec<String> = results.iter().map(ui::result_label).collect();
            items.push("Fetch fresh data".to_string());
            let picked = if results.len() == 1 {
                let load = Confirm::with_theme(&theme)
                    .with_prompt(format!("Found a previous result: {}. Load it?", items[0]))
                    .default(true)
                    .interact()?;
                if load {
                    0
                } else {
                    results.len()
                }
            } else {
                Select::with_theme(&theme)
                    .with_prompt("Previous results found")
                    .default(0)
                    .items(&items)
                    .interact()?
            };
            if let Some(info) = results.get(picked) {
                return Ok(StartMode::LoadResult(info.reference.clone()));
            }
            Discovery::FoundResults { results, sessions }.without_results()
        }
        other => other,
    };

    if let Discovery::FoundSessions {
        sessions,
        default_handle,
    } = &discovery
    {
        let wanted = handle.as_deref().unwrap_or(default_handle);
        let default = sessions.iter().position(|s| s.handle == wanted).unwrap_or(0);
        let mut items: Vec<String> = sessions.iter().map(ui::session_label).collect();
        items.push("Log in with a password".to_string());
        let picked = Select::with_theme(&theme)
            .with_prompt("Stored sessions")
            .default(default)
            .items(&items)
            .interact()?;
        if let Some(session) = sessions.get(picked) {
            return Ok(StartMode::ResumeSession {
                handle: session.handle.clone(),
            });
        }
    }

    let handle = match handle {
        Some(handle) => handle,
        None => Input::with_theme(&theme)
            .with_prompt("Username")
            .interact_text()?,
    };
    let password = Password::with_theme(&theme)
        .with_prompt("Password")
        .interact()?;
    if handle.trim().is_empty() || password.is_empty() {
        bail!("Username and password are required");
    }
    Ok(StartMode::FreshLogin {
        handle: handle.trim().to_string(),
        password,
    })
}

async fn observe(
    dispatcher: &RunDispatcher,
    handle: &str,
    mut receiver: EventReceiver,
    profile_url_base: &str,
) -> Result<()> {
    let mut observer = TerminalObserver::new();
    while let Some(observed) = receiver.next().await {
        match observed {
            Observed::Event(RunEvent::RequestSecondFactor) => {
                observer.println("");
                let code = tokio::task::spawn_blocking(|| {
                    Input::<String>::with_theme(&ColorfulTheme::default())
                        .with_prompt("Two-factor code")
                        .interact_text()
                })
                .await
                .context("Prompt task failed")??;
                dispatcher.submit_second_factor(handle, &code)?;
            }
            Observed::Event(event) => observer.apply(&event),
            Observed::Terminal(event) => {
                observer.apply(&event);
                return match event {
                    RunEvent::Done { summary } => {
                        ui::print_success(&format!(
                            "Done. Results saved to {}",
                            summary.result_set.directory.display()
                        ));
                        if summary.skipped_following + summary.skipped_followers > 0 {
                            ui::print_warning(&format!(
                                "Skipped {} unreadable accounts",
                                summary.skipped_following + summary.skipped_followers
                            ));
                        }
                        ui::print_classification(&summary.classification, profile_url_base);
                        Ok(())
                    }
                    RunEvent::Failed { reason } => {
                        ui::print_error(&reason);
                        bail!("Run failed")
                    }
                    _ => Ok(()),
                };
            }
            Observed::Disconnected => {
                observer.finish();
                bail!("Run ended without a result");
            }
        }
    }
    Ok(())
}
