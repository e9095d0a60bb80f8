//! # Summary Press CLI (`press`)
//!
//! The `press` binary runs the upload server and gives contributors and
//! maintainers the same workflow from a terminal.
//!
//! ## Usage
//!
//! ```bash
//! press --config ./config/press.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `press serve` | Start the upload HTTP server |
//! | `press validate <note>` | Run the offline checks on a note (and cover) |
//! | `press submit <note> --cover <img>` | Submit through a running server |
//! | `press build check` | Check the deploy configuration |
//! | `press build trigger` | Trigger a rebuild and follow the deploy |
//! | `press completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! # Start the server
//! GITHUB_TOKEN=... API_KEYS=k1 press serve --config ./config/press.toml
//!
//! # Validate a note, including its embedded images
//! press validate notes/dune.md --cover dune.png --check-images
//!
//! # Submit a draft and print progress as JSON lines
//! press submit notes/dune.md --cover dune.png --contributor "Ada" --draft --json
//! ```

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use summary_press::client::{SubmitRequest, UploadClient};
use summary_press::config::{self, Config, Secrets};
use summary_press::deploy::{self, CheckStatus, DeployTracker, DiagnosticReport};
use summary_press::images::{extract_image_urls, ImageChecker};
use summary_press::pipeline::{self, Targets};
use summary_press::progress::{EventKind, ProgressEvent, ProgressMode, Step};
use summary_press::server;
use summary_press::validate::{self, Limits};

/// Summary Press CLI: validate, submit and publish book summaries.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/press.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "press",
    about = "Summary Press: validate, submit and publish book summaries",
    version,
    long_about = "Summary Press validates book-summary notes and their covers, publishes them \
    to GitHub, SFTP or a local checkout, triggers the site build and follows the deploy."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/press.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the upload HTTP server.
    ///
    /// Binds to `[server].bind`. Secrets are read from the environment.
    Serve,

    /// Validate a note offline.
    ///
    /// Runs the name, size, frontmatter and schema checks, and the cover
    /// checks when `--cover` is given. Nothing is published.
    Validate {
        /// Markdown note (`.md` or `.mdx`).
        note: PathBuf,

        /// Cover image to validate alongside the note.
        #[arg(long)]
        cover: Option<PathBuf>,

        /// Contributor name, if not already in the frontmatter.
        #[arg(long)]
        contributor: Option<String>,

        /// Also check embedded image URLs (domain lists and reachability).
        #[arg(long)]
        check_images: bool,
    },

    /// Submit a note and its cover to a running server.
    Submit {
        /// Markdown note (`.md` or `.mdx`).
        note: PathBuf,

        /// Cover image (JPG, PNG, GIF or WebP).
        #[arg(long)]
        cover: PathBuf,

        /// Contributor name.
        #[arg(long)]
        contributor: Option<String>,

        /// Submit as a draft.
        #[arg(long)]
        draft: bool,

        /// Server base URL. Defaults to `http://<server.bind>`.
        #[arg(long)]
        server: Option<String>,

        /// Print progress as JSON lines on stderr. Without it, progress is
        /// shown only when stderr is a terminal.
        #[arg(long)]
        json: bool,

        /// Skip the silent pre-validation upload.
        #[arg(long)]
        no_prevalidate: bool,
    },

    /// Site build commands.
    Build {
        #[command(subcommand)]
        action: BuildAction,
    },

    /// Print shell completions to stdout.
    Completions {
        /// Target shell.
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum BuildAction {
    /// Check the build hook and deploy API configuration.
    Check {
        /// Ask a running server instead (uses `PRESS_API_KEY`).
        #[arg(long)]
        server: Option<String>,
    },
    /// Trigger a build and follow the deploy.
    Trigger {
        /// Title shown in the deploy log.
        #[arg(long)]
        title: Option<String>,

        /// Ask a running server instead (uses `PRESS_API_KEY`).
        #[arg(long)]
        server: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("PRESS_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "press", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let secrets = Secrets::from_env();

    match cli.command {
        Commands::Serve => {
            let cfg = config::load_config(&cli.config)?;
            server::run_server(cfg, secrets).await?;
        }
        Commands::Validate {
            note,
            cover,
            contributor,
            check_images,
        } => {
            let cfg = load_or_minimal(&cli.config);
            run_validate(&cfg, &secrets, &note, cover.as_deref(), contributor, check_images).await?;
        }
        Commands::Submit {
            note,
            cover,
            contributor,
            draft,
            server,
            json,
            no_prevalidate,
        } => {
            let cfg = load_or_minimal(&cli.config);
            let base = server.unwrap_or_else(|| format!("http://{}", cfg.server.bind));
            let mode = if json {
                ProgressMode::Json
            } else {
                ProgressMode::default_for_tty()
            };
            let request = SubmitRequest {
                note_path: note,
                cover_path: cover,
                contributor,
                draft,
                note_id: None,
            };
            run_submit(&cfg, &base, request, mode, !no_prevalidate).await?;
        }
        Commands::Build { action } => match action {
            BuildAction::Check { server } => {
                let report = match server {
                    Some(base) => {
                        let client = UploadClient::new(base)?
                            .with_api_key(std::env::var("PRESS_API_KEY").ok());
                        client.build_check().await?
                    }
                    None => {
                        let cfg = load_or_minimal(&cli.config);
                        deploy::diagnose(&cfg, &secrets).await
                    }
                };
                print_diagnostics(&report)?;
            }
            BuildAction::Trigger { title, server } => {
                let title = title.unwrap_or_else(|| "Manual rebuild".to_string());
                let reporter = ProgressMode::default_for_tty().reporter();
                let url = match server {
                    Some(base) => {
                        let client = UploadClient::new(base)?
                            .with_api_key(std::env::var("PRESS_API_KEY").ok());
                        let outcome = client
                            .trigger_build(Some(&title), |event| reporter.report(event.clone()))
                            .await?;
                        if !outcome.success {
                            bail!("build failed");
                        }
                        outcome.url
                    }
                    None => {
                        let cfg = config::load_config(&cli.config)?;
                        let targets = Targets {
                            publishers: Vec::new(),
                            hook: deploy::BuildHook::from_secrets(&cfg, &secrets)?,
                            tracker: DeployTracker::from_secrets(&cfg, &secrets)?,
                        };
                        if targets.hook.is_none() {
                            bail!("NETLIFY_BUILD_HOOK is not set");
                        }
                        let deploy = pipeline::run_build(&targets, &title, reporter.as_ref()).await?;
                        deploy.as_ref().and_then(|d| d.public_url()).map(str::to_string)
                    }
                };
                match url {
                    Some(url) => println!("Deployed: {}", url),
                    None => println!("Build triggered."),
                }
            }
        },
        Commands::Completions { .. } => {
            // Handled above (before tracing and config)
            unreachable!()
        }
    }

    Ok(())
}

/// Load the config file, or fall back to defaults when there is none. A file
/// that exists but does not load is reported before falling back.
fn load_or_minimal(path: &Path) -> Config {
    match config::load_config(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            if path.exists() {
                eprintln!("warning: {:#}; using default settings", e);
            }
            Config::minimal()
        }
    }
}

async fn run_validate(
    cfg: &Config,
    secrets: &Secrets,
    note: &Path,
    cover: Option<&Path>,
    contributor: Option<String>,
    check_images: bool,
) -> anyhow::Result<()> {
    let limits = Limits::from(&cfg.upload);
    let name = note
        .file_name()
        .and_then(|n| n.to_str())
        .context("note path has no file name")?;
    let bytes = std::fs::read(note)
        .with_context(|| format!("Failed to read note: {}", note.display()))?;

    let mut problems: Vec<String> = Vec::new();

    let prepared = match validate::prepare_note(
        name,
        &bytes,
        contributor.as_deref(),
        limits,
        chrono::Utc::now(),
    ) {
        Ok(p) => Some(p),
        Err(e) => {
            if e.field_errors().is_empty() {
                problems.push(e.to_string());
            }
            problems.extend(e.field_errors().iter().map(|f| f.to_string()));
            None
        }
    };

    if let Some(cover) = cover {
        let cover_name = cover
            .file_name()
            .and_then(|n| n.to_str())
            .context("cover path has no file name")?;
        let cover_bytes = std::fs::read(cover)
            .with_context(|| format!("Failed to read cover: {}", cover.display()))?;
        if let Err(errors) = validate::validate_cover(cover_name, &cover_bytes, limits.max_cover_bytes) {
            problems.extend(errors.iter().map(|f| f.to_string()));
        }
    }

    if let Some(prepared) = &prepared {
        problems.extend(
            validate::check_alt_text(&prepared.body)
                .into_iter()
                .map(|m| format!("images: {}", m)),
        );
        if check_images {
            let checker = ImageChecker::new(cfg, secrets)?;
            let urls = extract_image_urls(&prepared.body);
            problems.extend(
                checker
                    .check(&urls)
                    .await
                    .into_iter()
                    .map(|m| format!("images: {}", m)),
            );
        }
    }

    if problems.is_empty() {
        let title = prepared.map(|p| p.meta.title).unwrap_or_default();
        println!("{} is valid ({})", name, title);
        Ok(())
    } else {
        eprintln!("{} has {} problem(s):", name, problems.len());
        for p in &problems {
            eprintln!("  - {}", p);
        }
        bail!("validation failed")
    }
}

async fn run_submit(
    cfg: &Config,
    base: &str,
    mut request: SubmitRequest,
    mode: ProgressMode,
    silent_first: bool,
) -> anyhow::Result<()> {
    let client = UploadClient::new(base)?.with_limits(Limits::from(&cfg.upload));
    let reporter = mode.reporter();

    if silent_first {
        reporter.report(ProgressEvent::info(Step::Validation, "Pre-validating the note..."));
        let silent = client.silent_upload(&request.note_path).await?;
        if !silent.success {
            for line in &silent.errors {
                reporter.report(ProgressEvent::error(Step::Validation, line.clone()));
            }
            bail!("the note did not pass pre-validation");
        }
        request.note_id = silent.id;
    }

    let outcome = client
        .submit(&request, |event| reporter.report(event.clone()))
        .await?;

    if !outcome.success {
        let reasons: Vec<&str> = outcome
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Error)
            .map(|e| e.message.as_str())
            .collect();
        bail!("submission failed: {}", reasons.join("; "));
    }
    match outcome.url {
        Some(url) => println!("{}", url),
        None => println!("Submitted."),
    }
    Ok(())
}

fn print_diagnostics(report: &DiagnosticReport) -> anyhow::Result<()> {
    for check in &report.checks {
        let tag = match check.status {
            CheckStatus::Success => "ok",
            CheckStatus::Warning => "warn",
            CheckStatus::Error => "FAIL",
        };
        println!("  [{:>4}] {:<10} {}", tag, check.name, check.message);
    }
    if report.ok {
        println!("Deploy configuration OK.");
        Ok(())
    } else {
        bail!("deploy configuration has errors")
    }
}
