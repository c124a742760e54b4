use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indexmap::IndexMap;

use azd_app::controller::Controller;
use azd_app::dashboard::Dashboard;
use azd_app::error::{AppError, Result};
use azd_app::logbuf::{LogEntry, LogLevel};
use azd_app::logfilter::{clamp_context, ContextReplay, LogFilter};
use azd_app::registry::Registry;
use azd_app::supervisor::{RunOptions, Supervisor};
use azd_app::{health, logfile, manifest, ports, state, supervisor};

#[derive(Parser)]
#[command(name = "azd-app", about = "azd-app — local development supervisor", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HealthOutput {
    Text,
    Json,
    Table,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RuntimeKind {
    Azd,
    Aspire,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the project's services and supervise them until interrupted
    Run {
        /// Only these services (plus their dependencies)
        #[arg(long = "service", value_delimiter = ',')]
        service: Vec<String>,
        /// Extra KEY=VALUE environment for every service
        #[arg(long)]
        env_file: Option<PathBuf>,
        /// Plan and print without starting anything
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        verbose: bool,
        /// Project flavor the manifest collaborator parses
        #[arg(long, value_enum, default_value = "azd")]
        runtime: RuntimeKind,
        /// Keep going when a service fails during startup
        #[arg(long)]
        tolerate_partial: bool,
    },
    /// Stop running services
    Stop {
        #[arg(long = "service", value_delimiter = ',')]
        service: Vec<String>,
        #[arg(long)]
        all: bool,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Start one service under the running supervisor
    Start { service: String },
    /// Restart one service
    Restart { service: String },
    /// Show or follow service logs
    Logs {
        service: Option<String>,
        #[arg(long)]
        follow: bool,
        #[arg(long, default_value_t = 100)]
        tail: usize,
        /// Only entries newer than this (e.g. 30s, 5m)
        #[arg(long)]
        since: Option<String>,
        /// Minimum level (debug, info, warn, error)
        #[arg(long)]
        level: Option<String>,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
        /// Read a written log file instead of the live buffers
        #[arg(long)]
        file: Option<PathBuf>,
        /// Exclusion patterns (repeatable)
        #[arg(long = "exclude")]
        exclude: Vec<String>,
        /// Disable the built-in noise patterns
        #[arg(long)]
        no_builtins: bool,
        /// Context lines around each match (clamped to 0..10)
        #[arg(long, default_value_t = 0)]
        context: usize,
    },
    /// Check service health
    Health {
        #[arg(long = "service", value_delimiter = ',')]
        service: Vec<String>,
        #[arg(long)]
        stream: bool,
        #[arg(long, default_value = "10s")]
        interval: String,
        #[arg(long, default_value = "5s")]
        timeout: String,
        #[arg(long, value_enum, default_value = "text")]
        output: HealthOutput,
        /// Include stopped services
        #[arg(long)]
        all: bool,
    },
    /// Show project and supervisor info
    Info {
        #[arg(long)]
        project: Option<PathBuf>,
    },
    /// Start services with debuggers attached
    Debug {
        #[arg(long = "service", value_delimiter = ',')]
        service: Vec<String>,
        #[arg(long)]
        wait_for_debugger: bool,
        /// Print the computed debug endpoints without starting anything
        #[arg(long)]
        regenerate_config: bool,
    },
}

fn json_mode(cli: &Cli) -> bool {
    match &cli.command {
        Commands::Logs { format, .. } => *format == OutputFormat::Json,
        Commands::Health { output, .. } => *output == HealthOutput::Json,
        _ => false,
    }
}

#[tokio::main]
async fn main() {
    let default_level = if std::env::var("DEBUG").is_ok_and(|v| v == "1") {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .without_time()
        .init();

    let cli = Cli::parse();
    let json = json_mode(&cli);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "success": false,
                        "error": e.to_string(),
                        "code": e.code(),
                    })
                );
            } else {
                eprintln!("{} {e}", "[azd-app error]".red().bold());
            }
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run {
            service,
            env_file,
            dry_run,
            verbose,
            runtime: _,
            tolerate_partial,
        } => run_command(service, env_file, dry_run, verbose, tolerate_partial, vec![], false).await,

        Commands::Debug {
            service,
            wait_for_debugger,
            regenerate_config,
        } => {
            if regenerate_config {
                return debug_print(service, wait_for_debugger).await;
            }
            let debug_all = service.is_empty();
            run_command(
                service.clone(),
                None,
                false,
                false,
                false,
                if debug_all { all_service_names()? } else { service },
                wait_for_debugger,
            )
            .await
        }

        Commands::Stop { service, all, yes } => stop_command(service, all, yes).await,

        Commands::Start { service } => {
            let ctl = connect().await;
            ctl.start(&service).await?;
            println!("{} {service} started", "✓".green());
            Ok(0)
        }

        Commands::Restart { service } => {
            let ctl = connect().await;
            ctl.restart(&service).await?;
            println!("{} {service} restarted", "✓".green());
            Ok(0)
        }

        Commands::Logs {
            service,
            follow,
            tail,
            since,
            level,
            format,
            file,
            exclude,
            no_builtins,
            context,
        } => {
            logs_command(
                service, follow, tail, since, level, format, file, exclude, no_builtins, context,
            )
            .await
        }

        Commands::Health {
            service,
            stream,
            interval,
            timeout,
            output,
            all,
        } => health_command(service, stream, &interval, &timeout, output, all).await,

        Commands::Info { project } => info_command(project).await,
    }
}

fn project_paths() -> (PathBuf, PathBuf) {
    let dir = manifest::project_dir(None);
    let path = dir.join(manifest::MANIFEST_NAME);
    (dir, path)
}

fn all_service_names() -> Result<Vec<String>> {
    let (_, path) = project_paths();
    let project = manifest::load(&path)?;
    Ok(project.services.keys().cloned().collect())
}

async fn connect() -> Controller {
    let (dir, _) = project_paths();
    Controller::connect(&dir).await
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    service: Vec<String>,
    env_file: Option<PathBuf>,
    dry_run: bool,
    verbose: bool,
    tolerate_partial: bool,
    debug_services: Vec<String>,
    wait_for_debugger: bool,
) -> Result<i32> {
    if verbose {
        tracing::info!("verbose mode: set RUST_LOG=debug for full tracing output");
    }

    let (_, path) = project_paths();
    let project = manifest::load(&path)?;
    let registry = Arc::new(Registry::new(&project.dir));

    let mut opts = RunOptions::default();
    opts.tolerate_partial = tolerate_partial;
    opts.plan.persist_ports = !dry_run;
    opts.plan.debug_services = debug_services;
    opts.plan.wait_for_debugger = wait_for_debugger;
    if let Some(path) = env_file {
        opts.plan.extra_env = load_env_file(&path)?;
    }

    let selected = (!service.is_empty()).then_some(service);
    let sup = Arc::new(Supervisor::new(project, registry, opts));

    if dry_run {
        let plan = sup.plan_only(selected.as_deref())?;
        println!(
            "{:<16} {:<8} {:<8} COMMAND",
            "SERVICE", "PORT", "DEBUG"
        );
        println!("{}", "-".repeat(64));
        for rt in &plan.runtimes {
            println!(
                "{:<16} {:<8} {:<8} {}",
                rt.name().cyan(),
                rt.port,
                rt.debug_port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".into()),
                rt.rendered_command()
            );
        }
        return Ok(0);
    }

    sup.spawn_signal_listener();
    let started = sup.start_all(selected.as_deref()).await;

    match started {
        Ok(()) => {
            for view in sup.views().await {
                if let Some(dbg) = view.debug_port {
                    println!(
                        "{} {} on {} (debugger :{dbg})",
                        "→".cyan(),
                        view.name,
                        view.url
                    );
                } else {
                    println!("{} {} on {}", "→".cyan(), view.name, view.url);
                }
            }
            match Dashboard::start(sup.clone()).await {
                Ok(dash) => {
                    println!("{} dashboard at {}", "→".cyan(), dash.url);
                    sup.cancel_token().cancelled().await;
                    println!("\n{} shutting down...", "→".yellow());
                    sup.shutdown().await;
                    dash.stop(&sup).await;
                }
                Err(e) => {
                    tracing::warn!("dashboard failed to start: {e}");
                    sup.cancel_token().cancelled().await;
                    println!("\n{} shutting down...", "→".yellow());
                    sup.shutdown().await;
                }
            }
        }
        Err(e) => {
            sup.shutdown().await;
            print_failures(&sup).await;
            return Err(e);
        }
    }

    if sup.any_failed().await {
        print_failures(&sup).await;
        return Ok(1);
    }
    Ok(0)
}

async fn print_failures(sup: &Arc<Supervisor>) {
    for (name, code, tail) in sup.failures().await {
        let rendered = code.map(|c| c.to_string()).unwrap_or_else(|| "?".into());
        eprintln!(
            "{} {name} failed (exit code {rendered}); last output:",
            "✗".red().bold()
        );
        for entry in tail.iter().rev().take(20).rev() {
            eprintln!("  [{}] {}", name.red(), entry.line);
        }
    }
}

async fn stop_command(service: Vec<String>, all: bool, yes: bool) -> Result<i32> {
    let ctl = connect().await;
    if all {
        if !yes && !confirm("Stop all services? [y/N] ")? {
            println!("aborted");
            return Ok(0);
        }
        ctl.stop_all().await?;
        println!("{} all services stopped", "✓".green());
        return Ok(0);
    }
    if service.is_empty() {
        eprintln!(
            "{} nothing to stop: pass --service NAME or --all",
            "[azd-app error]".red().bold()
        );
        return Ok(2);
    }
    for name in &service {
        ctl.stop(name).await?;
        println!("{} {name} stopped", "✓".green());
    }
    Ok(0)
}

fn confirm(prompt: &str) -> Result<bool> {
    use std::io::Write;
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

#[allow(clippy::too_many_arguments)]
async fn logs_command(
    service: Option<String>,
    follow: bool,
    tail: usize,
    since: Option<String>,
    level: Option<String>,
    format: OutputFormat,
    file: Option<PathBuf>,
    exclude: Vec<String>,
    no_builtins: bool,
    context: usize,
) -> Result<i32> {
    let mut filter = LogFilter::new().exclude(exclude);
    if !no_builtins {
        filter = filter.with_builtins();
    }
    if let Some(level) = &level {
        let parsed = LogLevel::parse(level)
            .ok_or_else(|| AppError::Config(format!("unknown level '{level}'")))?;
        filter = filter.min_level(parsed);
    }
    let context = clamp_context(context);
    let since = since
        .map(|s| {
            manifest::parse_duration(&s)
                .map_err(|e| AppError::Config(format!("bad --since value: {e}")))
        })
        .transpose()?;

    if let Some(path) = file {
        let name = service.as_deref().unwrap_or("file");
        let entries = logfile::read_log_file(&path, name)?;
        render_entries(entries, &filter, context, since, tail, format);
        return Ok(0);
    }

    let ctl = connect().await;

    if follow {
        let name = service.ok_or_else(|| AppError::Config("--follow requires a service".into()))?;
        // Print the recent tail first, then stream.
        let entries = ctl.logs(&name, tail).await?;
        render_entries(entries, &filter, context, since, tail, format);
        let mut replay = ContextReplay::new(filter, context);
        ctl.follow_logs(&name, |entry| {
            for out in replay.push(entry) {
                print_entry(&out, format);
            }
        })
        .await?;
        return Ok(0);
    }

    let mut entries = Vec::new();
    match service {
        Some(name) => entries = ctl.logs(&name, tail).await?,
        None => {
            // All services, merged by global sequence / timestamp.
            let names: Vec<String> = if ctl.online() {
                ctl.views().await?.into_iter().map(|v| v.name).collect()
            } else {
                ctl.list()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|e| e.name)
                    .collect()
            };
            for name in names {
                entries.extend(ctl.logs(&name, tail).await?);
            }
            entries.sort_by_key(|e| (e.timestamp, e.sequence));
        }
    }
    render_entries(entries, &filter, context, since, tail, format);
    Ok(0)
}

fn render_entries(
    entries: Vec<LogEntry>,
    filter: &LogFilter,
    context: usize,
    since: Option<Duration>,
    tail: usize,
    format: OutputFormat,
) {
    let cutoff = since.map(|d| {
        chrono::Utc::now() - chrono::Duration::from_std(d).unwrap_or_default()
    });
    let mut replay = ContextReplay::new(filter.clone(), context);
    let mut out = Vec::new();
    for entry in entries {
        if cutoff.is_some_and(|c| entry.timestamp < c) {
            continue;
        }
        out.extend(replay.push(entry));
    }
    let skip = out.len().saturating_sub(tail);
    for entry in &out[skip..] {
        print_entry(entry, format);
    }
}

fn print_entry(entry: &LogEntry, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(entry).unwrap_or_default());
        }
        OutputFormat::Text => {
            let prefix = format!("[{}]", entry.service);
            let line = match entry.level {
                LogLevel::Error => entry.line.red().to_string(),
                LogLevel::Warn => entry.line.yellow().to_string(),
                _ => entry.line.clone(),
            };
            println!("{} {}", prefix.cyan(), line);
        }
    }
}

async fn health_command(
    service: Vec<String>,
    stream: bool,
    interval: &str,
    timeout: &str,
    output: HealthOutput,
    all: bool,
) -> Result<i32> {
    let interval = manifest::parse_duration(interval)
        .map_err(|e| AppError::Config(format!("bad --interval value: {e}")))?;
    let timeout = manifest::parse_duration(timeout)
        .map_err(|e| AppError::Config(format!("bad --timeout value: {e}")))?;
    if stream {
        if let Err(e) = health::validate_stream_params(interval, timeout) {
            // Rejected at parse time: usage error, not a supervised failure.
            eprintln!("{} {e}", "[azd-app error]".red().bold());
            return Ok(2);
        }
    }

    let ctl = connect().await;
    // Absolute schedule: the next check lands on the tick even when a slow
    // round eats into the interval.
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let rows = health_rows(&ctl, &service, all).await?;
        render_health(&rows, output);
        if !stream {
            break;
        }
    }
    Ok(0)
}

struct HealthRow {
    name: String,
    status: state::ServiceStatus,
    health: Option<health::HealthStatus>,
    detail: Option<String>,
}

async fn health_rows(
    ctl: &Controller,
    service: &[String],
    all: bool,
) -> Result<Vec<HealthRow>> {
    let wanted = |name: &str| service.is_empty() || service.iter().any(|s| s == name);
    if ctl.online() {
        Ok(ctl
            .views()
            .await?
            .into_iter()
            .filter(|v| wanted(&v.name))
            .filter(|v| all || v.status.is_running())
            .map(|v| HealthRow {
                name: v.name,
                status: v.status,
                health: v.health.as_ref().map(|h| h.status),
                detail: v.health.as_ref().and_then(|h| {
                    h.response_time_ms.map(|ms| format!("{ms}ms")).or_else(|| h.error.clone())
                }),
            })
            .collect())
    } else {
        // Registry read problems degrade to an empty listing.
        Ok(ctl
            .list()
            .unwrap_or_default()
            .into_iter()
            .filter(|e| wanted(&e.name))
            .filter(|e| all || e.status.is_running())
            .map(|e| HealthRow {
                name: e.name,
                status: e.status,
                health: e.health,
                detail: e.error,
            })
            .collect())
    }
}

fn render_health(rows: &[HealthRow], output: HealthOutput) {
    match output {
        HealthOutput::Json => {
            let body: Vec<_> = rows
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "name": r.name,
                        "status": r.status,
                        "health": r.health,
                        "detail": r.detail,
                    })
                })
                .collect();
            println!("{}", serde_json::json!(body));
        }
        HealthOutput::Table => {
            println!("{:<16} {:<10} {:<10} DETAIL", "SERVICE", "STATUS", "HEALTH");
            println!("{}", "-".repeat(52));
            for r in rows {
                println!(
                    "{:<16} {:<10} {:<10} {}",
                    r.name,
                    colorize_status(r.status),
                    r.health.map(colorize_health).unwrap_or_else(|| "-".into()),
                    r.detail.as_deref().unwrap_or("-")
                );
            }
        }
        HealthOutput::Text => {
            for r in rows {
                let health = r.health.map(colorize_health).unwrap_or_else(|| "unknown".dimmed().to_string());
                match &r.detail {
                    Some(d) => println!("{}: {} ({d})", r.name.cyan(), health),
                    None => println!("{}: {}", r.name.cyan(), health),
                }
            }
        }
    }
}

fn colorize_status(status: state::ServiceStatus) -> String {
    use state::ServiceStatus::*;
    match status {
        Ready => status.label().green().to_string(),
        Starting | Stopping => status.label().yellow().to_string(),
        Failed => status.label().red().to_string(),
        _ => status.label().dimmed().to_string(),
    }
}

fn colorize_health(health: health::HealthStatus) -> String {
    use health::HealthStatus::*;
    match health {
        Healthy => health.label().green().to_string(),
        Degraded | Starting => health.label().yellow().to_string(),
        Unhealthy => health.label().red().to_string(),
        Unknown => health.label().dimmed().to_string(),
    }
}

async fn info_command(project: Option<PathBuf>) -> Result<i32> {
    let dir = manifest::project_dir(project.as_deref());
    let path = dir.join(manifest::MANIFEST_NAME);
    let ctl = Controller::connect(&dir).await;

    match manifest::load(&path) {
        Ok(project) => {
            println!("{}: {}", "project".cyan(), project.name);
            println!("{}: {}", "manifest".cyan(), path.display());
            println!("{}: {} declared", "services".cyan(), project.services.len());
        }
        Err(e) => println!("{}: {e}", "manifest".cyan()),
    }
    match ctl.dashboard_url() {
        Some(url) => println!("{}: {url}", "dashboard".cyan()),
        None => println!("{}: not running", "dashboard".cyan()),
    }

    let entries = match ctl.list() {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("{} {e}", "[azd-app warning]".yellow().bold());
            Vec::new()
        }
    };
    if entries.is_empty() {
        println!("no registered services");
        return Ok(0);
    }
    println!();
    println!(
        "{:<16} {:<10} {:<8} {:<7} {:<10} URL",
        "SERVICE", "STATUS", "PID", "PORT", "HEALTH"
    );
    println!("{}", "-".repeat(72));
    for e in entries {
        println!(
            "{:<16} {:<10} {:<8} {:<7} {:<10} {}",
            e.name,
            colorize_status(e.status),
            e.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            e.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            e.health
                .map(colorize_health)
                .unwrap_or_else(|| "-".dimmed().to_string()),
            e.url.as_deref().unwrap_or("-")
        );
    }
    Ok(0)
}

async fn debug_print(service: Vec<String>, wait_for_debugger: bool) -> Result<i32> {
    let (_, path) = project_paths();
    let project = manifest::load(&path)?;
    let broker = ports::PortBroker::new();
    let mut opts = supervisor::plan::PlanOptions::default();
    opts.debug_services = if service.is_empty() {
        project.services.keys().cloned().collect()
    } else {
        service.clone()
    };
    opts.wait_for_debugger = wait_for_debugger;

    let selected = (!service.is_empty()).then_some(service);
    let plan = supervisor::plan::plan(&project, selected.as_deref(), &broker, &opts)?;
    println!("{:<16} {:<8} {:<10} COMMAND", "SERVICE", "PORT", "DEBUG");
    println!("{}", "-".repeat(64));
    for rt in &plan.runtimes {
        println!(
            "{:<16} {:<8} {:<10} {}",
            rt.name().cyan(),
            rt.port,
            rt.debug_port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into()),
            rt.rendered_command()
        );
    }
    Ok(0)
}

fn load_env_file(path: &std::path::Path) -> Result<IndexMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    let mut env = IndexMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(AppError::Config(format!(
                "bad line in {}: '{line}' (expected KEY=VALUE)",
                path.display()
            )));
        };
        env.insert(
            key.trim().to_string(),
            value.trim().trim_matches('"').to_string(),
        );
    }
    Ok(env)
}
