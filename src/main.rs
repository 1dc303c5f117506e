use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tenantd::{
    config::ServiceConfig,
    invitations::{CreateInvitationError, InvitationStore, InvitationType, NewInvitation},
    rest,
    storage::Storage,
    AppContext,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "tenantd",
    about = "Tenant onboarding and invitation service",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP API port
    #[arg(long, env = "TENANTD_PORT")]
    port: Option<u16>,

    /// Data directory for config and the SQLite database
    #[arg(long, env = "TENANTD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TENANTD_LOG")]
    log: Option<String>,

    /// Bind address for the HTTP server (default: 127.0.0.1; use 0.0.0.0 for LAN access)
    #[arg(long, env = "TENANTD_BIND")]
    bind_address: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "TENANTD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Suppress progress and informational output.
    ///
    /// Errors are still printed to stderr. JSON output (--json flags) is
    /// unaffected. Use this flag when piping output to other tools.
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the onboarding API server (default when no subcommand given).
    ///
    /// Runs tenantd in the foreground: the REST API plus the background
    /// invitation expiry sweep.
    ///
    /// Examples:
    ///   tenantd serve
    ///   tenantd
    Serve,
    /// Issue an invitation and print its acceptance token.
    ///
    /// Writes the invitation directly to the database; the server does not
    /// need to be running. With --quiet only the token is printed, for use
    /// in scripts.
    ///
    /// Examples:
    ///   tenantd invite alice@example.com "Alice Smith"
    ///   tenantd invite bob@corp.test "Bob Jones" --type collaborator --tenant <TENANT_ID>
    Invite(InviteArgs),
    /// Expire overdue invitations.
    ///
    /// Flips every pending invitation past its expiry to expired and prints
    /// the count. The server runs the same sweep on an interval; this
    /// subcommand covers cron-style setups where the server is not running.
    ///
    /// Examples:
    ///   tenantd sweep
    Sweep,
    /// Print onboarding counters.
    ///
    /// Invitation counts by status plus tenant/profile/employee totals and
    /// the number of partial provisions awaiting repair.
    ///
    /// Examples:
    ///   tenantd stats
    ///   tenantd stats --json
    Stats {
        /// Print raw JSON instead of the summary
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct InviteArgs {
    /// Invitee email address
    email: String,
    /// Invitee display name
    full_name: String,
    /// Invitation type: tenant_owner or collaborator
    #[arg(long = "type", value_name = "TYPE", default_value = "tenant_owner")]
    invitation_type: String,
    /// Target tenant id (required for collaborator invitations)
    #[arg(long)]
    tenant: Option<String>,
    /// Issuing user id, recorded on the invitation
    #[arg(long)]
    issued_by: Option<String>,
    /// Extra metadata as a JSON object, carried through to provisioning
    /// (e.g. '{"company_name":"Acme"}')
    #[arg(long)]
    metadata: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ─── Logging setup ───────────────────────────────────────────────────────
    // Init once, before any tracing calls.
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let log_format =
        std::env::var("TENANTD_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref(), &log_format);

    let quiet = args.quiet;
    match args.command {
        Some(Command::Invite(cmd)) => run_invite(cmd, args.data_dir, quiet).await?,
        Some(Command::Sweep) => run_sweep(args.data_dir, quiet).await?,
        Some(Command::Stats { json }) => run_stats(args.data_dir, json).await?,
        None | Some(Command::Serve) => {
            run_server(args.port, args.data_dir, args.log, args.bind_address).await?;
        }
    }

    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (default, human-readable compact format) or
/// `"json"` (structured JSON for log aggregators).
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning; it never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    let Some(path) = log_file else {
        init_stdout_logging(log_level, use_json);
        return None;
    };

    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let filename = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("tenantd.log"));

    // Ensure the directory exists before tracing-appender tries to open it.
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!(
            "warn: could not create log directory '{}': {e}; falling back to stdout",
            dir.display()
        );
        init_stdout_logging(log_level, use_json);
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    if use_json {
        tracing_subscriber::registry()
            .with(EnvFilter::new(log_level))
            .with(fmt::layer().json())
            .with(fmt::layer().json().with_writer(non_blocking))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(EnvFilter::new(log_level))
            .with(fmt::layer().compact())
            .with(fmt::layer().with_writer(non_blocking))
            .init();
    }

    Some(guard)
}

fn init_stdout_logging(log_level: &str, use_json: bool) {
    if use_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(log_level)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
    }
}

// ─── tenantd serve ────────────────────────────────────────────────────────────

async fn run_server(
    port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
    bind_address: Option<String>,
) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "tenantd starting");

    let config = ServiceConfig::new(port, data_dir, log, bind_address);
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        "config loaded"
    );

    let ctx = AppContext::init(config).await?;

    // ─── Background expiry sweep ─────────────────────────────────────────────
    // Overdue invitations are also expired lazily on read; the sweep keeps the
    // table from accumulating stale pending rows that nobody reads.
    let sweep_secs = ctx.config.invitations.sweep_interval_secs;
    if sweep_secs > 0 {
        let store = ctx.invitations.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(sweep_secs));
            // First tick completes immediately; skip it so startup stays quiet.
            interval.tick().await;
            loop {
                interval.tick().await;
                match store.sweep_expired(Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "expired overdue invitations"),
                    Err(e) => warn!(err = %e, "invitation sweep failed"),
                }
            }
        });
    }

    rest::start_rest_server(ctx).await
}

// ─── One-shot subcommands ─────────────────────────────────────────────────────
// These open the database directly so they work without a running server.

async fn open_store(data_dir: Option<std::path::PathBuf>) -> Result<(Storage, InvitationStore)> {
    let config = ServiceConfig::new(None, data_dir, Some("error".to_string()), None);
    let storage = Storage::new(&config.data_dir).await?;
    let store = InvitationStore::new(storage.pool(), config.invitations.ttl_days);
    Ok((storage, store))
}

async fn run_invite(cmd: InviteArgs, data_dir: Option<std::path::PathBuf>, quiet: bool) -> Result<()> {
    let Some(invitation_type) = InvitationType::parse(&cmd.invitation_type) else {
        eprintln!(
            "Unknown invitation type '{}' (expected tenant_owner or collaborator)",
            cmd.invitation_type
        );
        std::process::exit(2);
    };
    let metadata = match cmd.metadata.as_deref() {
        Some(raw) => Some(serde_json::from_str(raw).context("--metadata must be a JSON object")?),
        None => None,
    };

    let (_storage, store) = open_store(data_dir).await?;
    let new = NewInvitation {
        email: cmd.email,
        full_name: cmd.full_name,
        invitation_type,
        tenant_id: cmd.tenant,
        issued_by: cmd.issued_by,
        metadata,
    };

    match store.create(new).await {
        Ok(inv) => {
            if quiet {
                println!("{}", inv.token);
            } else {
                println!("Invitation created: {}", inv.id);
                println!("  email:   {}", inv.email);
                println!("  type:    {}", inv.invitation_type);
                println!("  tenant:  {}", inv.tenant_id);
                println!("  expires: {}", inv.expires_at.to_rfc3339());
                println!("  token:   {}", inv.token);
            }
        }
        Err(CreateInvitationError::DuplicateActive) => {
            eprintln!("A pending invitation for this email and type already exists.");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

async fn run_sweep(data_dir: Option<std::path::PathBuf>, quiet: bool) -> Result<()> {
    let (_storage, store) = open_store(data_dir).await?;
    let swept = store.sweep_expired(Utc::now()).await?;
    if !quiet {
        println!("{swept} invitation(s) expired");
    }
    Ok(())
}

async fn run_stats(data_dir: Option<std::path::PathBuf>, json: bool) -> Result<()> {
    let (storage, _store) = open_store(data_dir).await?;
    let stats = storage.onboarding_stats().await?;

    if json {
        println!("{}", serde_json::to_string(&stats)?);
        return Ok(());
    }

    println!("Invitations");
    println!("  pending:  {}", stats.invitations_pending);
    println!("  accepted: {}", stats.invitations_accepted);
    println!("  expired:  {}", stats.invitations_expired);
    println!("  revoked:  {}", stats.invitations_revoked);
    println!("Provisioned");
    println!("  tenants:   {}", stats.tenants);
    println!("  profiles:  {}", stats.profiles);
    println!("  employees: {}", stats.employees);
    if stats.partial_provisions > 0 {
        println!();
        println!(
            "{} accepted invitation(s) awaiting employee repair",
            stats.partial_provisions
        );
    }

    Ok(())
}
