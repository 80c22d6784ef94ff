use std::env;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::filter::LevelFilter;

use userdir::api;
use userdir::db::Database;
use userdir::settings::{self, APP_NAME, AppConfig, AppPaths, LogFormat};
use userdir::user::{
    CreateUserRequest, MemoryUserStore, UserDirectory, UserInfo, UserListQuery, UserRepository,
    UserRole, UserStore,
};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_users(ctx: RuntimeContext, cmd: UsersCommand) -> Result<()> {
    handle_users(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Users { command } => async_users(ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "userdir - user directory service.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Manage user records directly in the database
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
    /// Database file (overrides config)
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,
    /// Keep users in memory only; everything is lost on exit
    #[arg(long, conflicts_with = "database")]
    ephemeral: bool,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Subcommand)]
enum UsersCommand {
    /// List users
    List(UsersListCommand),
    /// Create a user
    Create(UsersCreateCommand),
    /// Delete a user by id
    Delete(UsersDeleteCommand),
    /// Show the number of users
    Stats,
}

#[derive(Debug, Clone, Args)]
struct UsersListCommand {
    /// Only users with this role
    #[arg(long, value_parser = parse_role)]
    role: Option<UserRole>,
    /// Substring match on email or display name
    #[arg(short, long)]
    search: Option<String>,
    /// Maximum number of users to list
    #[arg(short, long)]
    limit: Option<i64>,
    /// Number of users to skip
    #[arg(long)]
    offset: Option<i64>,
}

#[derive(Debug, Clone, Args)]
struct UsersCreateCommand {
    /// Email address (login name)
    #[arg(long)]
    email: String,
    /// Password for the new user
    #[arg(long, env = "USERDIR_NEW_USER_PASSWORD", hide_env_values = true)]
    password: String,
    /// Display name (defaults to the email's local part)
    #[arg(long)]
    display_name: Option<String>,
    /// Role of the new user
    #[arg(long, value_parser = parse_role)]
    role: Option<UserRole>,
}

#[derive(Debug, Clone, Args)]
struct UsersDeleteCommand {
    /// ID of the user to delete
    user_id: String,
}

fn parse_role(s: &str) -> std::result::Result<UserRole, String> {
    s.parse()
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = settings::load_or_init_config(&paths, common.dry_run)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::fmt::time::ChronoUtc;
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.effective_log_level().to_string().to_lowercase();

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}"))
        });

        let format = if self.common.json {
            LogFormat::Json
        } else {
            self.config.logging.format
        };

        let force_color = matches!(self.common.color, ColorOption::Always)
            || env::var_os("FORCE_COLOR").is_some();
        let disable_color = self.common.no_color
            || matches!(self.common.color, ColorOption::Never)
            || env::var_os("NO_COLOR").is_some()
            || (!force_color && !io::stderr().is_terminal());

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match format {
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_timer(ChronoUtc::rfc_3339())
                        .with_writer(io::stderr),
                )
                .try_init(),
            LogFormat::Pretty => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_timer(ChronoUtc::rfc_3339())
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics)
                        .with_writer(io::stderr),
                )
                .try_init(),
            LogFormat::Compact => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_timer(ChronoUtc::rfc_3339())
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_writer(io::stderr),
                )
                .try_init(),
        };

        result.map_err(|err| anyhow!("installing log subscriber: {err}"))
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.quiet {
            LevelFilter::ERROR
        } else if self.common.trace {
            LevelFilter::TRACE
        } else if self.common.debug {
            LevelFilter::DEBUG
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::INFO),
                1 => LevelFilter::DEBUG,
                _ => LevelFilter::TRACE,
            }
        }
    }

    /// Open the configured database (or the `--database` override).
    async fn open_database(&self, override_path: Option<PathBuf>) -> Result<Database> {
        let path = match override_path {
            Some(path) => path,
            None => self.config.database.resolve_path(&self.paths.data_dir)?,
        };
        info!("Using database {}", path.display());
        Database::new(&path, self.config.database.options()).await
    }

    fn directory(&self, store: Arc<dyn UserStore>) -> UserDirectory {
        UserDirectory::new(store, self.config.users.clone())
    }

    fn print_structured<T: serde::Serialize>(&self, value: &T) -> Result<bool> {
        if self.common.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).context("serializing output to JSON")?
            );
            Ok(true)
        } else if self.common.yaml {
            println!(
                "{}",
                serde_yaml::to_string(value).context("serializing output to YAML")?
            );
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    settings::write_default_config(&ctx.paths.config_file)?;
    std::fs::create_dir_all(&ctx.paths.data_dir).with_context(|| {
        format!("creating data directory {}", ctx.paths.data_dir.display())
    })
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if !ctx.print_structured(&ctx.config)? {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            settings::write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_users(ctx: &RuntimeContext, cmd: UsersCommand) -> Result<()> {
    let database = ctx.open_database(None).await?;
    let users = ctx.directory(Arc::new(UserRepository::new(database.pool().clone())));

    match cmd {
        UsersCommand::List(list_cmd) => {
            let query = UserListQuery {
                role: list_cmd.role,
                search: list_cmd.search,
                limit: list_cmd.limit,
                offset: list_cmd.offset,
            };
            let infos: Vec<UserInfo> = users
                .list_users(query)
                .await?
                .into_iter()
                .map(UserInfo::from)
                .collect();

            if !ctx.print_structured(&infos)? {
                if infos.is_empty() {
                    println!("No users.");
                }
                for info in &infos {
                    println!(
                        "{}  {:<8} {:<32} {}",
                        info.id,
                        info.role.to_string(),
                        info.email,
                        info.display_name
                    );
                }
            }
        }
        UsersCommand::Create(create_cmd) => {
            if ctx.common.dry_run {
                info!("dry-run: would create user {}", create_cmd.email);
                return Ok(());
            }
            let user = users
                .create_user(CreateUserRequest {
                    email: create_cmd.email,
                    password: create_cmd.password,
                    display_name: create_cmd.display_name,
                    avatar_url: None,
                    role: create_cmd.role,
                })
                .await?;

            let info = UserInfo::from(user);
            if !ctx.print_structured(&info)? {
                println!("Created user {} ({})", info.id, info.email);
            }
        }
        UsersCommand::Delete(delete_cmd) => {
            if ctx.common.dry_run {
                info!("dry-run: would delete user {}", delete_cmd.user_id);
                return Ok(());
            }
            if users.delete_user(&delete_cmd.user_id).await? {
                println!("Deleted user {}", delete_cmd.user_id);
            } else {
                return Err(anyhow!("user not found: {}", delete_cmd.user_id));
            }
        }
        UsersCommand::Stats => {
            let total = users.count().await?;
            if !ctx.print_structured(&serde_json::json!({ "total": total }))? {
                println!("{total} user(s)");
            }
        }
    }

    database.close().await;
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let (store, database): (Arc<dyn UserStore>, Option<Database>) = if cmd.ephemeral {
        warn!("Running with an in-memory user store; data will not survive a restart");
        (Arc::new(MemoryUserStore::new()), None)
    } else {
        let database = ctx.open_database(cmd.database).await?;
        let repo = UserRepository::new(database.pool().clone());
        (Arc::new(repo), Some(database))
    };

    let state = api::AppState::new(ctx.directory(store))
        .with_allowed_origins(ctx.config.server.allowed_origins.clone());
    let app = api::create_router(state);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("invalid address")?;

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    if let Some(database) = database {
        database.close().await;
    }
    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
