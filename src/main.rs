use std::path::PathBuf;
use std::sync::Arc;

use campus_auth::api::HttpAuthApi;
use campus_auth::config::ClientConfig;
use campus_auth::guard::{GuardError, NavigationDecision, NavigationGuard, RedirectReason};
use campus_auth::routes::{RouteError, RouteRegistry};
use campus_auth::session::{AuthError, SessionStore};
use campus_auth::storage::FileStorage;
use clap::{Parser, Subcommand};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("config: {0}")]
    Config(#[from] campus_auth::config::ConfigError),
    #[error("api client: {0}")]
    Api(#[from] campus_auth::api::ApiError),
    #[error("{0}")]
    Auth(#[from] AuthError),
    #[error("routes: {0}")]
    Routes(#[from] RouteError),
    #[error("guard: {0}")]
    Guard(#[from] GuardError),
    #[error("failed to read {path}: {source}")]
    ReadRoutes {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Parser, Debug)]
#[command(name = "campus-auth", about = "Learning portal session and navigation guard")]
struct Cli {
    /// Backend API root; overrides `CAMPUS_API_BASE_URL`.
    #[arg(long)]
    api_base_url: Option<String>,

    /// Persisted session document; overrides `CAMPUS_SESSION_FILE`.
    #[arg(long)]
    session_file: Option<PathBuf>,

    /// JSON route table; overrides `CAMPUS_ROUTES_FILE`.
    #[arg(long)]
    routes_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and cache the token and profile.
    Login {
        email: String,
        #[arg(long, env = "CAMPUS_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Clear the cached session.
    Logout,
    /// Show the cached session.
    Whoami {
        /// Refresh the profile from the backend first.
        #[arg(long)]
        refresh: bool,
    },
    /// Decide whether a transition to PATH is allowed.
    Navigate { path: String },
    /// List the route table.
    Routes,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env()?;
    if let Some(url) = cli.api_base_url {
        config.api_base_url = campus_auth::config::normalize_base_url(&url);
    }
    if let Some(path) = cli.session_file {
        config.session_file = path;
    }
    if cli.routes_file.is_some() {
        config.routes_file = cli.routes_file;
    }

    let api = HttpAuthApi::from_config(&config)?;
    let storage = FileStorage::new(config.session_file.clone());
    let store = SessionStore::restore(Arc::new(storage), Arc::new(api));

    match cli.command {
        Command::Login { email, password } => run_login(&store, &email, &password).await,
        Command::Logout => {
            store.logout();
            println!("signed out");
            Ok(())
        }
        Command::Whoami { refresh } => run_whoami(&store, refresh).await,
        Command::Navigate { path } => run_navigate(store, &config, &path).await,
        Command::Routes => run_routes(&config),
    }
}

fn load_registry(config: &ClientConfig) -> Result<RouteRegistry, CliError> {
    let Some(path) = &config.routes_file else {
        return Ok(RouteRegistry::campus());
    };
    let raw = std::fs::read_to_string(path).map_err(|source| CliError::ReadRoutes { path: path.clone(), source })?;
    Ok(RouteRegistry::from_json(&raw)?)
}

async fn run_login(store: &SessionStore, email: &str, password: &str) -> Result<(), CliError> {
    store.login(email, password).await?;
    let roles: Vec<String> = store.roles().into_iter().collect();
    println!("signed in as {email} ({})", roles.join(", "));
    Ok(())
}

async fn run_whoami(store: &SessionStore, refresh: bool) -> Result<(), CliError> {
    if refresh || store.snapshot().needs_profile() {
        store.fetch_profile().await?;
    }
    let session = store.snapshot();
    let Some(user) = session.user() else {
        println!("anonymous");
        return Ok(());
    };
    let name = user.username().or_else(|| user.email()).unwrap_or("(unnamed)");
    let roles: Vec<&str> = session.roles().into_iter().collect();
    println!("{name} [{}]", roles.join(", "));
    Ok(())
}

async fn run_navigate(store: SessionStore, config: &ClientConfig, path: &str) -> Result<(), CliError> {
    let registry = load_registry(config)?;
    let guard = NavigationGuard::new(store, Arc::new(registry))?;
    let decision = guard.evaluate(path).await;
    match &decision {
        NavigationDecision::Allow => println!("allow {path}"),
        NavigationDecision::Redirect { to, reason } => {
            let target = guard.redirect_path(&decision).unwrap_or(to);
            println!("redirect {path} -> {target} ({})", describe(*reason));
        }
    }
    Ok(())
}

fn run_routes(config: &ClientConfig) -> Result<(), CliError> {
    let registry = load_registry(config)?;
    for entry in registry.entries() {
        let access = match (entry.descriptor.requires_auth, entry.descriptor.allowed_roles.is_empty()) {
            (false, true) => "public".to_owned(),
            (true, true) => "signed in".to_owned(),
            (_, false) => entry
                .descriptor
                .allowed_roles
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", "),
        };
        println!("{:<20} {:<30} {access}", entry.name, entry.path);
    }
    Ok(())
}

fn describe(reason: RedirectReason) -> &'static str {
    match reason {
        RedirectReason::LoginRequired => "login required",
        RedirectReason::Forbidden => "not permitted for your role",
        RedirectReason::AlreadyAuthenticated => "already signed in",
    }
}
