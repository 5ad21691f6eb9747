use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use songbook::auth::{AuthProvider, AuthProviderError};
use songbook::config::{BackendConfig, ConfigError};
use songbook::notify::{ChannelNotifier, Notification, Variant};
use songbook::session::{SessionConfig, SessionError, SessionManager};
use songbook::types::{ProfileUpdate, Session, UserMetadata};
use songbook::Backend;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Auth(#[from] AuthProviderError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("not signed in; run `songbook login` or pass --access-token and --refresh-token")]
    NotSignedIn,
    #[error("no profile row for the signed-in user")]
    NoProfile,
    #[error("nothing to update; pass at least one field")]
    EmptyUpdate,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "songbook", about = "Songbook account and profile CLI")]
struct Cli {
    /// Project base URL (falls back to SONGBOOK_URL).
    #[arg(long)]
    url: Option<String>,

    /// Public API key (falls back to SONGBOOK_ANON_KEY).
    #[arg(long)]
    anon_key: Option<String>,

    #[arg(long, env = "SONGBOOK_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    #[arg(long, env = "SONGBOOK_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Email a one-time sign-in link.
    MagicLink { email: String },
    /// Sign in with email and password and print the session tokens.
    Login {
        email: String,
        #[arg(long, env = "SONGBOOK_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account.
    Signup(SignupArgs),
    /// Finish a magic-link sign-in from the URL the email link opened.
    CompleteLink { redirect_url: String },
    /// Show the signed-in user and profile.
    Whoami,
    Logout,
    Profile(ProfileCommand),
}

#[derive(Args, Debug)]
struct SignupArgs {
    email: String,
    #[arg(long, env = "SONGBOOK_PASSWORD", hide_env_values = true)]
    password: String,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    full_name: Option<String>,
}

#[derive(Args, Debug)]
struct ProfileCommand {
    #[command(subcommand)]
    command: ProfileSubcommand,
}

#[derive(Subcommand, Debug)]
enum ProfileSubcommand {
    Show,
    Update(ProfileUpdateArgs),
}

#[derive(Args, Debug)]
struct ProfileUpdateArgs {
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    full_name: Option<String>,
    #[arg(long)]
    avatar_url: Option<String>,
    #[arg(long)]
    website: Option<String>,
    #[arg(long)]
    bio: Option<String>,
    #[arg(long)]
    artist: Option<bool>,
}

impl ProfileUpdateArgs {
    fn into_update(self) -> ProfileUpdate {
        let mut update = ProfileUpdate::default();
        if let Some(v) = self.username {
            update = update.username(v);
        }
        if let Some(v) = self.full_name {
            update = update.full_name(v);
        }
        if let Some(v) = self.avatar_url {
            update = update.avatar_url(v);
        }
        if let Some(v) = self.website {
            update = update.website(v);
        }
        if let Some(v) = self.bio {
            update = update.bio(v);
        }
        if let Some(v) = self.artist {
            update = update.is_artist(v);
        }
        update
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = BackendConfig::from_env_with(cli.url, cli.anon_key)?;
    let backend = Backend::new(config)?;
    let session_config = SessionConfig { redirect_url: backend.config().redirect_url.clone() };
    let auth = backend.auth();

    if let (Some(access), Some(refresh)) = (cli.access_token.as_deref(), cli.refresh_token.as_deref()) {
        auth.restore_session(access, refresh).await?;
    }

    let (notifier, mut notifications) = ChannelNotifier::new();
    let manager = SessionManager::mount(
        Arc::new(auth.clone()),
        Arc::new(backend.profiles()),
        Arc::new(notifier),
        session_config,
    );
    let state = manager.ready().await;
    tracing::debug!(phase = ?state.phase(), "session ready");

    let result = match cli.command {
        Command::MagicLink { email } => manager.sign_in(&email).await.map_err(CliError::from),
        Command::Login { email, password } => match manager.sign_in_with_password(&email, &password).await {
            Ok(_) => print_tokens(&auth).await,
            Err(e) => Err(e.into()),
        },
        Command::Signup(args) => {
            let metadata = UserMetadata { username: args.username, full_name: args.full_name, avatar_url: None };
            match manager.sign_up_with(&args.email, &args.password, metadata).await {
                Ok(Some(user)) => print_json(&user),
                Ok(None) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
        Command::CompleteLink { redirect_url } => match auth.complete_magic_link(&redirect_url).await {
            Ok(session) => {
                println!("signed in as {}", session.user.display_name());
                print_session_tokens(&session);
                Ok(())
            }
            Err(e) => Err(e.into()),
        },
        Command::Whoami => match manager.user() {
            Some(user) => {
                print_json(&user)?;
                match manager.get_profile().await {
                    Some(profile) => print_json(&profile),
                    None => Ok(()),
                }
            }
            None => Err(CliError::NotSignedIn),
        },
        Command::Logout => {
            manager.sign_out().await;
            Ok(())
        }
        Command::Profile(profile) => run_profile(&manager, profile).await,
    };

    drop(manager);
    drain_notifications(&mut notifications);
    result
}

async fn run_profile(manager: &SessionManager, profile: ProfileCommand) -> Result<(), CliError> {
    if manager.user().is_none() {
        return Err(CliError::NotSignedIn);
    }
    match profile.command {
        ProfileSubcommand::Show => {
            let profile = manager.get_profile().await.ok_or(CliError::NoProfile)?;
            print_json(&profile)
        }
        ProfileSubcommand::Update(args) => {
            let update = args.into_update();
            if update.is_empty() {
                return Err(CliError::EmptyUpdate);
            }
            manager.update_profile(&update).await?;
            Ok(())
        }
    }
}

async fn print_tokens(auth: &impl AuthProvider) -> Result<(), CliError> {
    let session = auth.current_session().await?.ok_or(CliError::NotSignedIn)?;
    print_session_tokens(&session);
    Ok(())
}

fn print_session_tokens(session: &Session) {
    println!("SONGBOOK_ACCESS_TOKEN={}", session.access_token);
    println!("SONGBOOK_REFRESH_TOKEN={}", session.refresh_token);
}

fn print_json(value: &impl serde::Serialize) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

fn drain_notifications(rx: &mut mpsc::UnboundedReceiver<Notification>) {
    while let Ok(notification) = rx.try_recv() {
        let marker = match notification.variant {
            Variant::Default => "*",
            Variant::Destructive => "!",
        };
        match notification.description {
            Some(description) => eprintln!("{marker} {}: {description}", notification.title),
            None => eprintln!("{marker} {}", notification.title),
        }
    }
}
