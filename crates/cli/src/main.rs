//! Stampline CLI - Database migrations and operator tools.
//!
//! # Usage
//!
//! ```bash
//! # Run database migrations
//! sl-cli migrate
//!
//! # Change how many stamps one reward costs
//! sl-cli settings reward-stamps 8 --staff 1
//!
//! # Generate a high-entropy value for STAMPLINE_* secrets
//! sl-cli secret generate
//!
//! # Development helpers
//! sl-cli totp new --account alice@example.com
//! sl-cli qr issue --user 42
//! sl-cli webhook sign --body payload.json
//! echo 'correct horse battery' | sl-cli password hash
//! ```
//!
//! Output meant for piping (tokens, hashes, secrets) goes to stdout; progress
//! goes through `tracing`.

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "sl-cli")]
#[command(author, version, about = "Stampline CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Loyalty program settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Generate secrets
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },
    /// Password credentials
    Password {
        #[command(subcommand)]
        action: PasswordAction,
    },
    /// TOTP secrets
    Totp {
        #[command(subcommand)]
        action: TotpAction,
    },
    /// Loyalty QR tokens
    Qr {
        #[command(subcommand)]
        action: QrAction,
    },
    /// Payment webhook signatures
    Webhook {
        #[command(subcommand)]
        action: WebhookAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Show the current program settings
    Show,
    /// Set the number of stamps one reward costs
    RewardStamps {
        /// Stamps per reward (at least 1)
        stamps: i32,

        /// Staff ID recorded as the author of the change
        #[arg(short, long)]
        staff: i32,
    },
}

#[derive(Subcommand)]
enum SecretAction {
    /// Print a random base64url value
    Generate {
        /// Number of random bytes
        #[arg(short, long, default_value_t = commands::secret::DEFAULT_SECRET_BYTES)]
        bytes: usize,
    },
}

#[derive(Subcommand)]
enum PasswordAction {
    /// Hash a password read from stdin
    Hash,
}

#[derive(Subcommand)]
enum TotpAction {
    /// Generate a TOTP secret and provisioning URI
    New {
        /// Account label shown in the authenticator app
        #[arg(short, long)]
        account: String,

        /// Issuer shown in the authenticator app
        #[arg(short, long, default_value = "Stampline")]
        issuer: String,
    },
}

#[derive(Subcommand)]
enum QrAction {
    /// Issue a QR token for a customer (uses `STAMPLINE_QR_TOKEN_SECRET`)
    Issue {
        /// Customer user ID
        #[arg(short, long)]
        user: i32,

        /// Token lifetime in seconds
        #[arg(short, long)]
        ttl: Option<i64>,
    },
}

#[derive(Subcommand)]
enum WebhookAction {
    /// Sign a request body (uses `STAMPLINE_WEBHOOK_SECRET`)
    Sign {
        /// File holding the raw request body
        #[arg(short, long)]
        body: std::path::PathBuf,

        /// Unix timestamp to sign with (defaults to now)
        #[arg(short, long)]
        timestamp: Option<i64>,
    },
}

#[tokio::main]
async fn main() {
    stampline_guard::telemetry::init_tracing();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Settings { action } => match action {
            SettingsAction::Show => commands::settings::show().await?,
            SettingsAction::RewardStamps { stamps, staff } => {
                commands::settings::set_reward_stamps(stamps, staff).await?;
            }
        },
        Commands::Secret { action } => match action {
            SecretAction::Generate { bytes } => commands::secret::generate(bytes)?,
        },
        Commands::Password { action } => match action {
            PasswordAction::Hash => commands::secret::hash_password()?,
        },
        Commands::Totp { action } => match action {
            TotpAction::New { account, issuer } => commands::dev::totp_new(&account, &issuer),
        },
        Commands::Qr { action } => match action {
            QrAction::Issue { user, ttl } => commands::dev::qr_issue(user, ttl)?,
        },
        Commands::Webhook { action } => match action {
            WebhookAction::Sign { body, timestamp } => {
                commands::dev::webhook_sign(&body, timestamp)?;
            }
        },
    }
    Ok(())
}
