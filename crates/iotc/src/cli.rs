//! Clap derive structures for the `iotc` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// iotc -- device-side tooling for IoT Central
#[derive(Debug, Parser)]
#[command(
    name = "iotc",
    version,
    about = "Sign device credentials, manage IoT Central device profiles, and talk to the hub",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Device profile to use
    #[arg(long, short = 'p', env = "IOTC_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "IOTC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "plain", global = true)]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Plain text, one value per line
    Plain,
    /// Pretty-printed JSON
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Derive a device key from an enrollment-group key
    DeriveKey {
        /// Device (registration) id
        device_id: String,

        /// Base64 enrollment-group key
        #[arg(long, env = "IOTC_GROUP_KEY", hide_env_values = true)]
        group_key: String,
    },

    /// Sign SAS passwords
    Sas(SasArgs),

    /// Inspect and edit device profiles
    #[command(alias = "profiles")]
    Profile(ProfileArgs),

    /// Upload a file through the hub's blob storage
    Upload(UploadArgs),

    /// Decode an IoT Central credential bundle
    DecodeCredentials(DecodeArgs),

    /// Connect with the active profile and send one message
    Send(SendArgs),
}

// ── SAS ──────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct SasArgs {
    #[command(subcommand)]
    pub command: SasCommand,
}

#[derive(Debug, Subcommand)]
pub enum SasCommand {
    /// Password for the device's IoT hub connection
    Hub {
        /// Hub host (overrides profile)
        #[arg(long)]
        host: Option<String>,

        /// Device id (overrides profile)
        #[arg(long)]
        device_id: Option<String>,

        /// Base64 device key (overrides profile)
        #[arg(long, env = "IOTC_DEVICE_KEY", hide_env_values = true)]
        key: Option<String>,
    },

    /// Password for the provisioning service
    Provisioning {
        /// Id scope (overrides profile)
        #[arg(long)]
        scope_id: Option<String>,

        /// Registration id (overrides profile)
        #[arg(long)]
        device_id: Option<String>,

        /// Base64 device key (overrides profile)
        #[arg(long, env = "IOTC_DEVICE_KEY", hide_env_values = true)]
        key: Option<String>,
    },
}

// ── Profiles ─────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ProfileArgs {
    #[command(subcommand)]
    pub command: ProfileCommand,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    /// List configured profiles
    List,

    /// Show one profile (secrets redacted)
    Show {
        /// Profile name (defaults to the active profile)
        name: Option<String>,
    },

    /// Print the config file path
    Path,

    /// Set the default profile
    Use {
        /// Profile name
        name: String,
    },

    /// Store a profile's device key in the system keyring
    SetKey {
        /// Profile name
        name: String,

        /// Base64 key to store
        #[arg(long, env = "IOTC_DEVICE_KEY", hide_env_values = true)]
        key: String,
    },
}

// ── Upload ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct UploadArgs {
    /// File to upload
    pub file: PathBuf,

    /// Blob name (defaults to the file name)
    #[arg(long)]
    pub name: Option<String>,

    /// Content-Type of the blob
    #[arg(long, default_value = "application/octet-stream")]
    pub content_type: String,

    /// Content-Encoding of the blob
    #[arg(long)]
    pub encoding: Option<String>,
}

// ── Credential bundles ───────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct DecodeArgs {
    /// Base64 bundle, optionally passphrase-encrypted
    pub bundle: String,

    /// Passphrase the bundle was encrypted with
    #[arg(long, env = "IOTC_BUNDLE_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,

    /// Save the decoded identity as this profile
    #[arg(long, value_name = "PROFILE")]
    pub save: Option<String>,
}

// ── Send ─────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct SendArgs {
    /// JSON payload
    pub payload: String,

    /// Send as a reported property patch instead of telemetry
    #[arg(long)]
    pub property: bool,
}
