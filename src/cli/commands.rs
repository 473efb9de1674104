use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// SSH Session Manager - shared SSH sessions, jump hosts and stored credentials
#[derive(Parser, Debug)]
#[command(name = "ssh-session-manager")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List saved profiles
    #[command(alias = "list")]
    Profiles {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add a profile
    Add {
        /// Profile name
        #[arg(short, long)]
        name: String,

        /// SSH host
        #[arg(short = 'H', long)]
        host: String,

        /// SSH port (22 when omitted)
        #[arg(short, long)]
        port: Option<u16>,

        /// SSH username
        #[arg(short, long)]
        username: String,

        /// SSH private key path
        #[arg(short, long, conflicts_with = "keyboard_interactive")]
        key: Option<PathBuf>,

        /// The private key is protected by a passphrase
        #[arg(long, requires = "key")]
        passphrase_required: bool,

        /// Use keyboard-interactive authentication
        #[arg(long)]
        keyboard_interactive: bool,

        /// Name of the profile to jump through
        #[arg(short = 'J', long)]
        jump: Option<String>,

        /// Always open a dedicated connection for this profile
        #[arg(long)]
        no_reuse: bool,

        /// Ask before closing an open tab on this profile
        #[arg(long)]
        warn_on_close: Option<bool>,
    },

    /// Remove a profile and its stored password
    #[command(alias = "delete")]
    Remove {
        /// Profile name
        name: String,
    },

    /// Open a shell on a saved profile or a quick-connect target
    Connect {
        /// Profile name, or `[ssh] [-p port] [-J jump] user@host[:port]`
        #[arg(num_args = 1.., required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        target: Vec<String>,

        /// Do not share a connection with other tabs
        #[arg(long)]
        no_reuse: bool,
    },

    /// Manage stored passwords
    Password {
        #[command(subcommand)]
        action: PasswordAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum PasswordAction {
    /// Store a password (or key passphrase) for a profile
    Set {
        /// Profile name
        profile: String,

        /// Store the private key passphrase instead of the login password
        #[arg(long)]
        key_passphrase: bool,
    },

    /// Forget the stored password (or key passphrase) of a profile
    Delete {
        /// Profile name
        profile: String,

        #[arg(long)]
        key_passphrase: bool,
    },
}
