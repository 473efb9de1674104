use crate::models::{AuthMethod, SshProfile};
use crate::utils::error::{Result, SshSessionError};
use std::path::PathBuf;

/// Profiles produced by a quick-connect string
#[derive(Debug, Clone)]
pub struct QuickConnect {
    pub profile: SshProfile,
    /// Jump host named with `-J`; `profile.jump_host` points at it
    pub jump: Option<SshProfile>,
}

impl QuickConnect {
    /// Every profile the target needs, jump host first
    pub fn profiles(&self) -> Vec<SshProfile> {
        self.jump.iter().cloned().chain(std::iter::once(self.profile.clone())).collect()
    }
}

/// Parse quick-connect strings into profiles
///
/// Supports:
/// - `user@host`, `user@host:2222`, `user@[::1]:2222`
/// - `ssh -p 2222 -l admin -i ~/.ssh/id_ed25519 host`
/// - `ssh -J ops@bastion:2200 deploy@10.0.0.5`
pub struct SshCommandParser;

impl SshCommandParser {
    /// Parse a full command, with or without the leading `ssh`
    pub fn parse_command(command: &str) -> Result<QuickConnect> {
        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.first() {
            None => Err(SshSessionError::ConfigError("Empty connection string".to_string())),
            Some(&"ssh") => Self::parse_args(&parts[1..]),
            Some(_) => Self::parse_args(&parts),
        }
    }

    pub fn parse_args(args: &[&str]) -> Result<QuickConnect> {
        let mut destination: Option<Endpoint> = None;
        let mut login: Option<String> = None;
        let mut port: Option<u16> = None;
        let mut identity_file: Option<PathBuf> = None;
        let mut jump: Option<Endpoint> = None;

        let mut i = 0;
        while i < args.len() {
            let arg = args[i];
            match arg {
                "-p" | "-l" | "-i" | "-J" => {
                    i += 1;
                    let value = *args
                        .get(i)
                        .ok_or_else(|| SshSessionError::ConfigError(format!("{} requires an argument", arg)))?;
                    match arg {
                        "-p" => port = Some(parse_port(value)?),
                        "-l" => login = Some(value.to_string()),
                        "-i" => identity_file = Some(PathBuf::from(value)),
                        _ => {
                            if value.contains(',') {
                                return Err(SshSessionError::ConfigError(
                                    "Only one jump host is supported per quick connect".to_string(),
                                ));
                            }
                            jump = Some(Endpoint::parse(value)?);
                        }
                    }
                }
                "-C" | "-q" | "-N" | "-t" | "-T" | "-v" | "-vv" | "-vvv" => {}
                arg if arg.starts_with('-') => {
                    tracing::warn!("Ignoring unknown option: {}", arg);
                }
                arg => {
                    if destination.is_some() {
                        return Err(SshSessionError::ConfigError(format!(
                            "Remote commands are not supported: {}",
                            arg
                        )));
                    }
                    destination = Some(Endpoint::parse(arg)?);
                }
            }
            i += 1;
        }

        let destination = destination.ok_or_else(|| SshSessionError::ConfigError("Host is required".to_string()))?;

        let username = destination
            .user
            .clone()
            .or(login)
            .unwrap_or_else(default_username);
        let port = port.or(destination.port);

        let mut profile = SshProfile::new(
            display_name(&username, &destination.host, port),
            destination.host.clone(),
            username,
        );
        profile.port = port;
        if let Some(key_path) = identity_file {
            profile.auth_method = AuthMethod::PublicKey {
                private_key_path: key_path,
                passphrase_required: false,
            };
        }

        let jump = jump.map(|endpoint| {
            let user = endpoint.user.clone().unwrap_or_else(|| profile.username.clone());
            let mut jump = SshProfile::new(
                display_name(&user, &endpoint.host, endpoint.port),
                endpoint.host,
                user,
            );
            jump.port = endpoint.port;
            jump
        });
        if let Some(jump) = &jump {
            profile.jump_host = Some(jump.id);
        }

        Ok(QuickConnect { profile, jump })
    }

    /// Equivalent `ssh` command for a profile
    pub fn to_command(profile: &SshProfile, jump: Option<&SshProfile>) -> String {
        let mut cmd = String::from("ssh");

        if let Some(port) = profile.port.filter(|p| *p != 22) {
            cmd.push_str(&format!(" -p {}", port));
        }

        if let AuthMethod::PublicKey { private_key_path, .. } = &profile.auth_method {
            cmd.push_str(&format!(" -i {}", private_key_path.display()));
        }

        if let Some(jump) = jump {
            cmd.push_str(&format!(" -J {}@{}", jump.username, format_host(&jump.host)));
            if let Some(port) = jump.port {
                cmd.push_str(&format!(":{}", port));
            }
        }

        cmd.push_str(&format!(" {}@{}", profile.username, format_host(&profile.host)));
        cmd
    }
}

#[derive(Debug)]
struct Endpoint {
    user: Option<String>,
    host: String,
    port: Option<u16>,
}

impl Endpoint {
    /// `[user@]host[:port]`, with IPv6 hosts in brackets
    fn parse(input: &str) -> Result<Self> {
        let (user, rest) = match input.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(SshSessionError::ConfigError(format!("Invalid user@host format: {}", input))),
            None => (None, input),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| SshSessionError::InvalidHost(rest.to_string()))?;
            let port = match after.strip_prefix(':') {
                Some(port) => Some(parse_port(port)?),
                None if after.is_empty() => None,
                None => return Err(SshSessionError::InvalidHost(rest.to_string())),
            };
            (host.to_string(), port)
        } else if rest.matches(':').count() > 1 {
            // Bare IPv6 address, no port
            (rest.to_string(), None)
        } else {
            match rest.split_once(':') {
                Some((host, port)) => (host.to_string(), Some(parse_port(port)?)),
                None => (rest.to_string(), None),
            }
        };

        if host.is_empty() {
            return Err(SshSessionError::InvalidHost(input.to_string()));
        }
        Ok(Self { user, host, port })
    }
}

fn parse_port(value: &str) -> Result<u16> {
    match value.parse::<u16>() {
        Ok(0) => Err(SshSessionError::InvalidPort(0)),
        Ok(port) => Ok(port),
        Err(_) => Err(SshSessionError::ConfigError(format!("Invalid port: {}", value))),
    }
}

fn format_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn display_name(user: &str, host: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{}@{}:{}", user, format_host(host), port),
        None => format!("{}@{}", user, host),
    }
}

fn default_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}
