use super::config_service::ProfileStore;
use crate::models::SshProfile;
use crate::utils::error::{Result, SshSessionError};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use uuid::Uuid;

/// Service for validating profiles before connecting
pub struct ValidationService;

impl ValidationService {
    pub fn new() -> Self {
        Self
    }

    /// Validate port number range
    pub fn validate_port_range(&self, port: u16) -> Result<()> {
        if port == 0 {
            return Err(SshSessionError::InvalidPort(port));
        }
        Ok(())
    }

    /// Validate host address (IP or hostname)
    pub fn validate_host(&self, host: &str) -> Result<()> {
        if host.is_empty() {
            return Err(SshSessionError::InvalidHost("empty host".to_string()));
        }

        if host.parse::<IpAddr>().is_ok() {
            return Ok(());
        }

        let is_valid_hostname = host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
            && !host.starts_with('-')
            && !host.ends_with('-');

        if is_valid_hostname {
            Ok(())
        } else {
            Err(SshSessionError::InvalidHost(host.to_string()))
        }
    }

    /// Validate SSH private key file
    pub fn validate_ssh_key(&self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(SshSessionError::KeyFileNotFound(path.display().to_string()));
        }

        // On Unix, the key must not be readable by group or others
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;

            if mode & 0o077 != 0 {
                tracing::warn!("SSH key file {:?} has permissions {:o}, should be 600 or 400", path, mode);
                return Err(SshSessionError::KeyFilePermission(format!("{} ({:o})", path.display(), mode)));
            }
        }

        Ok(())
    }

    /// Validate a profile on its own
    pub fn validate_profile(&self, profile: &SshProfile) -> Result<()> {
        self.validate_host(&profile.host)?;

        if let Some(port) = profile.port {
            self.validate_port_range(port)?;
        }

        if profile.username.is_empty() {
            return Err(SshSessionError::ConfigError("Username cannot be empty".to_string()));
        }

        if profile.jump_host == Some(profile.id) {
            return Err(SshSessionError::JumpChainCycle(format!("{} jumps through itself", profile.name)));
        }

        Ok(())
    }

    /// Walk the jump-host references starting at `profile`
    ///
    /// Returns the jump profile ids, nearest first. A reference back to any
    /// profile already in the chain is a `JumpChainCycle`. The walk stops at
    /// a reference that does not resolve; reporting it is left to whoever
    /// tries to connect through it.
    pub fn check_jump_chain(&self, profile: &SshProfile, profiles: &dyn ProfileStore) -> Result<Vec<Uuid>> {
        let mut seen = HashSet::from([profile.id]);
        let mut names = vec![profile.name.clone()];
        let mut chain = Vec::new();
        let mut next = profile.jump_host;

        while let Some(id) = next {
            if !seen.insert(id) {
                let looped = profiles
                    .get_profile(id)?
                    .map(|p| p.name)
                    .unwrap_or_else(|| id.to_string());
                names.push(looped);
                return Err(SshSessionError::JumpChainCycle(names.join(" -> ")));
            }

            let Some(jump) = profiles.get_profile(id)? else {
                break;
            };
            chain.push(id);
            names.push(jump.name.clone());
            next = jump.jump_host;
        }

        Ok(chain)
    }
}

impl Default for ValidationService {
    fn default() -> Self {
        Self::new()
    }
}
