use crate::models::SshProfile;
use crate::utils::error::{Result, SshSessionError};
use directories::ProjectDirs;
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Read/write access to saved profiles
///
/// The session layer reads jump-host references through it and the
/// password policy writes the plaintext fallback field back.
pub trait ProfileStore: Send + Sync {
    fn get_profile(&self, id: Uuid) -> Result<Option<SshProfile>>;

    fn list_profiles(&self) -> Result<Vec<SshProfile>>;

    /// Insert or replace by id
    fn save_profile(&self, profile: &SshProfile) -> Result<()>;
}

/// Service for managing configuration persistence
pub struct ConfigService {
    config_dir: PathBuf,
}

impl ConfigService {
    /// Create a new config service with default directory
    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_dir()?;

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
            tracing::info!("Created config directory: {:?}", config_dir);

            // Set permissions to 0700 on Unix
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = fs::metadata(&config_dir)?.permissions();
                perms.set_mode(0o700);
                fs::set_permissions(&config_dir, perms)?;
            }
        }

        Ok(Self { config_dir })
    }

    /// Create a config service with custom directory
    pub fn with_dir(config_dir: PathBuf) -> Result<Self> {
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
        }
        Ok(Self { config_dir })
    }

    fn get_config_dir() -> Result<PathBuf> {
        ProjectDirs::from("com", "ssh-session-manager", "ssh-session-manager")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or_else(|| SshSessionError::ConfigError("Failed to get config directory".to_string()))
    }

    fn profiles_file(&self) -> PathBuf {
        self.config_dir.join("profiles.toml")
    }

    fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.toml")
    }

    /// Load all profiles
    pub fn load_profiles(&self) -> Result<Vec<SshProfile>> {
        let path = self.profiles_file();

        if !path.exists() {
            tracing::info!("No profiles file found, returning empty list");
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)?;
        let config: ProfilesConfig = toml::from_str(&content)
            .map_err(|e| SshSessionError::ConfigError(format!("Failed to parse profiles: {}", e)))?;

        tracing::debug!("Loaded {} profiles", config.profiles.len());
        Ok(config.profiles)
    }

    /// Save all profiles
    pub fn save_profiles(&self, profiles: &[SshProfile]) -> Result<()> {
        let config = ProfilesConfig {
            profiles: profiles.to_vec(),
        };

        let content = toml::to_string_pretty(&config)
            .map_err(|e| SshSessionError::ConfigError(format!("Failed to serialize profiles: {}", e)))?;

        let path = self.profiles_file();
        fs::write(&path, content)?;

        tracing::info!("Saved {} profiles to {:?}", profiles.len(), path);
        Ok(())
    }

    /// Save a single profile (update or create)
    pub fn upsert_profile(&self, profile: &SshProfile) -> Result<()> {
        let mut profiles = self.load_profiles()?;

        if let Some(pos) = profiles.iter().position(|p| p.id == profile.id) {
            profiles[pos] = profile.clone();
            tracing::info!("Updated profile: {}", profile.name);
        } else {
            profiles.push(profile.clone());
            tracing::info!("Added new profile: {}", profile.name);
        }

        self.save_profiles(&profiles)
    }

    /// Delete a profile by ID
    pub fn delete_profile(&self, id: Uuid) -> Result<bool> {
        let mut profiles = self.load_profiles()?;
        let original_len = profiles.len();

        profiles.retain(|p| p.id != id);

        if profiles.len() < original_len {
            self.save_profiles(&profiles)?;
            tracing::info!("Deleted profile with ID: {}", id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Find a profile by name (case-insensitive)
    pub fn find_by_name(&self, name: &str) -> Result<Option<SshProfile>> {
        Ok(self
            .load_profiles()?
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name)))
    }

    /// Load settings, defaults when no file exists
    pub fn load_settings(&self) -> Result<SshSettings> {
        let path = self.settings_file();

        if !path.exists() {
            tracing::info!("No settings file found, using defaults");
            return Ok(SshSettings::default());
        }

        let content = fs::read_to_string(&path)?;
        let settings: SshSettings = toml::from_str(&content)
            .map_err(|e| SshSessionError::ConfigError(format!("Failed to parse settings: {}", e)))?;

        Ok(settings)
    }

    pub fn save_settings(&self, settings: &SshSettings) -> Result<()> {
        let content = toml::to_string_pretty(settings)
            .map_err(|e| SshSessionError::ConfigError(format!("Failed to serialize settings: {}", e)))?;

        let path = self.settings_file();
        fs::write(&path, content)?;

        tracing::info!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Get the config directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

impl ProfileStore for ConfigService {
    fn get_profile(&self, id: Uuid) -> Result<Option<SshProfile>> {
        Ok(self.load_profiles()?.into_iter().find(|p| p.id == id))
    }

    fn list_profiles(&self) -> Result<Vec<SshProfile>> {
        self.load_profiles()
    }

    fn save_profile(&self, profile: &SshProfile) -> Result<()> {
        self.upsert_profile(profile)
    }
}

/// Profiles held in memory, for quick-connect targets that are never saved
#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<Vec<SshProfile>>,
}

impl MemoryProfileStore {
    pub fn new(profiles: Vec<SshProfile>) -> Self {
        Self {
            profiles: RwLock::new(profiles),
        }
    }
}

impl ProfileStore for MemoryProfileStore {
    fn get_profile(&self, id: Uuid) -> Result<Option<SshProfile>> {
        Ok(self.profiles.read().iter().find(|p| p.id == id).cloned())
    }

    fn list_profiles(&self) -> Result<Vec<SshProfile>> {
        Ok(self.profiles.read().clone())
    }

    fn save_profile(&self, profile: &SshProfile) -> Result<()> {
        let mut profiles = self.profiles.write();
        match profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile.clone(),
            None => profiles.push(profile.clone()),
        }
        Ok(())
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ProfilesConfig {
    #[serde(default)]
    profiles: Vec<SshProfile>,
}

/// Session manager settings
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SshSettings {
    /// Ask before closing a tab with a live shell
    #[serde(default)]
    pub warn_on_close: bool,

    #[serde(default = "default_true")]
    pub verify_host_keys: bool,

    /// Keep secrets in the vault instead of the OS keychain
    #[serde(default)]
    pub vault_enabled: bool,

    #[serde(default = "default_secret_store_timeout_ms")]
    pub secret_store_timeout_ms: u64,

    #[serde(default = "default_cwd_probe_timeout_ms")]
    pub cwd_probe_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Password prompts before giving up on a host
    #[serde(default = "default_max_password_prompts")]
    pub max_password_prompts: u32,

    /// Append the session journal to this file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_secret_store_timeout_ms() -> u64 {
    3000
}

fn default_cwd_probe_timeout_ms() -> u64 {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_max_password_prompts() -> u32 {
    3
}

impl SshSettings {
    pub fn secret_store_timeout(&self) -> Duration {
        Duration::from_millis(self.secret_store_timeout_ms)
    }

    pub fn cwd_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.cwd_probe_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            warn_on_close: false,
            verify_host_keys: default_true(),
            vault_enabled: false,
            secret_store_timeout_ms: default_secret_store_timeout_ms(),
            cwd_probe_timeout_ms: default_cwd_probe_timeout_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            max_password_prompts: default_max_password_prompts(),
            log_file: None,
        }
    }
}
