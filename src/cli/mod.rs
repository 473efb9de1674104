pub mod commands;

pub use commands::{Cli, Commands, PasswordAction};

use anyhow::{anyhow, bail, Context};
use console::style;
use dialoguer::{Confirm, Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use ssh_session_manager::models::{AuthMethod, SshProfile};
use ssh_session_manager::services::config_service::{ConfigService, MemoryProfileStore, ProfileStore, SshSettings};
use ssh_session_manager::services::credential_resolver::{CredentialResolver, CredentialSource};
use ssh_session_manager::services::keyboard_interactive::KeyboardInteractivePrompt;
use ssh_session_manager::services::log_service::LogService;
use ssh_session_manager::services::multiplexer::{SessionContext, SessionMultiplexer};
use ssh_session_manager::services::password_storage::{PasswordStorage, StoredIn};
use ssh_session_manager::services::russh_transport::RusshTransport;
use ssh_session_manager::services::secret_store::{KeychainStore, MemoryStore, SecretStore};
use ssh_session_manager::services::terminal_tab::{CloseCheck, TabEvent, TerminalTab};
use ssh_session_manager::services::validation_service::ValidationService;
use ssh_session_manager::utils::ssh_command_parser::SshCommandParser;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

const MAX_JOURNAL_ENTRIES: usize = 1000;
/// Typed alone on a line, closes the tab
const ESCAPE_CLOSE: &str = "~.";
/// Typed alone on a line, prints the remote working directory
const ESCAPE_PWD: &str = "~pwd";

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(ConfigService::new()?);

    match cli.command {
        Commands::Profiles { json } => list_profiles(&config, json),
        Commands::Add {
            name,
            host,
            port,
            username,
            key,
            passphrase_required,
            keyboard_interactive,
            jump,
            no_reuse,
            warn_on_close,
        } => {
            let mut profile = SshProfile::new(name, host, username).with_reuse_session(!no_reuse);
            profile.port = port;
            profile.warn_on_close = warn_on_close;
            if let Some(key) = key {
                profile.auth_method = AuthMethod::public_key(key, passphrase_required);
            } else if keyboard_interactive {
                profile.auth_method = AuthMethod::KeyboardInteractive;
            }
            if let Some(jump) = jump {
                let jump = find_profile(&config, &jump)?;
                profile.jump_host = Some(jump.id);
            }
            add_profile(&config, profile)
        }
        Commands::Remove { name } => remove_profile(config, &name).await,
        Commands::Connect { target, no_reuse } => connect(config, &target.join(" "), !no_reuse).await,
        Commands::Password { action } => password(config, action).await,
    }
}

fn find_profile(config: &ConfigService, name: &str) -> anyhow::Result<SshProfile> {
    config
        .find_by_name(name)?
        .ok_or_else(|| anyhow!("Profile '{}' not found", name))
}

fn list_profiles(config: &ConfigService, json: bool) -> anyhow::Result<()> {
    let profiles = config.load_profiles()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&profiles)?);
        return Ok(());
    }

    if profiles.is_empty() {
        println!("No saved profiles");
        return Ok(());
    }

    for profile in &profiles {
        let via = profile
            .jump_host
            .and_then(|id| profiles.iter().find(|p| p.id == id))
            .map(|jump| format!(" via {}", jump.name))
            .unwrap_or_default();
        println!(
            "{} - {} [{}]{}",
            style(&profile.name).bold(),
            profile.display_name(),
            profile.auth_method.wire_name(),
            style(via).dim()
        );
    }
    Ok(())
}

fn add_profile(config: &ConfigService, profile: SshProfile) -> anyhow::Result<()> {
    let validator = ValidationService::new();
    validator.validate_profile(&profile)?;
    if let AuthMethod::PublicKey { private_key_path, .. } = &profile.auth_method {
        if let Err(e) = validator.validate_ssh_key(private_key_path) {
            println!("{} {}", style("warning:").yellow(), e);
        }
    }
    validator.check_jump_chain(&profile, config)?;

    if config.find_by_name(&profile.name)?.is_some() {
        bail!("A profile named '{}' already exists", profile.name);
    }

    config.upsert_profile(&profile)?;
    println!("{} Added {}", style("✓").green(), profile.display_name());
    Ok(())
}

async fn remove_profile(config: Arc<ConfigService>, name: &str) -> anyhow::Result<()> {
    let mut profile = find_profile(&config, name)?;

    if let Some(dependent) = config
        .load_profiles()?
        .into_iter()
        .find(|p| p.jump_host == Some(profile.id))
    {
        bail!("'{}' is the jump host of '{}'", profile.name, dependent.name);
    }

    let settings = load_settings(&config)?;
    let storage = password_storage(&settings, config.clone(), keychain(&settings));
    storage.delete_password(&mut profile, None).await?;
    config.delete_profile(profile.id)?;
    println!("{} Removed {}", style("✓").green(), profile.name);
    Ok(())
}

async fn password(config: Arc<ConfigService>, action: PasswordAction) -> anyhow::Result<()> {
    let settings = load_settings(&config)?;
    let storage = password_storage(&settings, config.clone(), keychain(&settings));

    match action {
        PasswordAction::Set { profile, key_passphrase } => {
            let mut profile = find_profile(&config, &profile)?;
            if key_passphrase {
                let key_id = private_key_id(&profile)?;
                let passphrase = Password::new()
                    .with_prompt(format!("Passphrase for {}", key_id))
                    .interact()?;
                storage.save_private_key_passphrase(&key_id, &passphrase).await?;
                println!("{} Saved key passphrase", style("✓").green());
                return Ok(());
            }

            let secret = Password::new()
                .with_prompt(format!("Password for {}", profile.display_name()))
                .with_confirmation("Repeat password", "Passwords do not match")
                .interact()?;
            let stored = storage.save_password(&mut profile, &secret, None).await?;
            let place = match stored {
                StoredIn::Keychain => "the system keychain",
                StoredIn::Profile => "the profile config",
                StoredIn::Vault => bail!("Password went to a vault that is not kept between runs"),
            };
            println!("{} Saved password in {}", style("✓").green(), place);
        }
        PasswordAction::Delete { profile, key_passphrase } => {
            let mut profile = find_profile(&config, &profile)?;
            if key_passphrase {
                storage.delete_private_key_passphrase(&private_key_id(&profile)?).await?;
            } else {
                storage.delete_password(&mut profile, None).await?;
            }
            println!("{} Deleted", style("✓").green());
        }
    }
    Ok(())
}

fn private_key_id(profile: &SshProfile) -> anyhow::Result<String> {
    match &profile.auth_method {
        AuthMethod::PublicKey { private_key_path, .. } => Ok(private_key_path.to_string_lossy().to_string()),
        _ => bail!("'{}' does not use a private key", profile.name),
    }
}

/// Settings the CLI can honour
///
/// The only vault implementation lives in memory, so a CLI process would
/// report secrets as saved and lose them on exit.
fn load_settings(config: &ConfigService) -> anyhow::Result<SshSettings> {
    let settings = config.load_settings()?;
    if settings.vault_enabled {
        bail!(
            "vault_enabled is set in {}, but the command line keeps no vault between runs; \
             set it to false to use the system keychain",
            config.config_dir().join("settings.toml").display()
        );
    }
    Ok(settings)
}

fn keychain(settings: &SshSettings) -> Arc<dyn SecretStore> {
    Arc::new(KeychainStore::new(settings.secret_store_timeout()))
}

fn password_storage(
    settings: &SshSettings,
    profiles: Arc<dyn ProfileStore>,
    keychain: Arc<dyn SecretStore>,
) -> PasswordStorage {
    PasswordStorage::new(keychain, profiles).with_timeout(settings.secret_store_timeout())
}

fn build_multiplexer(settings: SshSettings, profiles: Arc<dyn ProfileStore>) -> SessionMultiplexer {
    let keychain = keychain(&settings);
    let sources = vec![
        CredentialSource::Runtime(Arc::new(MemoryStore::runtime())),
        CredentialSource::Keychain(keychain.clone()),
        CredentialSource::Profile(profiles.clone()),
    ];
    let storage = password_storage(&settings, profiles.clone(), keychain);

    let mut journal = LogService::new(MAX_JOURNAL_ENTRIES);
    if let Some(path) = settings.log_file.clone() {
        journal = journal.with_file(path);
    }

    SessionMultiplexer::new(SessionContext {
        transport: Arc::new(RusshTransport::new(&settings)),
        credentials: Arc::new(CredentialResolver::new(sources).with_timeout(settings.secret_store_timeout())),
        profiles,
        notifier: Arc::new(journal),
        password_storage: Some(Arc::new(storage)),
        settings,
    })
}

/// Saved profile by name, or a quick-connect target with in-memory profiles
fn resolve_target(config: &Arc<ConfigService>, target: &str) -> anyhow::Result<(SshProfile, Arc<dyn ProfileStore>)> {
    if let Some(profile) = config.find_by_name(target)? {
        let store: Arc<dyn ProfileStore> = config.clone();
        return Ok((profile, store));
    }

    let quick = SshCommandParser::parse_command(target)
        .with_context(|| format!("'{}' is neither a saved profile nor a connection string", target))?;
    let mut profiles = config.load_profiles()?;
    profiles.extend(quick.profiles());
    let store: Arc<dyn ProfileStore> = Arc::new(MemoryProfileStore::new(profiles));
    Ok((quick.profile, store))
}

async fn connect(config: Arc<ConfigService>, target: &str, reuse: bool) -> anyhow::Result<()> {
    let settings = load_settings(&config)?;
    let (mut profile, profiles) = resolve_target(&config, target)?;
    if !reuse {
        profile.reuse_session = false;
    }

    let multiplexer = build_multiplexer(settings, profiles);
    let (rows, cols) = console::Term::stdout().size();
    let tab = Arc::new(TerminalTab::new(multiplexer.clone(), profile.clone(), cols as u32, rows as u32));

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("Connecting to {}", profile.display_name()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let mut printer = tokio::spawn(print_events(tab.subscribe(), spinner.clone()));
    let opened = tab.open().await;
    spinner.finish_and_clear();
    if let Err(e) = opened {
        printer.abort();
        multiplexer.shutdown();
        bail!("Could not connect to {}: {}", profile.display_name(), e);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = &mut printer => break,
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == ESCAPE_CLOSE => {
                    if let CloseCheck::Confirm(question) = tab.can_close() {
                        let tab_question = question.clone();
                        let confirmed = tokio::task::spawn_blocking(move || {
                            Confirm::new().with_prompt(tab_question).default(false).interact()
                        })
                        .await??;
                        if !confirmed {
                            continue;
                        }
                    }
                    break;
                }
                Some(line) if line.trim() == ESCAPE_PWD => {
                    println!("{}", tab.working_directory().await);
                }
                Some(line) => tab.write_input(format!("{}\r", line).as_bytes())?,
                None => {
                    // Stdin closed: hand the shell an EOF and let it exit
                    tab.write_input(&[0x04])?;
                    let _ = tokio::time::timeout(Duration::from_secs(5), &mut printer).await;
                    break;
                }
            },
        }
    }

    tab.close();
    multiplexer.shutdown();
    Ok(())
}

/// Write tab output to the terminal and answer prompts on it
async fn print_events(mut events: broadcast::Receiver<TabEvent>, spinner: ProgressBar) {
    loop {
        match events.recv().await {
            Ok(TabEvent::Output(data)) => spinner.suspend(|| {
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(&data);
                let _ = stdout.flush();
            }),
            Ok(TabEvent::Prompt(prompt)) => {
                let bar = spinner.clone();
                let asked = prompt.clone();
                match tokio::task::spawn_blocking(move || bar.suspend(|| ask(&asked))).await {
                    Ok(Ok(answers)) => {
                        if let Err(e) = prompt.respond(answers) {
                            tracing::warn!("Prompt answer rejected: {}", e);
                        }
                    }
                    _ => prompt.cancel(),
                }
            }
            Ok(TabEvent::Closed { explicit }) => {
                tracing::debug!("Tab closed (explicit: {})", explicit);
                break;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn ask(prompt: &KeyboardInteractivePrompt) -> anyhow::Result<Vec<String>> {
    if !prompt.name.is_empty() {
        println!("{}", style(&prompt.name).bold());
    }
    if !prompt.instructions.is_empty() {
        println!("{}", prompt.instructions);
    }

    let mut answers = Vec::with_capacity(prompt.prompts.len());
    for field in &prompt.prompts {
        let label = field.prompt.trim_end().trim_end_matches(':').to_string();
        let answer = if field.echo {
            Input::<String>::new().with_prompt(label).allow_empty(true).interact_text()?
        } else {
            Password::new().with_prompt(label).allow_empty_password(true).interact()?
        };
        answers.push(answer);
    }
    Ok(answers)
}
