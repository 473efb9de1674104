// Services module
pub mod config_service;
pub mod credential_resolver;
pub mod keyboard_interactive;
pub mod log_service;
pub mod multiplexer;
pub mod password_storage;
pub mod russh_transport;
pub mod secret_store;
pub mod shell_session;
pub mod ssh_session;
pub mod terminal_tab;
pub mod transport;
pub mod validation_service;
