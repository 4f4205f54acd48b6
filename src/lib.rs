pub mod config;
pub mod crypto;
pub mod database;
pub mod extender;
pub mod logging;
pub mod modules;
pub mod protocol;
pub mod server;
pub mod tasks;

pub use config::ServerConfig;
pub use server::Teamserver;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UmbraError {
    #[error("agent {0} not found")]
    AgentNotFound(String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("module {0} not found")]
    ModuleNotFound(String),

    #[error("listener {0} not found")]
    ListenerNotFound(String),

    #[error("function {0} is not supported")]
    NotSupported(&'static str),

    #[error("task {0} in process")]
    TaskInProcess(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, UmbraError>;
