use std::path::PathBuf;

use thiserror::Error;

/// Routing config could not be used for a start attempt.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("config is missing the `{0}` section")]
    MissingSection(&'static str),

    #[error("config section `{0}` is empty")]
    EmptySection(&'static str),
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("core binary not found at {0}")]
    BinaryMissing(PathBuf),

    #[error("permission denied launching {0}")]
    PermissionDenied(PathBuf),

    #[error("working directory unusable: {0}")]
    WorkDir(#[source] std::io::Error),

    #[error("failed to spawn core: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("core exited immediately (code {code:?})")]
    ImmediateExit { code: Option<i32> },

    #[error("no config has been started yet")]
    NoConfig,
}

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("engine unreachable: {0}")]
    Unreachable(String),

    #[error("engine request timed out")]
    Timeout,

    #[error("engine returned {code}: {message}")]
    Status { code: u16, message: String },

    #[error("malformed engine response: {0}")]
    Malformed(String),

    /// The engine accepted the switch but the group did not converge.
    #[error("switch of `{group}` to `{requested}` not applied (now `{actual}`)")]
    SwitchVerificationFailed {
        group: String,
        requested: String,
        actual: String,
    },
}

impl From<hyper::Error> for ControlPlaneError {
    fn from(e: hyper::Error) -> Self {
        ControlPlaneError::Unreachable(e.to_string())
    }
}

impl From<serde_json::Error> for ControlPlaneError {
    fn from(e: serde_json::Error) -> Self {
        ControlPlaneError::Malformed(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SysProxyError {
    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("system proxy is not supported on this platform")]
    Unsupported,

    #[error("timed out applying system proxy")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reason a UI command failed.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    #[error(transparent)]
    SystemProxy(#[from] SysProxyError),

    #[error("core is not running")]
    NotRunning,

    #[error("unknown tray item `{0}`")]
    UnknownMenuItem(String),

    #[error("command `{0}` timed out")]
    Timeout(&'static str),
}

impl CommandError {
    /// Short machine-readable reason for the IPC envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::Start(StartError::InvalidConfig(_)) | CommandError::Config(_) => {
                "ConfigError"
            }
            CommandError::Start(StartError::ImmediateExit { .. }) => "ImmediateExit",
            CommandError::Start(_) => "StartError",
            CommandError::ControlPlane(ControlPlaneError::SwitchVerificationFailed { .. }) => {
                "SwitchVerificationFailed"
            }
            CommandError::ControlPlane(_) => "ControlPlaneError",
            CommandError::SystemProxy(_) => "SystemProxyError",
            CommandError::NotRunning => "NotRunning",
            CommandError::UnknownMenuItem(_) => "UnknownMenuItem",
            CommandError::Timeout(_) => "Timeout",
        }
    }
}
