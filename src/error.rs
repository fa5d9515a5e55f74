use std::path::PathBuf;

/// error type for treepub operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("permission denied: {0} must run as root")]
    NotPrivileged(String),

    #[error("missing prerequisite: {0}")]
    PrerequisiteMissing(String),

    #[error("missing input file: {0}")]
    MissingInput(PathBuf),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("command failed with exit code {exit_code}: {}", .argv.join(" "))]
    CommandFailed {
        argv: Vec<String>,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("command timed out after {secs}s: {}", .argv.join(" "))]
    Timeout { argv: Vec<String>, secs: u64 },

    #[error("interrupted")]
    Cancelled,

    #[error("failed to publish {destination}: {source}")]
    PublishFailed {
        destination: PathBuf,
        /// backup left on disk for manual recovery, if any
        backup: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error("another run holds the lock at {0}")]
    LockContention(PathBuf),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("cleanup failed at {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// operator-facing classification of an [`Error`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    PrivilegeRequired,
    PrerequisiteMissing,
    ToolInvocationFailed,
    PublishTransactionFailed,
    Interrupted,
    Concurrency,
    Configuration,
    CleanupFailed,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotPrivileged(_) => ErrorKind::PrivilegeRequired,
            Error::PrerequisiteMissing(_) | Error::MissingInput(_) | Error::ToolNotFound(_) => {
                ErrorKind::PrerequisiteMissing
            }
            Error::CommandFailed { .. } | Error::Timeout { .. } => ErrorKind::ToolInvocationFailed,
            Error::Cancelled => ErrorKind::Interrupted,
            Error::PublishFailed { .. } => ErrorKind::PublishTransactionFailed,
            Error::LockContention(_) => ErrorKind::Concurrency,
            Error::UnknownUser(_)
            | Error::InvalidConfig(_)
            | Error::Config(_)
            | Error::ConfigSerialize(_) => ErrorKind::Configuration,
            Error::Cleanup { .. } => ErrorKind::CleanupFailed,
            Error::Io { .. } => ErrorKind::Io,
        }
    }

    /// process exit status for this error
    ///
    /// a failed command propagates its own exit code
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::CommandFailed { exit_code, .. } => (*exit_code).clamp(1, 255) as u8,
            Error::Timeout { .. } => 124,
            Error::Cancelled => 130,
            _ => match self.kind() {
                ErrorKind::PrivilegeRequired => 77,
                ErrorKind::PrerequisiteMissing => 69,
                ErrorKind::PublishTransactionFailed => 74,
                ErrorKind::Concurrency => 75,
                ErrorKind::Configuration => 78,
                _ => 1,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
