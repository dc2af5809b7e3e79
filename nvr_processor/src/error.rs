use thiserror::Error;

/// Domain errors raised by command handlers. Every variant maps to a stable
/// `kind` string surfaced in the error ack; none of them escape the
/// dispatch task as anything but a `CommandAck`.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("missing required parameter `{0}`")]
    MissingParam(&'static str),
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParam { name: &'static str, reason: String },
    #[error("invalid model id `{0}`")]
    InvalidModel(String),
    #[error("invalid max_fps {0}; expected a finite value >= 0")]
    InvalidFps(f64),
    #[error("invalid instance id `{0}`")]
    InvalidName(String),
    #[error("no pipeline is installed")]
    NoPipeline,
    #[error("pipeline is already paused")]
    AlreadyPaused,
    #[error("pipeline is not paused")]
    NotPaused,
    #[error("source {0} is already configured")]
    AlreadyPresent(u32),
    #[error("source {0} is not configured")]
    NotPresent(u32),
    #[error("removing source {0} would leave no streams")]
    WouldBeEmpty(u32),
    #[error("another restart is already in progress")]
    RestartInProgress,
    #[error("pipeline restart failed: {0}")]
    RestartFailed(String),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("malformed command payload: {0}")]
    Decode(String),
}

impl CommandError {
    /// Stable identifier published as `error_kind` on acks.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::MissingParam(_) => "MissingParam",
            CommandError::InvalidParam { .. } => "InvalidParam",
            CommandError::InvalidModel(_) => "InvalidModel",
            CommandError::InvalidFps(_) => "InvalidFps",
            CommandError::InvalidName(_) => "InvalidName",
            CommandError::NoPipeline => "NoPipeline",
            CommandError::AlreadyPaused => "AlreadyPaused",
            CommandError::NotPaused => "NotPaused",
            CommandError::AlreadyPresent(_) => "AlreadyPresent",
            CommandError::NotPresent(_) => "NotPresent",
            CommandError::WouldBeEmpty(_) => "WouldBeEmpty",
            CommandError::RestartInProgress => "RestartInProgress",
            CommandError::RestartFailed(_) => "RestartFailed",
            CommandError::UnknownCommand(_) => "UnknownCommand",
            CommandError::Decode(_) => "DecodeError",
        }
    }
}

/// Failures from the pipeline capability.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline construction failed: {0}")]
    Build(String),
    #[error("pipeline start failed: {0}")]
    Start(String),
    #[error("source {source_id} failed to connect: {reason}")]
    SourceConnect { source_id: u32, reason: String },
}

/// Bus transport failures.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker unreachable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },
    #[error("publish to `{topic}` failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("subscribe to `{topic}` failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },
}
