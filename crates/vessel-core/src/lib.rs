//! Lifecycle orchestration for Vessel containers.
//!
//! This crate ties the configuration layers, host state, and runtime
//! collaborators together into the `Orchestrator`: create, mount, start,
//! stop, restart, set, checkpoint/restore, snapshot, convert and destroy,
//! each gated on freshly observed container state and undone on partial
//! failure. It also provides the network binder, the extension module
//! registry, per-container locking, and the error taxonomy with its fixed
//! exit codes.

pub mod checkpoint;
pub mod concurrency;
pub mod context;
pub mod create;
pub mod destroy;
pub mod engine;
pub mod guest;
pub mod lifecycle;
pub mod modules;
pub mod network;
pub mod rollback;
pub mod set;
pub mod snapshot;

pub use concurrency::{install_signal_handler, shutdown_requested, ContainerLock};
pub use context::{Collaborators, Context};
pub use create::CreateOptions;
pub use engine::{Orchestrator, StartOptions, Status, StopOptions};
pub use lifecycle::{classify, validate_transition, LifecycleState, Observation, Transition};
pub use modules::{BindMountModule, ExtensionModule, ModuleContext, ModuleOption, ModuleRegistry};
pub use network::{generate_mac, IpOp, NetworkBinder};
pub use rollback::RollbackLog;
pub use set::{SetMode, SetOptions, SetOutcome};

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use vessel_runtime::RuntimeError;
use vessel_schema::{ConfigError, ContainerId};
use vessel_store::StoreError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("container {id} is locked by {holder}")]
    Locked { id: ContainerId, holder: String },
    #[error("container {0} does not exist")]
    NotExist(ContainerId),
    #[error("container {0} already exists")]
    AlreadyExists(ContainerId),
    #[error("container {0} is not running")]
    NotRunning(ContainerId),
    #[error("container {0} is already running")]
    AlreadyRunning(ContainerId),
    #[error("container {0} is not mounted")]
    NotMounted(ContainerId),
    #[error("container {0} is mounted; unmount it first")]
    AlreadyMounted(ContainerId),
    #[error("private area {} does not exist", .0.display())]
    NoPrivate(PathBuf),
    #[error("{}", unsafe_message(*.id, .fields))]
    UnsafeWhileRunning { id: ContainerId, fields: Vec<String> },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("module {module}: {message}")]
    Module { module: String, message: String },
}

fn unsafe_message(id: ContainerId, fields: &[String]) -> String {
    format!(
        "cannot change {} while container {id} is running",
        fields.join(", ")
    )
}

/// Error classes, each with a fixed process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Success,
    SystemError,
    ResourceError,
    ExecutionError,
    Locked,
    ConfigError,
    NotExist,
    TimeoutError,
    CheckpointError,
    RestoreError,
    InvalidParameterSyntax,
    InvalidParameterValue,
    NotRunning,
    AlreadyRunning,
    NetworkError,
    NotMounted,
    AlreadyMounted,
    NoPrivate,
    PrivateExists,
    TemplateError,
    MountError,
    UmountError,
    ImageError,
    QuotaError,
    ModuleError,
    ActionScriptError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 26] = [
        Self::Success,
        Self::SystemError,
        Self::ResourceError,
        Self::ExecutionError,
        Self::Locked,
        Self::ConfigError,
        Self::NotExist,
        Self::TimeoutError,
        Self::CheckpointError,
        Self::RestoreError,
        Self::InvalidParameterSyntax,
        Self::InvalidParameterValue,
        Self::NotRunning,
        Self::AlreadyRunning,
        Self::NetworkError,
        Self::NotMounted,
        Self::AlreadyMounted,
        Self::NoPrivate,
        Self::PrivateExists,
        Self::TemplateError,
        Self::MountError,
        Self::UmountError,
        Self::ImageError,
        Self::QuotaError,
        Self::ModuleError,
        Self::ActionScriptError,
    ];

    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::SystemError => 3,
            Self::ResourceError => 4,
            Self::ExecutionError => 5,
            Self::Locked => 9,
            Self::ConfigError => 10,
            Self::NotExist => 11,
            Self::TimeoutError => 15,
            Self::CheckpointError => 16,
            Self::RestoreError => 17,
            Self::InvalidParameterSyntax => 20,
            Self::InvalidParameterValue => 21,
            Self::NotRunning => 31,
            Self::AlreadyRunning => 32,
            Self::NetworkError => 34,
            Self::NotMounted => 40,
            Self::AlreadyMounted => 41,
            Self::NoPrivate => 43,
            Self::PrivateExists => 44,
            Self::TemplateError => 47,
            Self::MountError => 50,
            Self::UmountError => 51,
            Self::ImageError => 52,
            Self::QuotaError => 60,
            Self::ModuleError => 70,
            Self::ActionScriptError => 79,
        }
    }
}

fn config_kind(e: &ConfigError) -> ErrorKind {
    match e {
        ConfigError::Io(_) | ConfigError::NoConfig(_) => ErrorKind::ConfigError,
        ConfigError::InvalidValue { .. } => ErrorKind::InvalidParameterValue,
        ConfigError::InvalidSyntax(_) => ErrorKind::InvalidParameterSyntax,
        ConfigError::Resource(_) => ErrorKind::ResourceError,
    }
}

fn runtime_kind(e: &RuntimeError) -> ErrorKind {
    match e {
        RuntimeError::Io(_) | RuntimeError::BackendUnavailable(_) => ErrorKind::SystemError,
        RuntimeError::Config(c) => config_kind(c),
        RuntimeError::NotRunning(_) => ErrorKind::NotRunning,
        RuntimeError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
        RuntimeError::ExecFailed(_) => ErrorKind::ExecutionError,
        RuntimeError::Timeout { .. } => ErrorKind::TimeoutError,
        RuntimeError::Checkpoint(_) => ErrorKind::CheckpointError,
        RuntimeError::Restore(_) => ErrorKind::RestoreError,
        RuntimeError::Mount(_) => ErrorKind::MountError,
        RuntimeError::Umount(_) => ErrorKind::UmountError,
        RuntimeError::Quota(_) => ErrorKind::QuotaError,
        RuntimeError::Image(_) => ErrorKind::ImageError,
        RuntimeError::Network(_) => ErrorKind::NetworkError,
        RuntimeError::Script { .. } => ErrorKind::ActionScriptError,
    }
}

fn store_kind(e: &StoreError) -> ErrorKind {
    match e {
        StoreError::Io(_) => ErrorKind::SystemError,
        StoreError::Config(c) => config_kind(c),
        StoreError::SampleNotFound(_) => ErrorKind::ConfigError,
        StoreError::TemplateNotFound(_) | StoreError::Template(_) => ErrorKind::TemplateError,
        StoreError::PrivateExists(_) => ErrorKind::PrivateExists,
        StoreError::NameConflict { .. } => ErrorKind::InvalidParameterValue,
        StoreError::NameNotFound(_) => ErrorKind::NotExist,
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(e) => config_kind(e),
            Self::Store(e) => store_kind(e),
            Self::Runtime(e) => runtime_kind(e),
            Self::Io(_) | Self::Serialization(_) => ErrorKind::SystemError,
            Self::Locked { .. } => ErrorKind::Locked,
            Self::NotExist(_) => ErrorKind::NotExist,
            Self::AlreadyExists(_) => ErrorKind::PrivateExists,
            Self::NotRunning(_) => ErrorKind::NotRunning,
            Self::AlreadyRunning(_) | Self::UnsafeWhileRunning { .. } => ErrorKind::AlreadyRunning,
            Self::NotMounted(_) => ErrorKind::NotMounted,
            Self::AlreadyMounted(_) => ErrorKind::AlreadyMounted,
            Self::NoPrivate(_) => ErrorKind::NoPrivate,
            Self::InvalidParameter(_) => ErrorKind::InvalidParameterValue,
            Self::Unsupported(_) => ErrorKind::ImageError,
            Self::Module { .. } => ErrorKind::ModuleError,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }
}
