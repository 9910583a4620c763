use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("shape mismatch in {op}: {reason}")]
    ShapeMismatch { op: String, reason: String },
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
    #[error("program must be compiled before it can be evaluated")]
    UncompiledProgram,
    #[error("parameter '{name}': {reason}")]
    Parameter { name: String, reason: String },
    #[error("device call '{call}' failed: {reason}")]
    Device { call: &'static str, reason: String },
    #[error("cannot lower '{op}' for target '{target}': {reason}")]
    Lowering {
        op: String,
        target: String,
        reason: String,
    },
    #[error("instruction @{index} does not exist (program has {len} instructions)")]
    InvalidReference { index: usize, len: usize },
    #[error("storage: {0}")]
    Storage(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ShapeMismatch,
    UnsupportedType,
    UncompiledProgram,
    Parameter,
    Device,
    Lowering,
    Graph,
    Storage,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            Error::UnsupportedType(_) => ErrorKind::UnsupportedType,
            Error::UncompiledProgram => ErrorKind::UncompiledProgram,
            Error::Parameter { .. } => ErrorKind::Parameter,
            Error::Device { .. } => ErrorKind::Device,
            Error::Lowering { .. } => ErrorKind::Lowering,
            Error::InvalidReference { .. } => ErrorKind::Graph,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// True when the failure comes from the environment (device, filesystem)
    /// rather than from how the graph was built or called.
    pub fn is_environment(&self) -> bool {
        matches!(self.kind(), ErrorKind::Device | ErrorKind::Io)
    }

    pub(crate) fn shape(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            op: op.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Parameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn device(call: &'static str, reason: impl Into<String>) -> Self {
        Error::Device {
            call,
            reason: reason.into(),
        }
    }
}
