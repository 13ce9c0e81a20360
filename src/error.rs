use std::{
    io,
    path::{Path, PathBuf},
};

pub type Result<T, E = JavacError> = std::result::Result<T, E>;

/// Various error types for the build driver.
#[derive(Debug, thiserror::Error)]
pub enum JavacError {
    /// The build configuration is invalid or internally inconsistent.
    ///
    /// These are surfaced verbatim and never downgraded.
    #[error("invalid build configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Io(#[from] JavacIoError),
    /// The incremental cache file exists but could not be understood.
    #[error("incremental build cache is corrupt: {0}")]
    CacheCorrupt(String),
    /// The compiler reported at least one error for a compilation unit.
    #[error("compilation failed: {message}{}", location_suffix(.location))]
    CompilationFailed { message: String, location: Option<String> },
    /// A forked compiler was cancelled before it finished.
    #[error("compilation was interrupted")]
    Interrupted,
    #[error("{0}")]
    Message(String),
}

impl JavacError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        JavacIoError::new(err, path).into()
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        JavacError::Configuration(msg.to_string())
    }

    pub fn msg(msg: impl std::fmt::Display) -> Self {
        JavacError::Message(msg.to_string())
    }
}

fn location_suffix(location: &Option<String>) -> String {
    location.as_deref().map(|l| format!(" ({l})")).unwrap_or_default()
}

/// An `io::Error` tagged with the path it occurred on.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {io}", .path.display())]
pub struct JavacIoError {
    io: io::Error,
    path: PathBuf,
}

impl JavacIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which this error occurred.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn io_error(&self) -> &io::Error {
        &self.io
    }
}

impl From<JavacIoError> for io::Error {
    fn from(err: JavacIoError) -> Self {
        err.io
    }
}
