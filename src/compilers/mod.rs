//! The narrow contract the driver consumes a Java compiler through.
//!
//! Anything beyond configuring locations, checking options and running a compilation task is
//! the compiler's business.

use crate::error::Result;
use std::{
    fmt, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

pub mod javac;
pub use javac::ForkedJavac;

/// A location on the compiler's file manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Location {
    SourcePath,
    ModuleSourcePath,
    ClassPath,
    ModulePath,
    PatchModulePath,
    ClassOutput,
    SourceOutput,
}

impl Location {
    /// Whether this location is configured per module.
    pub fn is_module_oriented(&self) -> bool {
        matches!(self, Location::ModuleSourcePath | Location::PatchModulePath)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Location::SourcePath => "SOURCE_PATH",
            Location::ModuleSourcePath => "MODULE_SOURCE_PATH",
            Location::ClassPath => "CLASS_PATH",
            Location::ModulePath => "MODULE_PATH",
            Location::PatchModulePath => "PATCH_MODULE_PATH",
            Location::ClassOutput => "CLASS_OUTPUT",
            Location::SourceOutput => "SOURCE_OUTPUT",
        };
        f.write_str(name)
    }
}

/// Holds the location configuration of one compilation.
///
/// Implementations hold open resources (search-path handles, caches); the executor releases
/// them on every exit path by dropping the manager.
pub trait FileManager {
    /// Replaces the paths associated with `location`.
    fn set_location(&mut self, location: Location, paths: &[PathBuf]) -> Result<()>;

    /// Replaces the paths associated with `location` for one module.
    fn set_location_for_module(&mut self, location: Location, module: &str, paths: &[PathBuf]) -> Result<()>;
}

/// Validates option tokens the way the underlying tool would.
pub trait OptionChecker {
    fn supports_option(&self, option: &str) -> bool;
}

/// A Java compiler the executor can drive.
///
/// One call of [`run`](Self::run) is one compilation task: the file manager carries the
/// location configuration, `options` the flat token list, `files` the sources of the unit.
/// Returns whether the task succeeded; diagnostics go to `diagnostics`, raw tool output to
/// `aux`.
pub trait JavaCompiler: OptionChecker {
    type FileManager: FileManager;

    /// A fresh file manager for one build.
    fn file_manager(&self) -> Result<Self::FileManager>;

    fn run(
        &self,
        aux: &mut dyn io::Write,
        file_manager: &mut Self::FileManager,
        diagnostics: &dyn DiagnosticListener,
        options: &[String],
        files: &[PathBuf],
        cancel: &CancelToken,
    ) -> Result<bool>;
}

/// Severity of a reported [`Diagnostic`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Note,
    Warning,
    Error,
}

/// A single message reported by the compiler.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
}

impl Diagnostic {
    /// `file:line` rendering of the source location, when known.
    pub fn location(&self) -> Option<String> {
        let file = self.file.as_ref()?;
        Some(match self.line {
            Some(line) => format!("{}:{line}", file.display()),
            None => file.display().to_string(),
        })
    }
}

/// Receives diagnostics while a task runs. Must be safe to call from any thread.
pub trait DiagnosticListener: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);

    /// Invoked once after the final compilation unit of a build.
    fn summary(&self, _errors: usize, _warnings: usize) {}
}

/// A listener that collects everything it receives.
#[derive(Debug, Default)]
pub struct CollectingDiagnostics {
    inner: Mutex<Vec<Diagnostic>>,
}

impl CollectingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.inner.lock().unwrap().clone()
    }

    /// The first error-severity diagnostic, if any was reported.
    pub fn first_error(&self) -> Option<Diagnostic> {
        self.inner.lock().unwrap().iter().find(|d| d.severity == Severity::Error).cloned()
    }

    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        let errors = inner.iter().filter(|d| d.severity == Severity::Error).count();
        let warnings = inner.iter().filter(|d| d.severity == Severity::Warning).count();
        (errors, warnings)
    }
}

impl DiagnosticListener for CollectingDiagnostics {
    fn report(&self, diagnostic: Diagnostic) {
        self.inner.lock().unwrap().push(diagnostic);
    }

    fn summary(&self, errors: usize, warnings: usize) {
        if errors > 0 || warnings > 0 {
            info!("{errors} error(s), {warnings} warning(s)");
        }
    }
}

/// Cooperative cancellation of a running build.
///
/// Cloning shares the flag. Only the forked compiler's wait loop observes it; in-process
/// compilation is not cancellable.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
