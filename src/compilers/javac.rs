//! Driving `javac` as a forked process.

use crate::{
    compilers::{
        CancelToken, Diagnostic, DiagnosticListener, FileManager, JavaCompiler, Location,
        OptionChecker, Severity,
    },
    error::{JavacError, Result},
};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::PathBuf,
    process::{Command, Output, Stdio},
    time::Duration,
};

/// The name of the `javac` binary on the system.
pub const JAVAC: &str = "javac";

/// How often the wait loop checks the child and the cancellation flag.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Argument lists longer than this are passed through a temporary `@argsfile`.
const ARGSFILE_THRESHOLD: usize = 16 * 1024;

static RE_JAVAC_DIAGNOSTIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<file>[^\s:][^:]*\.java):(?P<line>\d+):\s*(?P<severity>error|warning|Note):\s*(?P<message>.*)$")
        .unwrap()
});

/// Options `javac` accepts, plus the prefixed families checked below.
static KNOWN_OPTIONS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    BTreeSet::from([
        "-g",
        "-g:none",
        "-nowarn",
        "-verbose",
        "-deprecation",
        "-parameters",
        "-Werror",
        "-encoding",
        "-source",
        "-target",
        "--release",
        "--enable-preview",
        "--module-version",
        "-h",
        "-proc:none",
        "-proc:only",
        "-proc:full",
        "-processor",
        "--processor-path",
        "--processor-module-path",
        "-implicit:class",
        "-implicit:none",
        "--add-modules",
        "--limit-modules",
        "--default-module-for-created-files",
    ])
});

/// The platform path-list separator, as used in `-classpath` style values.
pub fn path_separator() -> &'static str {
    if cfg!(windows) {
        ";"
    } else {
        ":"
    }
}

/// Abstraction over the `javac` command line utility.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForkedJavac {
    /// Path to the `javac` executable.
    javac: PathBuf,
}

impl Default for ForkedJavac {
    /// Points at `javac` on the search path.
    fn default() -> Self {
        Self::new(JAVAC)
    }
}

impl ForkedJavac {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { javac: path.into() }
    }

    /// Invokes `javac --version` and returns the reported version, e.g. `21.0.2`.
    pub fn version(&self) -> Result<String> {
        let mut cmd = Command::new(&self.javac);
        cmd.arg("--version").stdin(Stdio::null()).stderr(Stdio::piped()).stdout(Stdio::piped());
        debug!(?cmd, "getting javac version");
        let output = cmd.output().map_err(self.map_io_err())?;
        version_from_output(output)
    }

    fn map_io_err(&self) -> impl FnOnce(io::Error) -> JavacError + '_ {
        move |err| JavacError::io(err, &self.javac)
    }

    fn configure_cmd(&self, arguments: &[String]) -> Result<(Command, Option<tempfile::NamedTempFile>)> {
        let mut cmd = Command::new(&self.javac);
        cmd.stdin(Stdio::null());

        let total: usize = arguments.iter().map(|a| a.len() + 1).sum();
        if total > ARGSFILE_THRESHOLD {
            // long command lines go through an @argsfile, same format as the debug args file
            let mut argsfile =
                tempfile::NamedTempFile::new().map_err(|err| JavacError::io(err, "javac.args"))?;
            for argument in arguments {
                writeln!(argsfile, "{}", quote_argument(argument))
                    .map_err(|err| JavacError::io(err, argsfile.path()))?;
            }
            argsfile.flush().map_err(|err| JavacError::io(err, argsfile.path()))?;
            cmd.arg(format!("@{}", argsfile.path().display()));
            Ok((cmd, Some(argsfile)))
        } else {
            cmd.args(arguments);
            Ok((cmd, None))
        }
    }
}

impl OptionChecker for ForkedJavac {
    fn supports_option(&self, option: &str) -> bool {
        KNOWN_OPTIONS.contains(option)
            || option.starts_with("-X")
            || option.starts_with("-J")
            || option.starts_with("-A")
            || option.starts_with("-g:")
            || option.starts_with("-W")
            || option.starts_with("--add-") && option.contains('=')
    }
}

impl JavaCompiler for ForkedJavac {
    type FileManager = JavacFileManager;

    fn file_manager(&self) -> Result<JavacFileManager> {
        Ok(JavacFileManager::default())
    }

    fn run(
        &self,
        aux: &mut dyn io::Write,
        file_manager: &mut JavacFileManager,
        diagnostics: &dyn DiagnosticListener,
        options: &[String],
        files: &[PathBuf],
        cancel: &CancelToken,
    ) -> Result<bool> {
        let mut arguments = file_manager.to_arguments()?;
        arguments.extend(options.iter().cloned());
        arguments.extend(files.iter().map(|f| f.display().to_string()));

        let (mut cmd, _argsfile) = self.configure_cmd(&arguments)?;

        // child output goes to a temp file; both streams share the file offset so lines
        // interleave the way the terminal would show them
        let capture = tempfile::NamedTempFile::new().map_err(|err| JavacError::io(err, "javac output"))?;
        let stdout = clone_handle(capture.as_file())?;
        let stderr = clone_handle(capture.as_file())?;
        cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));

        debug!(?cmd, sources = files.len(), "invoking javac");
        let mut child = cmd.spawn().map_err(self.map_io_err())?;

        let status = loop {
            if let Some(status) = child.try_wait().map_err(self.map_io_err())? {
                break status;
            }
            if cancel.is_cancelled() {
                warn!("compilation cancelled, terminating javac");
                let _ = child.kill();
                let _ = child.wait();
                let _ = writeln!(aux, "Compilation was interrupted; the compiler process was terminated.");
                append_capture(aux, capture.as_file(), diagnostics)?;
                return Err(JavacError::Interrupted);
            }
            std::thread::sleep(WAIT_POLL);
        };

        append_capture(aux, capture.as_file(), diagnostics)?;
        trace!(%status, "javac finished");
        Ok(status.success())
    }
}

fn clone_handle(file: &File) -> Result<File> {
    file.try_clone().map_err(|err| JavacError::io(err, "javac output"))
}

/// Copies the captured child output to the auxiliary writer and feeds recognizable diagnostic
/// lines to the listener. The child writes in the platform's native encoding, so undecodable
/// bytes are replaced rather than dropped.
fn append_capture(aux: &mut dyn io::Write, capture: &File, diagnostics: &dyn DiagnosticListener) -> Result<()> {
    let mut reader = clone_handle(capture)?;
    reader.seek(SeekFrom::Start(0)).map_err(|err| JavacError::io(err, "javac output"))?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).map_err(|err| JavacError::io(err, "javac output"))?;

    let text = String::from_utf8_lossy(&bytes);
    for line in text.lines() {
        if let Some(captures) = RE_JAVAC_DIAGNOSTIC.captures(line) {
            let severity = match &captures["severity"] {
                "error" => Severity::Error,
                "warning" => Severity::Warning,
                _ => Severity::Note,
            };
            diagnostics.report(Diagnostic {
                severity,
                message: captures["message"].to_string(),
                file: Some(PathBuf::from(&captures["file"])),
                line: captures["line"].parse().ok(),
            });
        }
    }

    aux.write_all(&bytes).map_err(|err| JavacError::io(err, "auxiliary output"))?;
    Ok(())
}

/// Quotes a token for an `@argsfile` when it contains whitespace.
pub fn quote_argument(argument: &str) -> String {
    if argument.chars().any(char::is_whitespace) {
        format!("\"{}\"", argument.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        argument.to_string()
    }
}

fn version_from_output(output: Output) -> Result<String> {
    if !output.status.success() {
        let mut msg = String::from_utf8_lossy(&output.stderr);
        if msg.trim().is_empty() {
            msg = String::from_utf8_lossy(&output.stdout);
        }
        return Err(JavacError::msg(format!("javac exited with {}: {}", output.status, msg.trim())));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .last()
        .map(|l| l.trim_start_matches("javac").trim().to_string())
        .ok_or_else(|| JavacError::msg("version not found in javac output"))
}

/// Accumulates location configuration and renders it as `javac` arguments.
#[derive(Debug, Default)]
pub struct JavacFileManager {
    locations: BTreeMap<Location, Vec<PathBuf>>,
    module_locations: BTreeMap<(Location, String), Vec<PathBuf>>,
}

impl JavacFileManager {
    fn join(paths: &[PathBuf]) -> String {
        paths.iter().map(|p| p.display()).join(path_separator())
    }

    /// Renders the configured locations as command-line arguments, in a stable order.
    pub fn to_arguments(&self) -> Result<Vec<String>> {
        let mut args = Vec::new();

        for (location, paths) in &self.locations {
            if paths.is_empty() {
                continue;
            }
            let flag = match location {
                Location::SourcePath => "--source-path",
                Location::ClassPath => "--class-path",
                Location::ModulePath => "--module-path",
                Location::ClassOutput => "-d",
                Location::SourceOutput => "-s",
                Location::ModuleSourcePath | Location::PatchModulePath => unreachable!(),
            };
            match location {
                Location::ClassOutput | Location::SourceOutput => {
                    let dir = &paths[0];
                    std::fs::create_dir_all(dir).map_err(|err| JavacError::io(err, dir))?;
                    args.push(flag.to_string());
                    args.push(dir.display().to_string());
                }
                _ => {
                    args.push(flag.to_string());
                    args.push(Self::join(paths));
                }
            }
        }

        for ((location, module), paths) in &self.module_locations {
            if paths.is_empty() {
                continue;
            }
            let flag = match location {
                Location::ModuleSourcePath => "--module-source-path",
                Location::PatchModulePath => "--patch-module",
                other => {
                    return Err(JavacError::config(format!(
                        "location {other} cannot be configured for module \"{module}\""
                    )));
                }
            };
            args.push(flag.to_string());
            args.push(format!("{module}={}", Self::join(paths)));
        }

        Ok(args)
    }
}

impl FileManager for JavacFileManager {
    fn set_location(&mut self, location: Location, paths: &[PathBuf]) -> Result<()> {
        if location.is_module_oriented() {
            return Err(JavacError::config(format!("location {location} requires a module")));
        }
        self.locations.insert(location, paths.to_vec());
        Ok(())
    }

    fn set_location_for_module(&mut self, location: Location, module: &str, paths: &[PathBuf]) -> Result<()> {
        if !location.is_module_oriented() {
            return Err(JavacError::config(format!("location {location} is not module-oriented")));
        }
        self.module_locations.insert((location, module.to_string()), paths.to_vec());
        Ok(())
    }
}
