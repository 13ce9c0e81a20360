//! Scoped swap of a main `module-info.class` with a test-built replacement.
//!
//! Supports the deprecated workflow where a test compilation needs the compiler to see the test
//! view of the module: the main `module-info.class` is renamed aside, the test-built class is
//! moved into its place, and the test `module-info.java` is renamed aside so the compiler does
//! not recompile it unbidden. All three renames are reversed when the swap is released, and a
//! process-exit hook reverses whatever is still applied when the host exits non-locally.

use crate::error::{JavacError, Result};
use once_cell::sync::Lazy;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};

/// Extension appended to the renamed-aside files.
const BACKUP_EXTENSION: &str = "bak";

/// Swaps that are currently applied. [`restore_active_swaps`] walks this from a process-exit
/// handler; entries are weak so a dropped swap never outlives its guard.
static ACTIVE_SWAPS: Lazy<Mutex<Vec<Weak<SwapState>>>> = Lazy::new(|| Mutex::new(Vec::new()));

#[derive(Debug)]
struct SwapState {
    main_class: PathBuf,
    main_backup: PathBuf,
    test_class: PathBuf,
    test_source: PathBuf,
    test_source_backup: PathBuf,
    restored: AtomicBool,
}

impl SwapState {
    /// Reverses the three renames. Safe to call more than once; only the first call acts.
    fn restore(&self) -> Result<()> {
        if self.restored.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        trace!("restoring module-info swap of \"{}\"", self.main_class.display());
        rename(&self.main_class, &self.test_class)?;
        rename(&self.main_backup, &self.main_class)?;
        rename(&self.test_source_backup, &self.test_source)?;
        Ok(())
    }
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|err| JavacError::io(err, from))
}

/// A main `module-info.class` temporarily replaced by its test-built counterpart.
///
/// Acquired before a test compilation, released on [`close`](Self::close) or on drop. The
/// restoration also runs from [`restore_active_swaps`] so an exit handler can clean up after an
/// aborted build; running both is harmless.
#[derive(Debug)]
pub struct ModuleInfoOverwrite {
    state: Arc<SwapState>,
}

impl ModuleInfoOverwrite {
    /// Applies the swap:
    ///
    /// 1. `main/module-info.class` -> `main/module-info.class.bak`
    /// 2. `test/module-info.class` -> `main/module-info.class`
    /// 3. `test-src/module-info.java` -> `test-src/module-info.java.bak`
    pub fn apply(
        main_class: impl Into<PathBuf>,
        test_class: impl Into<PathBuf>,
        test_source: impl Into<PathBuf>,
    ) -> Result<Self> {
        let main_class = main_class.into();
        let test_class = test_class.into();
        let test_source = test_source.into();
        let main_backup = append_extension(&main_class);
        let test_source_backup = append_extension(&test_source);

        debug!(
            "swapping \"{}\" with test-built \"{}\"",
            main_class.display(),
            test_class.display()
        );
        rename(&main_class, &main_backup)?;
        if let Err(err) = rename(&test_class, &main_class) {
            // first rename must be undone before reporting, otherwise the tree is left broken
            let _ = rename(&main_backup, &main_class);
            return Err(err);
        }
        if let Err(err) = rename(&test_source, &test_source_backup) {
            let _ = rename(&main_class, &test_class);
            let _ = rename(&main_backup, &main_class);
            return Err(err);
        }

        let state = Arc::new(SwapState {
            main_class,
            main_backup,
            test_class,
            test_source,
            test_source_backup,
            restored: AtomicBool::new(false),
        });

        register_exit_hook();
        let mut active = ACTIVE_SWAPS.lock().unwrap();
        active.retain(|w| w.strong_count() > 0);
        active.push(Arc::downgrade(&state));

        Ok(Self { state })
    }

    /// Releases the swap, restoring all three renames.
    pub fn close(&self) -> Result<()> {
        self.state.restore()
    }
}

impl Drop for ModuleInfoOverwrite {
    fn drop(&mut self) {
        if let Err(err) = self.state.restore() {
            error!("failed to restore module-info swap: {err}");
        }
    }
}

/// Restores every swap still applied. Runs from the registered exit hook; callers installing
/// their own signal handling may also invoke it directly. Swaps already released are skipped.
pub fn restore_active_swaps() {
    let Ok(mut active) = ACTIVE_SWAPS.lock() else { return };
    for state in active.drain(..).filter_map(|w| w.upgrade()) {
        if let Err(err) = state.restore() {
            error!("failed to restore module-info swap: {err}");
        }
    }
}

/// Installs the `atexit` callback, once per process. `Drop` covers unwinding and normal
/// returns; the hook covers `std::process::exit` and libc-mediated terminations.
#[cfg(unix)]
fn register_exit_hook() {
    use std::sync::Once;

    extern "C" fn restore_on_exit() {
        restore_active_swaps();
    }

    static HOOK: Once = Once::new();
    HOOK.call_once(|| unsafe {
        let _ = libc::atexit(restore_on_exit);
    });
}

#[cfg(not(unix))]
fn register_exit_hook() {}

fn append_extension(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(BACKUP_EXTENSION);
    PathBuf::from(name)
}
