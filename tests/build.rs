//! End-to-end build scenarios driven through a mock in-process compiler.

use javac_driver::{
    cache::{CacheLoad, IncrementalCache},
    classfile,
    compilers::{CancelToken, DiagnosticListener, FileManager, JavaCompiler, Location, OptionChecker, Severity},
    BuildConfig, Diagnostic, JavacError, Options, Release, SourceDirectory,
};
use pretty_assertions::assert_eq;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
    thread,
    time::Duration,
};

/// A compiler that mirrors `.java` inputs into `.class` outputs and records every invocation.
#[derive(Default)]
struct MockCompiler {
    invocations: Mutex<Vec<Invocation>>,
    /// When set, every task fails after reporting this error message.
    fail_with: Option<String>,
    /// Bytes written for `module-info.class` outputs instead of the empty marker.
    module_info_bytes: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
struct Invocation {
    options: Vec<String>,
    files: Vec<PathBuf>,
    locations: BTreeMap<String, Vec<PathBuf>>,
}

impl Invocation {
    fn location(&self, key: &str) -> &[PathBuf] {
        self.locations.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Default)]
struct MockFileManager {
    locations: BTreeMap<String, Vec<PathBuf>>,
    module_roots: Vec<(String, Vec<PathBuf>)>,
    source_roots: Vec<PathBuf>,
    output: Option<PathBuf>,
}

impl FileManager for MockFileManager {
    fn set_location(&mut self, location: Location, paths: &[PathBuf]) -> javac_driver::Result<()> {
        if location == Location::ClassOutput {
            self.output = paths.first().cloned();
        }
        if location == Location::SourcePath {
            self.source_roots = paths.to_vec();
        }
        self.locations.insert(location.to_string(), paths.to_vec());
        Ok(())
    }

    fn set_location_for_module(&mut self, location: Location, module: &str, paths: &[PathBuf]) -> javac_driver::Result<()> {
        if location == Location::ModuleSourcePath {
            self.module_roots.retain(|(m, _)| m != module);
            self.module_roots.push((module.to_string(), paths.to_vec()));
        }
        self.locations.insert(format!("{location}[{module}]"), paths.to_vec());
        Ok(())
    }
}

impl OptionChecker for MockCompiler {
    fn supports_option(&self, _option: &str) -> bool {
        true
    }
}

impl JavaCompiler for MockCompiler {
    type FileManager = MockFileManager;

    fn file_manager(&self) -> javac_driver::Result<MockFileManager> {
        Ok(MockFileManager::default())
    }

    fn run(
        &self,
        aux: &mut dyn std::io::Write,
        file_manager: &mut MockFileManager,
        diagnostics: &dyn DiagnosticListener,
        options: &[String],
        files: &[PathBuf],
        _cancel: &CancelToken,
    ) -> javac_driver::Result<bool> {
        self.invocations.lock().unwrap().push(Invocation {
            options: options.to_vec(),
            files: files.to_vec(),
            locations: file_manager.locations.clone(),
        });

        if let Some(message) = &self.fail_with {
            writeln!(aux, "1 error").ok();
            diagnostics.report(Diagnostic {
                severity: Severity::Error,
                message: message.clone(),
                file: files.first().cloned(),
                line: Some(1),
            });
            return Ok(false);
        }

        let output = file_manager.output.clone().expect("CLASS_OUTPUT configured");
        for file in files {
            let (root, module) = owning_root(file_manager, file);
            let relative = file.strip_prefix(&root).expect("file under a configured root");
            let mut out = match &module {
                Some(module) => output.join(module).join(relative),
                None => output.join(relative),
            };
            out.set_extension("class");
            fs::create_dir_all(out.parent().unwrap()).unwrap();
            let is_module_info = file.file_stem().is_some_and(|s| s == "module-info");
            match (&self.module_info_bytes, is_module_info) {
                (Some(bytes), true) => fs::write(&out, bytes).unwrap(),
                _ => fs::write(&out, b"\xCA\xFE\xBA\xBE").unwrap(),
            }
        }
        writeln!(aux, "compiled {} files", files.len()).ok();
        Ok(true)
    }
}

fn owning_root(file_manager: &MockFileManager, file: &Path) -> (PathBuf, Option<String>) {
    for (module, roots) in &file_manager.module_roots {
        for root in roots {
            if file.starts_with(root) {
                return (root.clone(), Some(module.clone()));
            }
        }
    }
    for root in &file_manager.source_roots {
        if file.starts_with(root) {
            return (root.clone(), None);
        }
    }
    panic!("no configured root owns {}", file.display());
}

struct Workspace {
    _tmp: tempfile::TempDir,
    src: PathBuf,
    out: PathBuf,
}

impl Workspace {
    fn new(files: &[&str]) -> Self {
        let tmp = tempfile::Builder::new().prefix("javac-driver").tempdir().unwrap();
        let src = tmp.path().join("src");
        let out = tmp.path().join("out");
        fs::create_dir_all(&src).unwrap();
        for file in files {
            let path = src.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, format!("// {file}\n")).unwrap();
        }
        Self { _tmp: tmp, src, out }
    }

    fn config(&self) -> BuildConfig {
        BuildConfig::builder(&self.out).sources(&self.src).build()
    }

    fn build(&self, config: &BuildConfig, compiler: &MockCompiler, options: &Options) -> javac_driver::Result<bool> {
        let mut executor = config.executor()?;
        if !executor.apply_incremental_build(options)? {
            return Ok(false);
        }
        let mut aux = Vec::new();
        executor.compile(compiler, options, &mut aux)?;
        Ok(true)
    }
}

fn file_names(paths: &[PathBuf]) -> Vec<String> {
    let mut names: Vec<String> =
        paths.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
    names.sort();
    names
}

#[test]
fn first_build_compiles_everything_and_writes_state() {
    let ws = Workspace::new(&["a.java", "b.java", "c.java"]);
    let config = ws.config();
    let compiler = MockCompiler::default();
    let mut options = Options::new();
    options.add_unchecked("-parameters");

    assert!(ws.build(&config, &compiler, &options).unwrap());

    let invocations = compiler.invocations.lock().unwrap();
    assert_eq!(invocations.len(), 1);
    assert_eq!(file_names(&invocations[0].files), ["a.java", "b.java", "c.java"]);

    for class in ["a.class", "b.class", "c.class"] {
        assert!(ws.out.join(class).is_file(), "{class} missing");
    }

    match IncrementalCache::load(&config.cache_path) {
        CacheLoad::Loaded(cache) => {
            assert_eq!(cache.files.len(), 3);
            assert_eq!(cache.options_fingerprint, options.fingerprint());
        }
        other => panic!("expected written state, got {other:?}"),
    }
    assert!(ws.out.join("javac.args").is_file());
}

#[test]
fn unchanged_rebuild_has_nothing_to_do() {
    let ws = Workspace::new(&["a.java", "b.java", "c.java"]);
    let config = ws.config();
    let compiler = MockCompiler::default();
    let options = Options::new();

    assert!(ws.build(&config, &compiler, &options).unwrap());
    let state_before = fs::read(&config.cache_path).unwrap();

    assert!(!ws.build(&config, &compiler, &options).unwrap());
    assert_eq!(compiler.invocations.lock().unwrap().len(), 1);
    assert_eq!(fs::read(&config.cache_path).unwrap(), state_before);
}

#[test]
fn modified_file_recompiles_alone() {
    let ws = Workspace::new(&["a.java", "b.java", "c.java"]);
    let config = ws.config();
    let compiler = MockCompiler::default();
    let options = Options::new();

    assert!(ws.build(&config, &compiler, &options).unwrap());

    // make sure the rewritten mtime lands outside the (zero) stale window
    thread::sleep(Duration::from_millis(20));
    fs::write(ws.src.join("b.java"), "// modified\n").unwrap();

    assert!(ws.build(&config, &compiler, &options).unwrap());
    let invocations = compiler.invocations.lock().unwrap();
    assert_eq!(invocations.len(), 2);
    assert_eq!(file_names(&invocations[1].files), ["b.java"]);

    // the persisted state reflects the new mtime for b and the old ones for a and c
    let CacheLoad::Loaded(cache) = IncrementalCache::load(&config.cache_path) else { panic!() };
    let mtime_of = |name: &str| cache.files.iter().find(|(p, _)| p.ends_with(name)).unwrap().1.last_modified;
    assert!(mtime_of("b.java") > mtime_of("a.java"));
    assert_eq!(mtime_of("a.java"), mtime_of("c.java"));
}

#[test]
fn removed_file_forces_full_rebuild_and_cleans_outputs() {
    let ws = Workspace::new(&["a.java", "b.java", "c.java"]);
    let config = ws.config();
    let compiler = MockCompiler::default();
    let options = Options::new();

    assert!(ws.build(&config, &compiler, &options).unwrap());
    // nested-class outputs of c
    fs::write(ws.out.join("c$Inner.class"), b"x").unwrap();
    fs::write(ws.out.join("c$1.class"), b"x").unwrap();

    fs::remove_file(ws.src.join("c.java")).unwrap();

    assert!(ws.build(&config, &compiler, &options).unwrap());
    let invocations = compiler.invocations.lock().unwrap();
    assert_eq!(invocations.len(), 2);
    assert_eq!(file_names(&invocations[1].files), ["a.java", "b.java"]);

    assert!(!ws.out.join("c.class").exists());
    assert!(!ws.out.join("c$Inner.class").exists());
    assert!(!ws.out.join("c$1.class").exists());

    let CacheLoad::Loaded(cache) = IncrementalCache::load(&config.cache_path) else { panic!() };
    assert_eq!(cache.files.len(), 2);
    assert!(cache.files.keys().all(|p| !p.ends_with("c.java")));
}

#[test]
fn multi_release_modular_patches_earlier_outputs() {
    let tmp = tempfile::Builder::new().prefix("javac-driver").tempdir().unwrap();
    let base = tmp.path().join("src-17");
    let next = tmp.path().join("src-21");
    let out = tmp.path().join("out");
    fs::create_dir_all(base.join("p")).unwrap();
    fs::create_dir_all(next.join("p")).unwrap();
    fs::write(base.join("module-info.java"), "module m {\n}\n").unwrap();
    fs::write(base.join("p/A.java"), "// base\n").unwrap();
    fs::write(next.join("p/A.java"), "// next\n").unwrap();

    let config = BuildConfig::builder(&out)
        .source_directory(SourceDirectory::new(&base, &out).with_release(Release::Java17))
        .source_directory(SourceDirectory::new(&next, &out).with_module("m").with_release(Release::Java21))
        .build();

    let compiler = MockCompiler::default();
    let options = Options::new();
    let mut executor = config.executor().unwrap();
    assert!(executor.apply_incremental_build(&options).unwrap());
    let mut aux = Vec::new();
    executor.compile(&compiler, &options, &mut aux).unwrap();

    let invocations = compiler.invocations.lock().unwrap();
    assert_eq!(invocations.len(), 2);

    // base release compiles straight into the output directory
    let canonical_base = base.canonicalize().unwrap();
    let canonical_next = next.canonicalize().unwrap();
    assert_eq!(invocations[0].location("CLASS_OUTPUT"), [out.clone()]);
    assert_eq!(invocations[0].location("MODULE_SOURCE_PATH[m]"), [canonical_base.clone()]);
    assert_eq!(invocations[0].options, ["--release", "17"]);
    assert!(out.join("m/A.class").is_file());

    // the next release patches its own sources plus the base outputs into m
    let versioned = out.join("META-INF/versions-modular/21");
    assert_eq!(invocations[1].location("CLASS_OUTPUT"), [versioned.clone()]);
    assert_eq!(invocations[1].location("PATCH_MODULE_PATH[m]"), [canonical_next.clone(), out.join("m")]);
    assert_eq!(invocations[1].location("MODULE_PATH"), [out.clone()]);
    assert_eq!(invocations[1].options, ["--release", "21"]);
    assert!(versioned.join("m/A.class").is_file());
}

#[test]
fn compilation_failure_carries_first_diagnostic_and_args_file() {
    let ws = Workspace::new(&["a.java"]);
    let config = ws.config();
    let compiler = MockCompiler { fail_with: Some("cannot find symbol".to_string()), ..Default::default() };
    let options = Options::new();

    let mut executor = config.executor().unwrap();
    assert!(executor.apply_incremental_build(&options).unwrap());
    let mut aux = Vec::new();
    let err = executor.compile(&compiler, &options, &mut aux).unwrap_err();

    match err {
        JavacError::CompilationFailed { message, location } => {
            assert_eq!(message, "cannot find symbol");
            assert!(location.unwrap().ends_with("a.java:1"));
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(String::from_utf8(aux).unwrap().contains("1 error"));
    // the failed invocation stays reproducible from a shell
    let args = fs::read_to_string(ws.out.join("javac.args")).unwrap();
    assert!(args.lines().any(|l| l.ends_with("a.java")));
}

#[test]
fn mixing_modular_and_plain_roots_is_fatal() {
    let tmp = tempfile::Builder::new().prefix("javac-driver").tempdir().unwrap();
    let modular = tmp.path().join("modular");
    let plain = tmp.path().join("plain");
    let out = tmp.path().join("out");
    fs::create_dir_all(&modular).unwrap();
    fs::create_dir_all(&plain).unwrap();
    fs::write(modular.join("module-info.java"), "module m {}\n").unwrap();
    fs::write(modular.join("A.java"), "// a\n").unwrap();
    fs::write(plain.join("B.java"), "// b\n").unwrap();

    let config = BuildConfig::builder(&out)
        .source_directory(SourceDirectory::new(&modular, &out))
        .source_directory(SourceDirectory::new(&plain, &out))
        .build();

    let compiler = MockCompiler::default();
    let options = Options::new();
    let mut executor = config.executor().unwrap();
    assert!(executor.apply_incremental_build(&options).unwrap());
    let err = executor.compile(&compiler, &options, &mut Vec::new()).unwrap_err();
    assert!(matches!(err, JavacError::Configuration(_)));
}

#[test]
fn legacy_module_name_remaps_the_plain_group() {
    let tmp = tempfile::Builder::new().prefix("javac-driver").tempdir().unwrap();
    let src = tmp.path().join("src");
    let out = tmp.path().join("out");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("A.java"), "// a\n").unwrap();

    let config = BuildConfig::builder(&out)
        .sources(&src)
        .legacy_module_name("com.acme.legacy")
        .build();

    let compiler = MockCompiler::default();
    let options = Options::new();
    let mut executor = config.executor().unwrap();
    assert!(executor.apply_incremental_build(&options).unwrap());
    executor.compile(&compiler, &options, &mut Vec::new()).unwrap();

    let invocations = compiler.invocations.lock().unwrap();
    let src_canonical = src.canonicalize().unwrap();
    assert_eq!(invocations[0].location("MODULE_SOURCE_PATH[com.acme.legacy]"), [src_canonical]);
    assert!(out.join("com.acme.legacy/A.class").is_file());
}

/// Assembles a minimal `module-info.class` requiring `java.base @ 21.0.2`.
fn module_info_class() -> Vec<u8> {
    let mut pool: Vec<Vec<u8>> = Vec::new();
    let utf8 = |pool: &mut Vec<Vec<u8>>, s: &str| -> u16 {
        let mut e = vec![1u8];
        e.extend_from_slice(&(s.len() as u16).to_be_bytes());
        e.extend_from_slice(s.as_bytes());
        pool.push(e);
        pool.len() as u16
    };

    let base_name = utf8(&mut pool, "java.base");
    pool.push(vec![19, (base_name >> 8) as u8, base_name as u8]);
    let base_module = pool.len() as u16;
    let version = utf8(&mut pool, "21.0.2");
    let attr_name = utf8(&mut pool, "Module");
    let self_name = utf8(&mut pool, "m");
    pool.push(vec![19, (self_name >> 8) as u8, self_name as u8]);
    let self_module = pool.len() as u16;
    let class_name = utf8(&mut pool, "module-info");
    pool.push(vec![7, (class_name >> 8) as u8, class_name as u8]);
    let this_class = pool.len() as u16;

    let mut bytes = vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 65];
    bytes.extend_from_slice(&((pool.len() as u16) + 1).to_be_bytes());
    for entry in &pool {
        bytes.extend_from_slice(entry);
    }
    bytes.extend_from_slice(&0x8000u16.to_be_bytes());
    bytes.extend_from_slice(&this_class.to_be_bytes());
    bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]); // super, interfaces, fields, methods
    bytes.extend_from_slice(&[0, 1]); // one attribute

    let mut content = Vec::new();
    content.extend_from_slice(&self_module.to_be_bytes());
    content.extend_from_slice(&[0, 0, 0, 0]); // flags, version
    content.extend_from_slice(&1u16.to_be_bytes());
    content.extend_from_slice(&base_module.to_be_bytes());
    content.extend_from_slice(&[0, 0]);
    content.extend_from_slice(&version.to_be_bytes());
    content.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]); // exports, opens, uses, provides

    bytes.extend_from_slice(&attr_name.to_be_bytes());
    bytes.extend_from_slice(&(content.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&content);
    bytes
}

#[test]
fn module_descriptor_requires_version_is_normalized() {
    let tmp = tempfile::Builder::new().prefix("javac-driver").tempdir().unwrap();
    let src = tmp.path().join("src");
    let out = tmp.path().join("out");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("module-info.java"), "module m {\n    requires java.base;\n}\n").unwrap();
    fs::write(src.join("A.java"), "// a\n").unwrap();

    let config = BuildConfig::builder(&out)
        .sources(&src)
        .module_version_target("21")
        .build();

    let compiler = MockCompiler { module_info_bytes: Some(module_info_class()), ..Default::default() };
    let options = Options::new();
    let mut executor = config.executor().unwrap();
    assert!(executor.apply_incremental_build(&options).unwrap());
    executor.compile(&compiler, &options, &mut Vec::new()).unwrap();

    let descriptor = out.join("m/module-info.class");
    let entries = classfile::requires_entries(&fs::read(&descriptor).unwrap()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].module, "java.base");
    assert_eq!(entries[0].version.as_deref(), Some("21"));
}
