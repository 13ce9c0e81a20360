//! The persisted state of a previous build.
//!
//! The cache is a compact binary file. Integers are big-endian, strings carry a 16-bit length
//! prefix followed by UTF-8 bytes. Record paths are compressed by parent-sharing: a record only
//! names its source root when it differs from the previous record's, and the file path is
//! stored relative to either that root or the previous file's parent directory.

use crate::{
    error::{JavacError, Result},
    utils,
};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

/// Identifies the cache format. Changing it invalidates every older cache.
pub const CACHE_MAGIC: [u8; 8] = *b"JCDCACH1";

const FLAG_NEW_SOURCE_DIRECTORY: u8 = 1;
const FLAG_NEW_TARGET_DIRECTORY: u8 = 2;
const FLAG_EXPLICIT_OUTPUT_FILE: u8 = 4;
const KNOWN_FLAGS: u8 = FLAG_NEW_SOURCE_DIRECTORY | FLAG_NEW_TARGET_DIRECTORY | FLAG_EXPLICIT_OUTPUT_FILE;

/// What loading the cache file produced.
#[derive(Debug)]
pub enum CacheLoad {
    /// No cache file: this is the first build, everything compiles.
    FirstBuild,
    /// A cache file exists but could not be understood; the reason feeds the user-visible
    /// rebuild message.
    Corrupt(String),
    Loaded(IncrementalCache),
}

/// State of one source file at the end of the previous build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheRecord {
    /// The source root the file belonged to.
    pub source_root: PathBuf,
    /// The output root the file compiled into.
    pub output_root: PathBuf,
    /// An explicitly recorded output file, when the output could not be inferred.
    pub explicit_output: Option<PathBuf>,
    /// Source mtime, milliseconds since the Unix epoch.
    pub last_modified: i64,
}

impl CacheRecord {
    /// The output file of this record: the explicit path if present, else inferred from the
    /// roots the same way [`crate::SourceFile::output_path`] infers it.
    pub fn output_file(&self, source: &Path, output_extension: &str) -> PathBuf {
        if let Some(explicit) = &self.explicit_output {
            return explicit.clone();
        }
        let relative = utils::strip_prefix(source, &self.source_root);
        utils::output_file_for(&self.output_root, relative, output_extension)
    }
}

/// A parsed cache file: the prior build epoch, the options fingerprint it was built with, and a
/// record per source file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IncrementalCache {
    /// When the previous build ran, milliseconds since the Unix epoch.
    pub build_time: i64,
    /// Fingerprint of the option list the previous build used.
    pub options_fingerprint: u32,
    pub files: BTreeMap<PathBuf, CacheRecord>,
}

impl IncrementalCache {
    /// Loads the cache file.
    ///
    /// A missing file is a first build. Unreadable or unparsable content is reported as
    /// [`CacheLoad::Corrupt`] with the parse error; the caller recompiles everything either
    /// way.
    pub fn load(path: &Path) -> CacheLoad {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return CacheLoad::FirstBuild,
            Err(err) => return CacheLoad::Corrupt(err.to_string()),
        };
        trace!("read {} cache bytes from \"{}\"", bytes.len(), path.display());
        match Self::parse(&bytes) {
            Ok(cache) => CacheLoad::Loaded(cache),
            Err(err) => CacheLoad::Corrupt(err.to_string()),
        }
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { bytes, at: 0 };

        let magic = reader.take(CACHE_MAGIC.len())?;
        if magic != CACHE_MAGIC {
            return Err(JavacError::CacheCorrupt("unrecognized magic number".to_string()));
        }
        let build_time = reader.read_i64()?;
        let options_fingerprint = reader.read_u32()?;
        let count = reader.read_u32()?;

        let mut files = BTreeMap::new();
        let mut source_root = PathBuf::new();
        let mut output_root = PathBuf::new();
        let mut previous_parent = PathBuf::new();

        for _ in 0..count {
            let flags = reader.read_u8()?;
            if flags & !KNOWN_FLAGS != 0 {
                return Err(JavacError::CacheCorrupt(format!("unknown record flags {flags:#04x}")));
            }
            if flags & FLAG_NEW_SOURCE_DIRECTORY != 0 {
                source_root = reader.read_path()?;
            }
            if flags & FLAG_NEW_TARGET_DIRECTORY != 0 {
                output_root = reader.read_path()?;
            }
            let explicit_output = if flags & FLAG_EXPLICIT_OUTPUT_FILE != 0 {
                Some(reader.read_path()?)
            } else {
                None
            };

            let relative = reader.read_path()?;
            let base = if flags & FLAG_NEW_SOURCE_DIRECTORY != 0 { &source_root } else { &previous_parent };
            let path = utils::normalize_path(&base.join(&relative));
            if !path.is_absolute() {
                return Err(JavacError::CacheCorrupt(format!(
                    "path \"{}\" does not resolve to an absolute location",
                    relative.display()
                )));
            }
            previous_parent = path.parent().map(Path::to_path_buf).unwrap_or_default();

            let last_modified = reader.read_i64()?;
            files.insert(
                path,
                CacheRecord {
                    source_root: source_root.clone(),
                    output_root: output_root.clone(),
                    explicit_output,
                    last_modified,
                },
            );
        }

        Ok(Self { build_time, options_fingerprint, files })
    }

    /// Writes the cache to `path`, atomically: a sibling temp file is written and renamed into
    /// place, so a crashed build leaves either the old file intact or the new one.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut out = Vec::with_capacity(64 + self.files.len() * 48);
        out.extend_from_slice(&CACHE_MAGIC);
        out.extend_from_slice(&self.build_time.to_be_bytes());
        out.extend_from_slice(&self.options_fingerprint.to_be_bytes());
        out.extend_from_slice(&(self.files.len() as u32).to_be_bytes());

        let mut source_root: Option<&Path> = None;
        let mut output_root: Option<&Path> = None;
        let mut previous_parent: Option<PathBuf> = None;

        for (file, record) in &self.files {
            let new_source_root = source_root != Some(&record.source_root);
            let new_output_root = output_root != Some(&record.output_root);

            let mut flags = 0u8;
            if new_source_root {
                flags |= FLAG_NEW_SOURCE_DIRECTORY;
            }
            if new_output_root {
                flags |= FLAG_NEW_TARGET_DIRECTORY;
            }
            if record.explicit_output.is_some() {
                flags |= FLAG_EXPLICIT_OUTPUT_FILE;
            }
            out.push(flags);

            if new_source_root {
                write_path(&mut out, &record.source_root)?;
                source_root = Some(&record.source_root);
            }
            if new_output_root {
                write_path(&mut out, &record.output_root)?;
                output_root = Some(&record.output_root);
            }
            if let Some(explicit) = &record.explicit_output {
                write_path(&mut out, explicit)?;
            }

            let relative = if new_source_root {
                utils::relativize(&record.source_root, file)
            } else {
                utils::relativize(previous_parent.as_deref().unwrap_or(Path::new("")), file)
            };
            write_path(&mut out, &relative)?;
            previous_parent = file.parent().map(Path::to_path_buf);

            out.extend_from_slice(&record.last_modified.to_be_bytes());
        }

        utils::create_parent_dir_all(path)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|err| JavacError::io(err, dir))?;
        fs::write(tmp.path(), &out).map_err(|err| JavacError::io(err, tmp.path()))?;
        tmp.persist(path).map_err(|err| JavacError::io(err.error, path))?;
        trace!("wrote cache with {} records to \"{}\"", self.files.len(), path.display());
        Ok(())
    }
}

fn write_path(out: &mut Vec<u8>, path: &Path) -> Result<()> {
    let s = path.to_string_lossy();
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(JavacError::msg(format!("path too long for cache record: {s}")));
    }
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.at.checked_add(n).filter(|&end| end <= self.bytes.len()).ok_or_else(|| {
            JavacError::CacheCorrupt("unexpected end of cache file".to_string())
        })?;
        let slice = &self.bytes[self.at..end];
        self.at = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_path(&mut self) -> Result<PathBuf> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|err| JavacError::CacheCorrupt(format!("malformed string: {err}")))?;
        Ok(PathBuf::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tempdir;
    use pretty_assertions::assert_eq;

    fn record(source_root: &str, output_root: &str, mtime: i64) -> CacheRecord {
        CacheRecord {
            source_root: PathBuf::from(source_root),
            output_root: PathBuf::from(output_root),
            explicit_output: None,
            last_modified: mtime,
        }
    }

    #[test]
    fn roundtrip_preserves_fingerprint_and_records() {
        let tmp = tempdir("cache").unwrap();
        let path = tmp.path().join("state").join("build.cache");

        let mut files = BTreeMap::new();
        files.insert(PathBuf::from("/p/src/com/acme/A.java"), record("/p/src", "/p/out", 100));
        files.insert(PathBuf::from("/p/src/com/acme/B.java"), record("/p/src", "/p/out", 200));
        files.insert(
            PathBuf::from("/p/gen/com/acme/C.java"),
            CacheRecord {
                source_root: PathBuf::from("/p/gen"),
                output_root: PathBuf::from("/p/out"),
                explicit_output: Some(PathBuf::from("/p/out/custom/C.class")),
                last_modified: 300,
            },
        );

        let cache = IncrementalCache { build_time: 1234, options_fingerprint: 0xDEAD, files };
        cache.write(&path).unwrap();

        match IncrementalCache::load(&path) {
            CacheLoad::Loaded(loaded) => assert_eq!(loaded, cache),
            other => panic!("expected loaded cache, got {other:?}"),
        }
    }

    #[test]
    fn parent_sharing_compresses_sibling_paths() {
        let tmp = tempdir("cache").unwrap();
        let path = tmp.path().join("build.cache");

        let mut files = BTreeMap::new();
        for name in ["A", "B", "C"] {
            files.insert(
                PathBuf::from(format!("/p/src/com/acme/{name}.java")),
                record("/p/src", "/p/out", 1),
            );
        }
        let cache = IncrementalCache { build_time: 1, options_fingerprint: 1, files };
        cache.write(&path).unwrap();

        // sibling records after the first should only spend a flags byte, the bare file name
        // and the mtime
        let len = fs::metadata(&path).unwrap().len();
        assert!(len < 150, "cache unexpectedly large: {len} bytes");

        assert!(matches!(IncrementalCache::load(&path), CacheLoad::Loaded(_)));
    }

    #[test]
    fn missing_file_is_first_build() {
        assert!(matches!(IncrementalCache::load(Path::new("/nonexistent/build.cache")), CacheLoad::FirstBuild));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let tmp = tempdir("cache").unwrap();
        let path = tmp.path().join("build.cache");
        fs::write(&path, b"NOTACACHEFILE").unwrap();
        match IncrementalCache::load(&path) {
            CacheLoad::Corrupt(reason) => assert!(reason.contains("magic")),
            other => panic!("expected corrupt, got {other:?}"),
        }
    }

    #[test]
    fn unknown_flag_bits_are_corrupt() {
        let tmp = tempdir("cache").unwrap();
        let path = tmp.path().join("build.cache");

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&CACHE_MAGIC);
        bytes.extend_from_slice(&0i64.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.push(0x80);
        fs::write(&path, bytes).unwrap();

        match IncrementalCache::load(&path) {
            CacheLoad::Corrupt(reason) => assert!(reason.contains("flags")),
            other => panic!("expected corrupt, got {other:?}"),
        }
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let tmp = tempdir("cache").unwrap();
        let path = tmp.path().join("build.cache");

        let mut files = BTreeMap::new();
        files.insert(PathBuf::from("/p/src/A.java"), record("/p/src", "/p/out", 1));
        let cache = IncrementalCache { build_time: 1, options_fingerprint: 1, files };
        cache.write(&path).unwrap();

        let full = fs::read(&path).unwrap();
        fs::write(&path, &full[..full.len() - 4]).unwrap();
        assert!(matches!(IncrementalCache::load(&path), CacheLoad::Corrupt(_)));
    }

    #[test]
    fn relative_resolution_must_be_absolute() {
        let tmp = tempdir("cache").unwrap();
        let path = tmp.path().join("build.cache");

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&CACHE_MAGIC);
        bytes.extend_from_slice(&0i64.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.push(FLAG_NEW_SOURCE_DIRECTORY);
        // relative source root makes the resolved path non-absolute
        for s in ["rel-root", "A.java"] {
            bytes.extend_from_slice(&(s.len() as u16).to_be_bytes());
            bytes.extend_from_slice(s.as_bytes());
        }
        bytes.extend_from_slice(&0i64.to_be_bytes());
        fs::write(&path, bytes).unwrap();

        match IncrementalCache::load(&path) {
            CacheLoad::Corrupt(reason) => assert!(reason.contains("absolute")),
            other => panic!("expected corrupt, got {other:?}"),
        }
    }

    #[test]
    fn record_output_file_inference() {
        let rec = record("/p/src", "/p/out", 1);
        assert_eq!(
            rec.output_file(Path::new("/p/src/com/acme/A.java"), "class"),
            PathBuf::from("/p/out/com/acme/A.class")
        );
        let explicit = CacheRecord { explicit_output: Some(PathBuf::from("/elsewhere/A.class")), ..rec };
        assert_eq!(
            explicit.output_file(Path::new("/p/src/com/acme/A.java"), "class"),
            PathBuf::from("/elsewhere/A.class")
        );
    }
}
