//! Targeted rewriting of a compiled `module-info` class.
//!
//! The only transformation performed is normalizing the version recorded on
//! `requires java.* / jdk.*` directives to the release the build targeted. Everything else in
//! the class file is copied byte for byte; the class is never fully decoded.

use crate::error::{JavacError, Result};
use std::collections::BTreeSet;

const CLASS_MAGIC: u32 = 0xCAFE_BABE;

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_FIELDREF: u8 = 9;
const TAG_METHODREF: u8 = 10;
const TAG_INTERFACE_METHODREF: u8 = 11;
const TAG_NAME_AND_TYPE: u8 = 12;
const TAG_METHOD_HANDLE: u8 = 15;
const TAG_METHOD_TYPE: u8 = 16;
const TAG_DYNAMIC: u8 = 17;
const TAG_INVOKE_DYNAMIC: u8 = 18;
const TAG_MODULE: u8 = 19;
const TAG_PACKAGE: u8 = 20;

/// A `requires` directive as recorded in the `Module` attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequiresEntry {
    pub module: String,
    pub version: Option<String>,
}

/// Rewrites `requires <module> @<version>` entries whose module name begins with `java.` or
/// `jdk.` so their version equals `target_release`.
///
/// Returns the patched class bytes, or `None` when no directive needed rewriting. Non-module
/// content is byte-identical in the result; at most one Utf8 constant is appended to hold the
/// target release string.
pub fn patch_module_info(bytes: &[u8], target_release: &str) -> Result<Option<Vec<u8>>> {
    let class = ClassScan::new(bytes)?;
    let module = class.module_attribute()?;

    // positions (in the original buffer) of requires_version_index fields to rewrite
    let mut patch_positions = Vec::new();
    let mut patched_modules = Vec::new();
    let mut previous_versions = BTreeSet::new();

    for entry in &module.requires {
        let platform = entry.module.starts_with("java.") || entry.module.starts_with("jdk.");
        if !platform || entry.version_index == 0 {
            continue;
        }
        let version = class.utf8(entry.version_index)?;
        if version != target_release {
            patch_positions.push(entry.version_position);
            patched_modules.push(entry.module.clone());
            previous_versions.insert(version.to_string());
        }
    }

    if patch_positions.is_empty() {
        return Ok(None);
    }

    // reuse an existing Utf8 constant for the target release, else append one
    let (target_index, appended) = match class.find_utf8(target_release) {
        Some(index) => (index, Vec::new()),
        None => {
            let index = class.constant_count;
            if index == u16::MAX {
                return Err(JavacError::msg("constant pool of module-info is full"));
            }
            let mut entry = Vec::with_capacity(3 + target_release.len());
            entry.push(TAG_UTF8);
            entry.extend_from_slice(&(target_release.len() as u16).to_be_bytes());
            entry.extend_from_slice(target_release.as_bytes());
            (index, entry)
        }
    };

    let mut out = Vec::with_capacity(bytes.len() + appended.len());
    out.extend_from_slice(&bytes[..8]);
    if appended.is_empty() {
        out.extend_from_slice(&class.constant_count.to_be_bytes());
    } else {
        out.extend_from_slice(&(class.constant_count + 1).to_be_bytes());
    }
    out.extend_from_slice(&bytes[10..class.pool_end]);
    out.extend_from_slice(&appended);
    out.extend_from_slice(&bytes[class.pool_end..]);

    let shift = appended.len();
    for position in patch_positions {
        let position = position + shift;
        out[position..position + 2].copy_from_slice(&target_index.to_be_bytes());
    }

    info!(
        "Adjusted version of requires directives to {target_release} for modules \
         {patched_modules:?} (previous versions {previous_versions:?})"
    );
    Ok(Some(out))
}

/// The `requires` directives of a compiled `module-info` class.
pub fn requires_entries(bytes: &[u8]) -> Result<Vec<RequiresEntry>> {
    let class = ClassScan::new(bytes)?;
    let module = class.module_attribute()?;
    module
        .requires
        .iter()
        .map(|entry| {
            let version = match entry.version_index {
                0 => None,
                index => Some(class.utf8(index)?.to_string()),
            };
            Ok(RequiresEntry { module: entry.module.clone(), version })
        })
        .collect()
}

struct ScannedRequires {
    module: String,
    version_index: u16,
    /// Byte offset of the requires_version_index field.
    version_position: usize,
}

struct ScannedModule {
    requires: Vec<ScannedRequires>,
}

/// A minimal scan of the class file: constant-pool string table plus the location of the
/// `Module` attribute. Offsets refer into the original byte buffer.
struct ClassScan<'a> {
    bytes: &'a [u8],
    constant_count: u16,
    /// Utf8 constants as `(index, start-of-bytes, length)`.
    utf8: Vec<(u16, usize, usize)>,
    /// `CONSTANT_Module` entries as `(index, name_index)`.
    modules: Vec<(u16, u16)>,
    pool_end: usize,
    /// Offset of the class-level attributes_count.
    attributes_at: usize,
}

impl<'a> ClassScan<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self> {
        let mut cursor = Cursor { bytes, at: 0 };
        if cursor.read_u32()? != CLASS_MAGIC {
            return Err(malformed("bad magic number"));
        }
        cursor.skip(4)?; // minor, major

        let constant_count = cursor.read_u16()?;
        let mut utf8 = Vec::new();
        let mut modules = Vec::new();

        let mut index: u16 = 1;
        while index < constant_count {
            let tag = cursor.read_u8()?;
            let mut slots = 1;
            match tag {
                TAG_UTF8 => {
                    let len = cursor.read_u16()? as usize;
                    utf8.push((index, cursor.at, len));
                    cursor.skip(len)?;
                }
                TAG_INTEGER | TAG_FLOAT => cursor.skip(4)?,
                TAG_LONG | TAG_DOUBLE => {
                    cursor.skip(8)?;
                    slots = 2;
                }
                TAG_CLASS | TAG_STRING | TAG_METHOD_TYPE | TAG_PACKAGE => cursor.skip(2)?,
                TAG_MODULE => {
                    let name_index = cursor.read_u16()?;
                    modules.push((index, name_index));
                }
                TAG_FIELDREF | TAG_METHODREF | TAG_INTERFACE_METHODREF | TAG_NAME_AND_TYPE
                | TAG_DYNAMIC | TAG_INVOKE_DYNAMIC => cursor.skip(4)?,
                TAG_METHOD_HANDLE => cursor.skip(3)?,
                other => return Err(malformed(format!("unknown constant tag {other}"))),
            }
            index += slots;
        }
        let pool_end = cursor.at;

        cursor.skip(6)?; // access_flags, this_class, super_class
        let interfaces = cursor.read_u16()? as usize;
        cursor.skip(interfaces * 2)?;
        for _ in 0..2 {
            // fields, then methods
            let members = cursor.read_u16()?;
            for _ in 0..members {
                cursor.skip(6)?;
                let attribute_count = cursor.read_u16()?;
                for _ in 0..attribute_count {
                    cursor.skip(2)?;
                    let len = cursor.read_u32()? as usize;
                    cursor.skip(len)?;
                }
            }
        }
        let attributes_at = cursor.at;

        Ok(Self { bytes, constant_count, utf8, modules, pool_end, attributes_at })
    }

    fn utf8(&self, index: u16) -> Result<&'a str> {
        let (_, start, len) = self
            .utf8
            .iter()
            .find(|(i, _, _)| *i == index)
            .ok_or_else(|| malformed(format!("constant {index} is not a Utf8 entry")))?;
        std::str::from_utf8(&self.bytes[*start..*start + *len])
            .map_err(|_| malformed(format!("constant {index} is not valid UTF-8")))
    }

    fn find_utf8(&self, value: &str) -> Option<u16> {
        self.utf8
            .iter()
            .find(|(_, start, len)| &self.bytes[*start..*start + *len] == value.as_bytes())
            .map(|(i, _, _)| *i)
    }

    fn module_name(&self, index: u16) -> Result<String> {
        let (_, name_index) = self
            .modules
            .iter()
            .find(|(i, _)| *i == index)
            .ok_or_else(|| malformed(format!("constant {index} is not a Module entry")))?;
        Ok(self.utf8(*name_index)?.to_string())
    }

    fn module_attribute(&self) -> Result<ScannedModule> {
        let mut cursor = Cursor { bytes: self.bytes, at: self.attributes_at };
        let count = cursor.read_u16()?;
        for _ in 0..count {
            let name_index = cursor.read_u16()?;
            let len = cursor.read_u32()? as usize;
            if self.utf8(name_index)? != "Module" {
                cursor.skip(len)?;
                continue;
            }

            cursor.skip(6)?; // module_name_index, module_flags, module_version_index
            let requires_count = cursor.read_u16()?;
            let mut requires = Vec::with_capacity(requires_count as usize);
            for _ in 0..requires_count {
                let module_index = cursor.read_u16()?;
                cursor.skip(2)?; // requires_flags
                let version_position = cursor.at;
                let version_index = cursor.read_u16()?;
                requires.push(ScannedRequires {
                    module: self.module_name(module_index)?,
                    version_index,
                    version_position,
                });
            }
            return Ok(ScannedModule { requires });
        }
        Err(malformed("no Module attribute present"))
    }
}

fn malformed(detail: impl std::fmt::Display) -> JavacError {
    JavacError::msg(format!("malformed module-info class file: {detail}"))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl Cursor<'_> {
    fn skip(&mut self, n: usize) -> Result<()> {
        let end = self.at.checked_add(n).filter(|&e| e <= self.bytes.len());
        match end {
            Some(end) => {
                self.at = end;
                Ok(())
            }
            None => Err(malformed("unexpected end of file")),
        }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let v = *self.bytes.get(self.at).ok_or_else(|| malformed("unexpected end of file"))?;
        self.at += 1;
        Ok(v)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let at = self.at;
        self.skip(2)?;
        Ok(u16::from_be_bytes(self.bytes[at..at + 2].try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let at = self.at;
        self.skip(4)?;
        Ok(u32::from_be_bytes(self.bytes[at..at + 4].try_into().unwrap()))
    }
}
