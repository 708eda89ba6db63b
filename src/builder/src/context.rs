//! Build-context inventory for ADD/COPY.
//!
//! Enumerates the sources of a copy instruction inside the extracted
//! context, resolving wildcards level by level and recursing into
//! directories, and computes the content hashes the layer cache keys on.
//! Hash strings must stay byte-identical across runs: files hash their
//! bytes, directories hash their children's sorted hash strings.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use glob::Pattern;
use sha2::{Digest, Sha256};

use kiln_core::error::{KilnError, Result};
use kiln_core::task::TarCompression;

use crate::safepath;

/// One source-to-destination pairing for ADD/COPY.
#[derive(Debug, Clone)]
pub struct CopyInfo {
    /// Path relative to the context root.
    pub orig_path: String,
    /// Absolute path inside the container.
    pub dest_path: String,
    pub is_dir: bool,
    /// True only for an ADD of an archive.
    pub decompress: bool,
    /// `file:<sha256>` or `dir:<sha256-of-sorted-child-sums>`.
    pub hash: String,
    pub children: Vec<CopyInfo>,
}

/// Inputs for one inventory pass.
pub struct InventoryRequest<'a> {
    pub cmd_name: &'static str,
    /// Instruction args: `[src..., dest]`.
    pub args: &'a [String],
    pub working_dir: &'a str,
    pub context_dir: &'a Path,
    pub container_root: &'a Path,
    pub allow_remote: bool,
    pub allow_decompress: bool,
}

/// Enumerate all sources of a copy instruction into a flat CopyInfo list.
pub fn get_copy_info(req: &InventoryRequest<'_>) -> Result<Vec<CopyInfo>> {
    if req.args.len() < 2 {
        return Err(KilnError::Input(format!(
            "{} requires at least two arguments",
            req.cmd_name
        )));
    }

    let dest_raw = req.args.last().unwrap();
    let sources = &req.args[..req.args.len() - 1];
    let dir_syntax = dest_is_dir_syntax(dest_raw);

    let dest_abs = if dest_raw.starts_with('/') {
        dest_raw.clone()
    } else {
        format!("{}/{}", req.working_dir.trim_end_matches('/'), dest_raw)
    };
    // The authoritative destination root for every source.
    let dest = safepath::resolve_under_root(&dest_abs, req.container_root)?;

    let mut infos = Vec::new();
    for src in sources {
        let rel = strip_source_prefix(src);

        if is_url(&rel) {
            if req.allow_remote {
                return Err(KilnError::NotImplemented(format!(
                    "Remote source files are not supported: {}",
                    src
                )));
            }
            // Not a remote-capable instruction: falls through and fails
            // the stat below like any other missing path.
        }

        if lexical_escapes(&rel) {
            return Err(KilnError::ForbiddenPath {
                requested: src.clone(),
                resolved: lexical_join(req.context_dir, &rel).display().to_string(),
            });
        }

        if has_wildcard(&rel) {
            for matched in expand_wildcard(req, &rel)? {
                let dest_path = child_dest(&dest.inside, basename(&matched));
                infos.push(build_info(req, &matched, dest_path, false)?);
            }
            continue;
        }

        let scoped = safepath::resolve_under_root(&format!("/{}", rel), req.context_dir)?;
        let md = fs::metadata(&scoped.host).map_err(|_| KilnError::NotFound(rel.clone()))?;
        let dest_path = if !md.is_dir() && (sources.len() > 1 || dir_syntax) {
            child_dest(&dest.inside, basename(&rel))
        } else {
            // A directory source copies its contents; a lone file source
            // without directory syntax is a rename onto dest itself.
            dest.inside.clone()
        };
        infos.push(build_info(req, &rel, dest_path, req.allow_decompress)?);
    }

    if infos.is_empty() {
        return Err(KilnError::Input("No source files were specified".to_string()));
    }
    if infos.len() > 1 && !dir_syntax {
        return Err(KilnError::Input(format!(
            "When using {} with more than one source file, the destination must be a directory and end with a /",
            req.cmd_name
        )));
    }

    Ok(infos)
}

/// Build a CopyInfo (recursing into directories) with its content hash.
fn build_info(
    req: &InventoryRequest<'_>,
    rel: &str,
    dest_path: String,
    allow_decompress: bool,
) -> Result<CopyInfo> {
    let scoped = safepath::resolve_under_root(&format!("/{}", rel), req.context_dir)?;
    let md = fs::metadata(&scoped.host).map_err(|_| KilnError::NotFound(rel.to_string()))?;

    if md.is_dir() {
        let mut names: Vec<String> = fs::read_dir(&scoped.host)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        let mut children = Vec::with_capacity(names.len());
        for name in names {
            let child_rel = join_rel(rel, &name);
            let child_target = child_dest(&dest_path, &name);
            children.push(build_info(req, &child_rel, child_target, false)?);
        }

        Ok(CopyInfo {
            orig_path: rel.to_string(),
            dest_path,
            is_dir: true,
            decompress: false,
            hash: dir_hash(&children),
            children,
        })
    } else {
        let decompress = allow_decompress && detect_archive(&scoped.host)?.is_some();
        Ok(CopyInfo {
            orig_path: rel.to_string(),
            dest_path,
            is_dir: false,
            decompress,
            hash: file_hash(&scoped.host)?,
            children: Vec::new(),
        })
    }
}

/// Walk the context level by level, matching each pattern component as a
/// glob. Intermediate components must be directories; the last accepts
/// files too. Symlinks resolve in context scope.
fn expand_wildcard(req: &InventoryRequest<'_>, pattern: &str) -> Result<Vec<String>> {
    let comps: Vec<&str> = pattern
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();

    let mut prefixes = vec![String::new()];
    for (i, comp) in comps.iter().enumerate() {
        let last = i + 1 == comps.len();
        let pat = Pattern::new(comp).map_err(|e| {
            KilnError::Input(format!("invalid wildcard pattern {}: {}", comp, e))
        })?;

        let mut next = Vec::new();
        for prefix in &prefixes {
            let scoped = safepath::resolve_under_root(&format!("/{}", prefix), req.context_dir)?;
            let entries = match fs::read_dir(&scoped.host) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            let mut names: Vec<String> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();

            for name in names {
                if !pat.matches(&name) {
                    continue;
                }
                let rel = join_rel(prefix, &name);
                if last {
                    next.push(rel);
                } else {
                    let child = safepath::resolve_under_root(&format!("/{}", rel), req.context_dir)?;
                    if fs::metadata(&child.host).map(|m| m.is_dir()).unwrap_or(false) {
                        next.push(rel);
                    }
                }
            }
        }
        prefixes = next;
        if prefixes.is_empty() {
            break;
        }
    }

    if prefixes.len() == 1 && prefixes[0].is_empty() {
        return Ok(Vec::new());
    }
    Ok(prefixes)
}

/// Archive flavor of an ADD source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    PlainTar,
    Compressed(TarCompression),
}

/// Sniff the leading bytes of a file for a compressed-archive signature;
/// a bare `.tar` extension also counts.
pub fn detect_archive(path: &Path) -> Result<Option<ArchiveKind>> {
    let mut magic = [0u8; 6];
    let mut file = fs::File::open(path)?;
    let n = file.read(&mut magic)?;

    if n >= 2 && magic[0] == 0x1f && magic[1] == 0x8b {
        return Ok(Some(ArchiveKind::Compressed(TarCompression::Gzip)));
    }
    if n >= 3 && &magic[..3] == b"BZh" {
        return Ok(Some(ArchiveKind::Compressed(TarCompression::Bzip2)));
    }
    if n >= 6 && magic == [0xfd, b'7', b'z', b'X', b'Z', 0x00] {
        return Ok(Some(ArchiveKind::Compressed(TarCompression::Xz)));
    }
    if path.extension().and_then(|e| e.to_str()) == Some("tar") {
        return Ok(Some(ArchiveKind::PlainTar));
    }
    Ok(None)
}

/// Composite hash for a multi-source step; a lone source keeps its own.
pub fn composite_hash(infos: &[CopyInfo]) -> String {
    if infos.len() == 1 {
        return infos[0].hash.clone();
    }
    let joined = infos
        .iter()
        .map(|i| i.hash.as_str())
        .collect::<Vec<_>>()
        .join(",");
    format!("multi:{}", sha256_hex(joined.as_bytes()))
}

/// Destination syntax signals directory intent: a trailing `/` or a `.`
/// basename.
pub fn dest_is_dir_syntax(dest: &str) -> bool {
    dest.ends_with('/') || dest == "." || dest.ends_with("/.")
}

// --- Hash helpers ---

fn file_hash(path: &Path) -> Result<String> {
    Ok(format!("file:{}", sha256_hex(&fs::read(path)?)))
}

fn dir_hash(children: &[CopyInfo]) -> String {
    let mut sums: Vec<&str> = children.iter().map(|c| c.hash.as_str()).collect();
    sums.sort_unstable();
    format!("dir:{}", sha256_hex(sums.join(",").as_bytes()))
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// --- Path helpers ---

/// Strip leading `/` and `./` from a source path. Parent references are
/// kept and surface as ForbiddenPath.
fn strip_source_prefix(src: &str) -> String {
    let mut s = src;
    loop {
        if let Some(rest) = s.strip_prefix("./") {
            s = rest;
        } else if let Some(rest) = s.strip_prefix('/') {
            s = rest;
        } else {
            break;
        }
    }
    s.to_string()
}

fn is_url(src: &str) -> bool {
    match src.split_once("://") {
        Some((scheme, rest)) => {
            !scheme.is_empty()
                && !rest.is_empty()
                && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+')
        }
        None => false,
    }
}

/// True when the path contains an unescaped `*`, `?`, or `[`.
fn has_wildcard(src: &str) -> bool {
    let mut escaped = false;
    for c in src.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '*' | '?' | '[' => return true,
            _ => {}
        }
    }
    false
}

/// True when the relative path climbs above its starting point.
fn lexical_escapes(rel: &str) -> bool {
    let mut depth: i32 = 0;
    for comp in rel.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            _ => depth += 1,
        }
    }
    false
}

fn lexical_join(root: &Path, rel: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for comp in rel.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            c => out.push(c),
        }
    }
    out
}

fn basename(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}

fn join_rel(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn child_dest(dest: &str, name: &str) -> String {
    format!("{}/{}", dest.trim_end_matches('/'), name)
}
