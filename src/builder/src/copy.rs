//! Copy pipeline for ADD/COPY.
//!
//! Turns an inventory of CopyInfos into chained `extract_tarfile` tasks.
//! The builder creates (and chowns) missing destination directories under
//! the container root itself; the actual tar entry extraction is the
//! host's job. An ADD of a recognized archive extracts the archive
//! instead of copying it.

use std::path::{Path, PathBuf};

use nix::unistd::{chown, Gid, Uid};

use kiln_core::error::{KilnError, Result};
use kiln_core::event::EventSender;
use kiln_core::task::ExtractSpec;

use crate::context::{self, ArchiveKind, CopyInfo};

/// One ADD/COPY materialization against a build session's directories.
pub struct CopyJob<'a> {
    pub events: &'a EventSender,
    pub cmd_name: &'static str,
    /// The original context archive; single-entry extractions pull
    /// straight from it.
    pub context_archive: &'a Path,
    /// The extracted context directory (archive sources are read here).
    pub context_dir: &'a Path,
    pub container_root: &'a Path,
    pub chown_uid: Option<u32>,
    pub chown_gid: Option<u32>,
}

impl CopyJob<'_> {
    /// Materialize every CopyInfo into the container root.
    pub async fn materialize(&self, infos: &[CopyInfo], dest_raw: &str) -> Result<()> {
        if self.cmd_name == "ADD" && infos.len() == 1 && !infos[0].is_dir && infos[0].decompress {
            return self.extract_archive_source(&infos[0], dest_raw).await;
        }

        let mut files = Vec::new();
        for info in infos {
            self.prepare_dirs(info, &mut files)?;
        }
        // Extractions chain strictly one after another.
        for info in files {
            self.extract_entry(info).await?;
        }
        Ok(())
    }

    /// Create destination directories (depth-first) and collect the file
    /// entries to extract.
    fn prepare_dirs<'b>(&self, info: &'b CopyInfo, files: &mut Vec<&'b CopyInfo>) -> Result<()> {
        if info.is_dir {
            self.ensure_dir(&info.dest_path)?;
            for child in &info.children {
                self.prepare_dirs(child, files)?;
            }
        } else {
            self.ensure_dir(parent_inside(&info.dest_path))?;
            files.push(info);
        }
        Ok(())
    }

    /// Extract one entry of the context archive into its destination.
    async fn extract_entry(&self, info: &CopyInfo) -> Result<()> {
        let src_base = basename(&info.orig_path);
        let dst_base = basename(&info.dest_path);
        let strip = component_count(parent_rel(&info.orig_path));

        let spec = ExtractSpec {
            tarfile: self.context_archive.to_path_buf(),
            extract_dir: self.host_of(parent_inside(&info.dest_path)),
            strip_dir_count: (strip > 0).then_some(strip),
            replace_pattern: (src_base != dst_base)
                .then(|| format!("{}:{}", src_base, dst_base)),
            paths: Some(vec![info.orig_path.clone()]),
            compression: None,
        };
        tracing::debug!(
            src = %info.orig_path,
            dest = %info.dest_path,
            "extracting context entry"
        );
        self.events.extract_tarfile(spec).await
    }

    /// ADD of a tarball: extract the archive itself into the destination
    /// directory, passing the detected compression through.
    async fn extract_archive_source(&self, info: &CopyInfo, dest_raw: &str) -> Result<()> {
        let dest_dir = if context::dest_is_dir_syntax(dest_raw) {
            parent_inside(&info.dest_path).to_string()
        } else {
            info.dest_path.clone()
        };
        self.ensure_dir(&dest_dir)?;

        let tarfile = self.context_dir.join(&info.orig_path);
        let compression = match context::detect_archive(&tarfile)? {
            Some(ArchiveKind::Compressed(c)) => Some(c),
            _ => None,
        };
        tracing::debug!(
            archive = %info.orig_path,
            dest = %dest_dir,
            "auto-extracting ADD archive"
        );
        self.events
            .extract_tarfile(ExtractSpec {
                tarfile,
                extract_dir: self.host_of(&dest_dir),
                strip_dir_count: None,
                replace_pattern: None,
                paths: None,
                compression,
            })
            .await
    }

    /// Create each missing component of an inside-container directory,
    /// chowning the newly created ones.
    fn ensure_dir(&self, inside: &str) -> Result<()> {
        let mut path = self.container_root.to_path_buf();
        for comp in inside.split('/').filter(|c| !c.is_empty()) {
            path.push(comp);
            if !path.exists() {
                std::fs::create_dir(&path)?;
                if let (Some(uid), Some(gid)) = (self.chown_uid, self.chown_gid) {
                    chown(&path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(
                        |e| {
                            KilnError::TaskFailure(format!(
                                "chown {}: {}",
                                path.display(),
                                e
                            ))
                        },
                    )?;
                }
            }
        }
        Ok(())
    }

    fn host_of(&self, inside: &str) -> PathBuf {
        self.container_root.join(inside.trim_start_matches('/'))
    }
}

fn parent_inside(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn parent_rel(rel: &str) -> &str {
    match rel.rsplit_once('/') {
        Some((parent, _)) => parent,
        None => "",
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn component_count(rel: &str) -> usize {
    rel.split('/').filter(|c| !c.is_empty()).count()
}
