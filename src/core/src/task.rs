//! Host task protocol.
//!
//! The builder never touches tar archives or container runtimes itself.
//! Whenever a step needs the filesystem or the container changed, it emits
//! a task carrying a oneshot completion handle and suspends until the host
//! answers. Exactly one task is outstanding at a time.

use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::oneshot;

/// Host-reported task outcome. The error side carries the host's message
/// verbatim and is surfaced to the build as a `TaskFailure`.
pub type TaskReply<T> = std::result::Result<T, String>;

/// Compression detected on a tar archive handed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarCompression {
    Gzip,
    Bzip2,
    Xz,
}

impl TarCompression {
    pub fn as_str(&self) -> &'static str {
        match self {
            TarCompression::Gzip => "gzip",
            TarCompression::Bzip2 => "bzip2",
            TarCompression::Xz => "xz",
        }
    }
}

/// What to extract and where. `paths`, when set, selects individual entries
/// out of the archive; `strip_dir_count` drops that many leading path
/// components from each selected entry; `replace_pattern` is a
/// `"<src-basename>:<dst-basename>"` rename applied after stripping.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractSpec {
    pub tarfile: PathBuf,
    pub extract_dir: PathBuf,
    pub strip_dir_count: Option<usize>,
    pub replace_pattern: Option<String>,
    pub paths: Option<Vec<String>>,
    pub compression: Option<TarCompression>,
}

/// `extract_tarfile` request.
#[derive(Debug)]
pub struct ExtractRequest {
    pub spec: ExtractSpec,
    pub reply: oneshot::Sender<TaskReply<()>>,
}

/// How the base image for a reprovision is identified.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageRef {
    /// A named image to install (e.g. `busybox:latest`).
    Name(String),
    /// An already-built image id to roll the container filesystem back to.
    Id(String),
}

/// `image_reprovision` request. The reply payload is host-shaped JSON:
/// `{"image": {"Config": {...}, "ContainerConfig": {...}, "Id": "...", "Parent": "..."}}`.
#[derive(Debug)]
pub struct ReprovisionRequest {
    pub image: ImageRef,
    pub cmd_name: String,
    pub reply: oneshot::Sender<TaskReply<Value>>,
}

/// `run` request: execute a command inside the container root.
#[derive(Debug)]
pub struct RunRequest {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub workdir: String,
    pub user: String,
    pub reply: oneshot::Sender<TaskReply<RunOutput>>,
}

/// Result of a `run` task.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub exit_code: i32,
}

/// A request for the host.
#[derive(Debug)]
pub enum HostTask {
    ExtractTarfile(ExtractRequest),
    ImageReprovision(ReprovisionRequest),
    Run(RunRequest),
}

impl HostTask {
    /// Task kind name as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            HostTask::ExtractTarfile(_) => "extract_tarfile",
            HostTask::ImageReprovision(_) => "image_reprovision",
            HostTask::Run(_) => "run",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_names() {
        assert_eq!(TarCompression::Gzip.as_str(), "gzip");
        assert_eq!(TarCompression::Bzip2.as_str(), "bzip2");
        assert_eq!(TarCompression::Xz.as_str(), "xz");
    }

    #[test]
    fn test_task_kinds() {
        let (tx, _rx) = oneshot::channel();
        let task = HostTask::Run(RunRequest {
            cmd: vec!["/bin/true".to_string()],
            env: Vec::new(),
            workdir: "/".to_string(),
            user: String::new(),
            reply: tx,
        });
        assert_eq!(task.kind(), "run");
    }
}
