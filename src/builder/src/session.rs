//! Build session construction.
//!
//! A session owns one build or commit run: the working directories, the
//! parsed CLI options, the cache candidates, and the mutable image state
//! the engine drives forward.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use kiln_core::error::{KilnError, Result};

use crate::args::BuildArgs;
use crate::image::{ImageState, InstalledImage, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandType {
    #[default]
    Build,
    Commit,
}

/// Named construction options, as supplied by the surrounding service.
/// `buildargs` and `labels` arrive JSON-encoded from the CLI.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub work_dir: PathBuf,
    pub container_root_dir: PathBuf,
    pub context_filepath: Option<PathBuf>,
    /// Dockerfile name inside the context; `Dockerfile` by default, with
    /// a lowercase `dockerfile` fallback.
    pub dockerfile: Option<String>,
    pub command_type: CommandType,
    /// Zone identifier of the container servicing `run` tasks.
    pub uuid: String,
    /// Cache candidates, in probe order.
    pub existing_images: Vec<Value>,
    /// JSON-encoded map of build-arg name to value (or null).
    pub buildargs: Option<String>,
    /// JSON-encoded map of label name to value.
    pub labels: Option<String>,
    pub nocache: bool,
    pub suppress_success_msg: bool,
    pub chown_uid: Option<u32>,
    pub chown_gid: Option<u32>,
    /// Commit mode: the starting image, in the `image_reprovision`
    /// return shape.
    pub commit_image: Option<Value>,
    /// Commit mode: the instruction lines to apply.
    pub commit_changes: Vec<String>,
}

/// One build run. Created by the caller, lives for one build, destroyed
/// at the end.
#[derive(Debug)]
pub struct BuildSession {
    pub(crate) work_dir: PathBuf,
    pub(crate) container_root: PathBuf,
    pub(crate) context_filepath: Option<PathBuf>,
    pub(crate) dockerfile_name: Option<String>,
    pub(crate) command_type: CommandType,
    pub(crate) zone_id: String,
    pub(crate) existing_images: Vec<InstalledImage>,
    pub(crate) cli_labels: BTreeMap<String, String>,
    pub(crate) args: BuildArgs,
    pub(crate) cache_enabled: bool,
    pub(crate) suppress_success_msg: bool,
    pub(crate) chown_uid: Option<u32>,
    pub(crate) chown_gid: Option<u32>,
    pub(crate) commit_image: Option<Value>,
    pub(crate) commit_changes: Vec<String>,

    // Per-run state
    pub(crate) state: ImageState,
    pub(crate) layers: Vec<Layer>,
    pub(crate) context_dir: PathBuf,
    pub(crate) cmd_set: bool,
    pub(crate) cache_last_cmd_cached: bool,
    pub(crate) had_cache_hit: bool,
    pub(crate) emit_stdout: bool,
}

impl BuildSession {
    /// Validate the options and construct a session. JSON-encoded options
    /// are parsed eagerly so malformed input fails before any task runs.
    pub fn new(opts: SessionOptions) -> Result<Self> {
        if opts.command_type == CommandType::Build && opts.context_filepath.is_none() {
            return Err(KilnError::Input(
                "build requires a context archive (contextFilepath)".to_string(),
            ));
        }
        if opts.command_type == CommandType::Commit && opts.commit_image.is_none() {
            return Err(KilnError::Input(
                "commit requires a starting image".to_string(),
            ));
        }

        let cli_args: BTreeMap<String, Option<String>> = match &opts.buildargs {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| KilnError::Input(format!("Invalid buildargs JSON: {}", e)))?,
            None => BTreeMap::new(),
        };
        let cli_labels: BTreeMap<String, String> = match &opts.labels {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| KilnError::Input(format!("Invalid labels JSON: {}", e)))?,
            None => BTreeMap::new(),
        };
        let existing_images = opts
            .existing_images
            .into_iter()
            .map(|v| {
                serde_json::from_value::<InstalledImage>(v)
                    .map_err(|e| KilnError::Input(format!("Invalid cached image entry: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let context_dir = opts.work_dir.join("context");
        let emit_stdout = opts.command_type == CommandType::Build;

        Ok(Self {
            work_dir: opts.work_dir,
            container_root: opts.container_root_dir,
            context_filepath: opts.context_filepath,
            dockerfile_name: opts.dockerfile,
            command_type: opts.command_type,
            zone_id: opts.uuid,
            existing_images,
            cli_labels,
            args: BuildArgs::new(cli_args),
            cache_enabled: !opts.nocache,
            suppress_success_msg: opts.suppress_success_msg,
            chown_uid: opts.chown_uid,
            chown_gid: opts.chown_gid,
            commit_image: opts.commit_image,
            commit_changes: opts.commit_changes,
            state: ImageState::new(),
            layers: Vec::new(),
            context_dir,
            cmd_set: false,
            cache_last_cmd_cached: true,
            had_cache_hit: false,
            emit_stdout,
        })
    }

    /// The session's scratch directory.
    pub fn work_dir(&self) -> &PathBuf {
        &self.work_dir
    }

    /// The directory the context archive extracts into.
    pub fn context_dir(&self) -> &PathBuf {
        &self.context_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_opts() -> SessionOptions {
        SessionOptions {
            work_dir: PathBuf::from("/tmp/work"),
            container_root_dir: PathBuf::from("/tmp/root"),
            context_filepath: Some(PathBuf::from("/tmp/ctx.tar")),
            uuid: "7b8f68a6-4342-49ae-9ac2-55ad7a08e477".to_string(),
            ..SessionOptions::default()
        }
    }

    #[test]
    fn test_build_requires_context() {
        let mut opts = build_opts();
        opts.context_filepath = None;
        let err = BuildSession::new(opts).unwrap_err();
        assert!(err.to_string().contains("context archive"));
    }

    #[test]
    fn test_commit_requires_starting_image() {
        let opts = SessionOptions {
            command_type: CommandType::Commit,
            ..build_opts()
        };
        let err = BuildSession::new(opts).unwrap_err();
        assert!(err.to_string().contains("starting image"));
    }

    #[test]
    fn test_json_options_parse() {
        let opts = SessionOptions {
            buildargs: Some(r#"{"VERSION": "1.0", "FLAG": null}"#.to_string()),
            labels: Some(r#"{"team": "infra"}"#.to_string()),
            ..build_opts()
        };
        let session = BuildSession::new(opts).unwrap();
        assert_eq!(
            session.args.unconsumed_cli(),
            vec!["FLAG".to_string(), "VERSION".to_string()]
        );
        assert_eq!(session.cli_labels.get("team").map(String::as_str), Some("infra"));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let opts = SessionOptions {
            buildargs: Some("not json".to_string()),
            ..build_opts()
        };
        assert!(BuildSession::new(opts).is_err());

        let opts = SessionOptions {
            labels: Some("[1,2]".to_string()),
            ..build_opts()
        };
        assert!(BuildSession::new(opts).is_err());
    }

    #[test]
    fn test_existing_images_parse() {
        let opts = SessionOptions {
            existing_images: vec![serde_json::json!({
                "Id": "cafe",
                "Config": {},
                "ContainerConfig": {"Image": "parent", "Cmd": ["/bin/sh"]}
            })],
            ..build_opts()
        };
        let session = BuildSession::new(opts).unwrap();
        assert_eq!(session.existing_images.len(), 1);
        assert_eq!(session.existing_images[0].container_config.image, "parent");
    }

    #[test]
    fn test_nocache_disables_cache() {
        let opts = SessionOptions {
            nocache: true,
            ..build_opts()
        };
        let session = BuildSession::new(opts).unwrap();
        assert!(!session.cache_enabled);
    }

    #[test]
    fn test_context_dir_under_work_dir() {
        let session = BuildSession::new(build_opts()).unwrap();
        assert_eq!(session.context_dir(), &PathBuf::from("/tmp/work/context"));
    }
}
