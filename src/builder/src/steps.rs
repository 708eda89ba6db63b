//! Per-instruction hooks.
//!
//! The pre-hook normalizes arguments and populates the step context
//! (copy inventory, nop command); the main hook applies the
//! instruction's effect to the image state, emitting host tasks where
//! the filesystem or container is involved.

use std::collections::BTreeMap;

use kiln_core::error::{KilnError, Result};
use kiln_core::event::{BuildEvent, EventSender};
use kiln_core::task::ImageRef;

use crate::cache;
use crate::context::{self, CopyInfo, InventoryRequest};
use crate::copy::CopyJob;
use crate::dockerfile::{Instruction, InstructionKind, ShellForm};
use crate::image::{self, HistoryEntry};
use crate::session::BuildSession;

/// Per-step scratch state shared between the hooks.
#[derive(Debug, Default)]
pub(crate) struct StepCtx {
    pub copy_infos: Vec<CopyInfo>,
    pub copy_hash: Option<String>,
    pub nop: Vec<String>,
}

/// Reject triggers that may not be stored or replayed.
pub(crate) fn validate_trigger(instr: &Instruction) -> Result<()> {
    match &instr.kind {
        InstructionKind::Onbuild(_) => Err(KilnError::Input(
            "Chaining ONBUILD via `ONBUILD ONBUILD` isn't allowed".to_string(),
        )),
        InstructionKind::From(_) | InstructionKind::Maintainer(_) => Err(KilnError::Input(
            format!("{} isn't allowed as an ONBUILD trigger", instr.name()),
        )),
        _ => Ok(()),
    }
}

impl BuildSession {
    /// Normalize arguments and compute the step's inventory and nop
    /// command.
    pub(crate) fn pre_hook(&self, instr: &Instruction) -> Result<StepCtx> {
        let mut ctx = StepCtx::default();
        match &instr.kind {
            InstructionKind::Add(args) | InstructionKind::Copy(args) => {
                let remote_capable = matches!(instr.kind, InstructionKind::Add(_));
                let infos = context::get_copy_info(&InventoryRequest {
                    cmd_name: instr.name(),
                    args,
                    working_dir: &self.state.config.working_dir,
                    context_dir: &self.context_dir,
                    container_root: &self.container_root,
                    allow_remote: remote_capable,
                    allow_decompress: remote_capable,
                })?;
                ctx.copy_hash = Some(context::composite_hash(&infos));
                ctx.copy_infos = infos;
            }
            InstructionKind::Onbuild(inner) => validate_trigger(inner)?,
            _ => {}
        }
        ctx.nop = cache::nop_cmd(instr, &self.args.live_entries(), ctx.copy_hash.as_deref());
        Ok(ctx)
    }

    /// Apply the instruction's effect. Returns the ONBUILD triggers a
    /// FROM lifted out of its base image, if any.
    pub(crate) async fn main_hook(
        &mut self,
        instr: &Instruction,
        ctx: &StepCtx,
        events: &EventSender,
    ) -> Result<Vec<String>> {
        match &instr.kind {
            InstructionKind::From(base) => return self.handle_from(base, events).await,
            InstructionKind::Maintainer(author) => {
                self.state.author = author.clone();
            }
            InstructionKind::Label(pairs) => {
                let labels = self.state.config.labels.get_or_insert_with(BTreeMap::new);
                for (key, value) in pairs {
                    labels.insert(key.clone(), value.clone());
                }
            }
            InstructionKind::Env(pairs) => {
                for (key, value) in pairs {
                    self.state.config.env_set(key, value);
                }
            }
            InstructionKind::Arg { name, default } => {
                self.args.declare(name, default.clone());
            }
            InstructionKind::Expose(ports) => self.handle_expose(ports)?,
            InstructionKind::Volume(volumes) => {
                for volume in volumes {
                    if volume.is_empty() {
                        return Err(KilnError::Input(
                            "Volume specified can not be an empty string".to_string(),
                        ));
                    }
                    self.state
                        .config
                        .volumes
                        .get_or_insert_with(BTreeMap::new)
                        .insert(volume.clone(), serde_json::json!({}));
                }
            }
            InstructionKind::User(user) => {
                self.state.config.user = user.clone();
            }
            InstructionKind::Workdir(dir) => {
                self.state.config.working_dir =
                    normalize_workdir(&self.state.config.working_dir, dir);
            }
            InstructionKind::Cmd(form) => {
                self.state.config.cmd = Some(form.as_config_cmd());
                self.cmd_set = true;
            }
            InstructionKind::Entrypoint(form) => {
                self.state.config.entrypoint = Some(form.as_config_cmd());
                // ENTRYPOINT resets Cmd unless this build set it.
                if !self.cmd_set {
                    self.state.config.cmd = None;
                }
            }
            InstructionKind::StopSignal(signal) => {
                self.state.config.stop_signal = Some(signal.clone());
            }
            InstructionKind::Onbuild(inner) => {
                self.state
                    .config
                    .on_build
                    .get_or_insert_with(Vec::new)
                    .push(inner.raw.clone());
            }
            InstructionKind::Add(_) | InstructionKind::Copy(_) => {
                self.handle_copy(instr, ctx, events).await?;
            }
            InstructionKind::Run(form) => self.handle_run(form, events).await?,
        }
        Ok(Vec::new())
    }

    async fn handle_from(&mut self, base: &str, events: &EventSender) -> Result<Vec<String>> {
        let mut triggers = Vec::new();
        if base == "scratch" {
            self.state.id = None;
            self.state.parent = None;
        } else {
            let payload = events
                .image_reprovision(ImageRef::Name(base.to_string()), "FROM")
                .await?;
            let installed = image::parse_reprovision_payload(&payload)?;
            tracing::debug!(base = %base, id = %installed.id, "base image installed");
            self.state.config = installed.config;
            self.state.container_config = installed.container_config;
            self.state.id = Some(installed.id);
            if let Some(lifted) = self.state.config.on_build.take() {
                triggers = lifted;
            }
            events.send(BuildEvent::ImageReprovisioned {
                id: self.state.id.clone(),
            });
        }
        if !self.cli_labels.is_empty() {
            let labels = self.state.config.labels.get_or_insert_with(BTreeMap::new);
            for (key, value) in &self.cli_labels {
                labels.insert(key.clone(), value.clone());
            }
        }
        Ok(triggers)
    }

    fn handle_expose(&mut self, ports: &[String]) -> Result<()> {
        let expanded = image::expose_port_list(ports)?;
        let set = self
            .state
            .config
            .exposed_ports
            .get_or_insert_with(BTreeMap::new);
        for port in expanded {
            set.insert(port, serde_json::json!({}));
        }
        Ok(())
    }

    async fn handle_copy(
        &self,
        instr: &Instruction,
        ctx: &StepCtx,
        events: &EventSender,
    ) -> Result<()> {
        let args = match &instr.kind {
            InstructionKind::Add(args) | InstructionKind::Copy(args) => args,
            _ => return Ok(()),
        };
        let dest_raw = args.last().map(String::as_str).unwrap_or("");
        let archive = self.context_filepath.as_deref().ok_or_else(|| {
            KilnError::Input("no build context available for file copies".to_string())
        })?;
        let job = CopyJob {
            events,
            cmd_name: instr.name(),
            context_archive: archive,
            context_dir: &self.context_dir,
            container_root: &self.container_root,
            chown_uid: self.chown_uid,
            chown_gid: self.chown_gid,
        };
        job.materialize(&ctx.copy_infos, dest_raw).await
    }

    async fn handle_run(&self, form: &ShellForm, events: &EventSender) -> Result<()> {
        let argv = form.as_run_argv();
        let env = self.run_env();
        let workdir = if self.state.config.working_dir.is_empty() {
            "/".to_string()
        } else {
            self.state.config.working_dir.clone()
        };
        self.emit(
            events,
            format!(" ---> Running in {}\n", image::short_zone_id(&self.zone_id)),
        );
        let output = events
            .run(argv.clone(), env, workdir, self.state.config.user.clone())
            .await?;
        if output.exit_code != 0 {
            return Err(KilnError::ExecFailure {
                command: argv.join(" "),
                code: output.exit_code,
            });
        }
        Ok(())
    }

    /// Environment for a `run` task: the image env, then build args with
    /// values, then a default PATH when none is present.
    fn run_env(&self) -> Vec<String> {
        let mut env: Vec<String> = self.state.config.env_entries().to_vec();
        for entry in self.args.live_entries() {
            let key = entry.split_once('=').map(|(k, _)| k).unwrap_or("");
            if image::env_get(&env, key).is_none() {
                env.push(entry);
            }
        }
        if image::env_get(&env, "PATH").is_none() {
            env.push(format!("PATH={}", image::DEFAULT_PATH));
        }
        env
    }

    /// The environment variable expansion sees: the image env first (it
    /// wins on collision), then the effective build args.
    pub(crate) fn expansion_env(&self) -> Vec<String> {
        let mut envs: Vec<String> = self.state.config.env_entries().to_vec();
        envs.extend(self.args.live_entries());
        envs
    }

    /// Record the post-hook state: image lineage fields, the synthetic
    /// container config, the history entry, and the layer snapshot.
    pub(crate) fn append_layer(&mut self, instr: &Instruction, ctx: &StepCtx, cached: bool) {
        let parent_id = self.state.parent.clone().unwrap_or_default();
        self.state.config.image = parent_id;
        if !cached {
            self.state.created = Some(image::now_timestamp());
        }
        self.state.container_config = self.state.config.clone();
        self.state.container_config.cmd = Some(ctx.nop.clone());
        self.state.history.push(HistoryEntry {
            created: self.state.created.clone().unwrap_or_default(),
            created_by: ctx.nop.join(" "),
            empty_layer: !matches!(
                instr.kind,
                InstructionKind::Add(_) | InstructionKind::Copy(_) | InstructionKind::Run(_)
            ),
        });
        self.layers.push(crate::image::Layer {
            cmd: instr.raw.clone(),
            image: self.state.clone(),
        });
    }
}

/// WORKDIR path resolution: absolute arguments replace, relative ones
/// join; `.` and `..` collapse with `..` clamped at `/`; the result
/// never keeps a trailing slash (except `/` itself).
fn normalize_workdir(current: &str, arg: &str) -> String {
    let joined = if arg.starts_with('/') {
        arg.to_string()
    } else {
        format!("{}/{}", current.trim_end_matches('/'), arg)
    };
    let mut parts: Vec<&str> = Vec::new();
    for comp in joined.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_workdir_absolute_replaces() {
        assert_eq!(normalize_workdir("/app", "/usr/src"), "/usr/src");
    }

    #[test]
    fn test_normalize_workdir_relative_joins() {
        assert_eq!(normalize_workdir("/app", "src"), "/app/src");
        assert_eq!(normalize_workdir("", "app"), "/app");
    }

    #[test]
    fn test_normalize_workdir_collapses_dots() {
        assert_eq!(normalize_workdir("", "/test/../foo/"), "/foo");
        assert_eq!(normalize_workdir("/a", "./b/./c"), "/a/b/c");
        assert_eq!(normalize_workdir("/a/b", ".."), "/a");
    }

    #[test]
    fn test_normalize_workdir_clamps_at_root() {
        assert_eq!(normalize_workdir("/", "../../.."), "/");
        assert_eq!(normalize_workdir("/a", "/../../x"), "/x");
    }

    #[test]
    fn test_validate_trigger() {
        let chained = crate::dockerfile::parse_line("ONBUILD RUN /x", 1).unwrap();
        let inner = match chained.kind {
            InstructionKind::Onbuild(inner) => *inner,
            _ => unreachable!(),
        };
        assert!(validate_trigger(&inner).is_ok());

        let from = crate::dockerfile::parse_line("FROM scratch", 1).unwrap();
        let err = validate_trigger(&from).unwrap_err();
        assert!(err.to_string().contains("FROM isn't allowed as an ONBUILD trigger"));

        let maintainer = crate::dockerfile::parse_line("MAINTAINER jo", 1).unwrap();
        assert!(validate_trigger(&maintainer).is_err());

        let nested = crate::dockerfile::parse_line("ONBUILD ONBUILD RUN /x", 1);
        // The nested ONBUILD parses; rejection happens on validation.
        let inner = match nested.unwrap().kind {
            InstructionKind::Onbuild(inner) => *inner,
            _ => unreachable!(),
        };
        let err = validate_trigger(&inner).unwrap_err();
        assert!(err.to_string().contains("Chaining ONBUILD"));
    }
}
