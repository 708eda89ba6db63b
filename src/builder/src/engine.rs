//! Build driver.
//!
//! The top-level state machine: extract the context, read and parse the
//! Dockerfile, then run every instruction through the hook pipeline
//! (pre-hook, variable expansion, cache probe, main hook, layer append),
//! replaying ONBUILD triggers inline. Commit mode skips the context and
//! applies caller-supplied change lines to a starting image.

use kiln_core::error::{KilnError, Result};
use kiln_core::event::{BuildEvent, EventSender};
use kiln_core::task::{ExtractSpec, ImageRef};

use crate::cache;
use crate::dockerfile::{self, Instruction, InstructionKind};
use crate::image::{self, ImageState, Layer};
use crate::safepath;
use crate::session::{BuildSession, CommandType};
use crate::steps::{validate_trigger, StepCtx};

/// Largest Dockerfile accepted after context extraction.
pub const MAX_DOCKERFILE_SIZE: u64 = 10 * 1024 * 1024;

pub const DEFAULT_DOCKERFILE_NAME: &str = "Dockerfile";

/// Outcome of a successful run.
#[derive(Debug)]
pub struct BuildResult {
    /// Final image id.
    pub image_id: Option<String>,
    /// Final image state.
    pub image: ImageState,
    /// One layer per processed instruction, ONBUILD replays included.
    pub layers: Vec<Layer>,
}

impl BuildSession {
    /// Run the session to completion, emitting events along the way. The
    /// terminal `end` event always fires, carrying the failure message
    /// when the pipeline aborted.
    pub async fn run(mut self, events: EventSender) -> Result<BuildResult> {
        match self.execute(&events).await {
            Ok(()) => {
                events.send(BuildEvent::End(None));
                Ok(BuildResult {
                    image_id: self.state.id.clone(),
                    image: self.state,
                    layers: self.layers,
                })
            }
            Err(err) => {
                let message = err.to_string();
                self.emit(&events, format!("ERROR: {}\n", message));
                events.send(BuildEvent::End(Some(message)));
                Err(err)
            }
        }
    }

    async fn execute(&mut self, events: &EventSender) -> Result<()> {
        match self.command_type {
            CommandType::Build => self.execute_build(events).await,
            CommandType::Commit => self.execute_commit(events).await,
        }
    }

    async fn execute_build(&mut self, events: &EventSender) -> Result<()> {
        self.extract_context(events).await?;
        let content = self.read_dockerfile()?;
        let instructions = dockerfile::parse(&content)?;
        if instructions.is_empty() {
            return Err(KilnError::Input("Dockerfile is empty".to_string()));
        }
        if !matches!(instructions[0].kind, InstructionKind::From(_)) {
            return Err(KilnError::Input(
                "Please provide a source image with `from` prior to commit".to_string(),
            ));
        }

        let total = instructions.len();
        for (idx, instr) in instructions.into_iter().enumerate() {
            let step_no = idx + 1;
            let triggers = self.run_step(step_no, total, instr, events).await?;
            if !triggers.is_empty() {
                self.emit(
                    events,
                    format!("# Executing {} build triggers\n", triggers.len()),
                );
                for raw in triggers {
                    let trigger = dockerfile::parse_line(&raw, 0)?;
                    validate_trigger(&trigger)?;
                    // Triggers cannot be FROM, so they cannot nest.
                    self.run_step(step_no, total, trigger, events).await?;
                }
            }
        }

        let pending = self.args.unconsumed_cli();
        if !pending.is_empty() {
            return Err(KilnError::UnconsumedBuildArg(pending.join(", ")));
        }
        if self.state.id.is_none() {
            return Err(KilnError::Input(
                "No image was generated. Is your Dockerfile empty?".to_string(),
            ));
        }

        if !self.suppress_success_msg {
            let short = self.state.short_id().unwrap_or_default().to_string();
            self.emit(events, format!("Successfully built {}\n", short));
        }
        Ok(())
    }

    async fn execute_commit(&mut self, events: &EventSender) -> Result<()> {
        let payload = self
            .commit_image
            .clone()
            .ok_or_else(|| KilnError::Input("commit requires a starting image".to_string()))?;
        let installed = image::parse_reprovision_payload(&payload)?;
        self.state.config = installed.config;
        self.state.container_config = installed.container_config;
        self.state.id = Some(installed.id);

        let changes = self.commit_changes.clone();
        let total = changes.len();
        for (idx, line) in changes.iter().enumerate() {
            let instr = dockerfile::parse_line(line, idx + 1)?;
            if matches!(
                instr.kind,
                InstructionKind::Add(_)
                    | InstructionKind::Arg { .. }
                    | InstructionKind::Copy(_)
                    | InstructionKind::From(_)
                    | InstructionKind::Maintainer(_)
                    | InstructionKind::Run(_)
            ) {
                return Err(KilnError::Input(format!(
                    "{} is not a valid change command",
                    instr.name()
                )));
            }
            self.run_step(idx + 1, total, instr, events).await?;
        }
        Ok(())
    }

    /// One step of the pipeline. Returns the ONBUILD triggers a FROM
    /// lifted out of its base image.
    async fn run_step(
        &mut self,
        step_no: usize,
        total: usize,
        mut instr: Instruction,
        events: &EventSender,
    ) -> Result<Vec<String>> {
        self.state.parent = self.state.id.clone();
        self.state.id = Some(image::new_image_id());
        self.emit(events, format!("Step {}/{} : {}\n", step_no, total, instr.raw));

        if instr.expands_variables() {
            let envs = self.expansion_env();
            instr.expand(&envs)?;
        }

        let ctx: StepCtx = self.pre_hook(&instr)?;

        // Cache probe; FROM is never probed.
        let mut cached = false;
        if self.cache_enabled && !matches!(instr.kind, InstructionKind::From(_)) {
            let hit = cache::probe(
                &self.existing_images,
                self.state.parent.as_deref(),
                &ctx.nop,
                self.state.config.labels.as_ref(),
            )
            .cloned();
            match hit {
                Some(hit) => {
                    self.emit(events, " ---> Using cache\n".to_string());
                    self.state.config = hit.config;
                    self.state.container_config = hit.container_config;
                    self.state.id = Some(hit.id);
                    self.state.created = hit.created;
                    self.had_cache_hit = true;
                    self.cache_last_cmd_cached = true;
                    cached = true;
                }
                None => {
                    // First miss after a streak of hits: the host never
                    // materialized the cached filesystems, so restore it
                    // to the last cached image before running anything.
                    if self.had_cache_hit && self.cache_last_cmd_cached {
                        if let Some(parent) = self.state.parent.clone() {
                            events
                                .image_reprovision(ImageRef::Id(parent.clone()), instr.name())
                                .await?;
                            events.send(BuildEvent::ImageReprovisioned { id: Some(parent) });
                        }
                    }
                    self.cache_last_cmd_cached = false;
                }
            }
        }

        // Main hook; ARG re-executes even on a hit so CLI consumption
        // stays exact.
        let mut triggers = Vec::new();
        if !cached || matches!(instr.kind, InstructionKind::Arg { .. }) {
            triggers = self.main_hook(&instr, &ctx, events).await?;
        }

        self.append_layer(&instr, &ctx, cached);

        match self.state.short_id() {
            Some(short) => {
                let line = format!(" ---> {}\n", short);
                self.emit(events, line);
            }
            None => self.emit(events, " --->\n".to_string()),
        }

        Ok(triggers)
    }

    async fn extract_context(&mut self, events: &EventSender) -> Result<()> {
        let archive = self
            .context_filepath
            .clone()
            .ok_or_else(|| KilnError::Input("build requires a context archive".to_string()))?;
        std::fs::create_dir_all(&self.context_dir)?;
        std::fs::create_dir_all(&self.container_root)?;
        tracing::debug!(
            archive = %archive.display(),
            context = %self.context_dir.display(),
            "extracting build context"
        );
        events
            .extract_tarfile(ExtractSpec {
                tarfile: archive,
                extract_dir: self.context_dir.clone(),
                strip_dir_count: None,
                replace_pattern: None,
                paths: None,
                compression: None,
            })
            .await
    }

    /// Locate the Dockerfile inside the extracted context (a symlinked
    /// Dockerfile may not escape it), falling back from `Dockerfile` to
    /// `dockerfile`, and size-check it.
    fn read_dockerfile(&self) -> Result<String> {
        let requested = self
            .dockerfile_name
            .clone()
            .unwrap_or_else(|| DEFAULT_DOCKERFILE_NAME.to_string());
        let mut scoped = safepath::resolve_under_root(&format!("/{}", requested), &self.context_dir)?;
        if !scoped.host.is_file() && requested == DEFAULT_DOCKERFILE_NAME {
            scoped = safepath::resolve_under_root("/dockerfile", &self.context_dir)?;
        }
        if !scoped.host.is_file() {
            return Err(KilnError::Input(format!(
                "Cannot locate specified Dockerfile: {}",
                requested
            )));
        }

        let size = std::fs::metadata(&scoped.host)?.len();
        if size > MAX_DOCKERFILE_SIZE {
            return Err(KilnError::Input(format!(
                "Dockerfile exceeds the maximum size of {} bytes",
                MAX_DOCKERFILE_SIZE
            )));
        }
        Ok(std::fs::read_to_string(&scoped.host)?)
    }

    /// Stdout progress goes to the event stream in build mode only.
    pub(crate) fn emit(&self, events: &EventSender, message: String) {
        if self.emit_stdout {
            events.stdout(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionOptions;

    fn session_at(work: &std::path::Path, container: &std::path::Path) -> BuildSession {
        BuildSession::new(SessionOptions {
            work_dir: work.to_path_buf(),
            container_root_dir: container.to_path_buf(),
            context_filepath: Some(work.join("ctx.tar")),
            uuid: "7b8f68a6-4342-49ae-9ac2-55ad7a08e477".to_string(),
            ..SessionOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn test_read_dockerfile_default_and_fallback() {
        let work = tempfile::TempDir::new().unwrap();
        let container = tempfile::TempDir::new().unwrap();
        let session = session_at(work.path(), container.path());
        std::fs::create_dir_all(session.context_dir()).unwrap();

        let err = session.read_dockerfile().unwrap_err();
        assert!(err
            .to_string()
            .contains("Cannot locate specified Dockerfile: Dockerfile"));

        std::fs::write(session.context_dir().join("dockerfile"), "FROM scratch\n").unwrap();
        assert_eq!(session.read_dockerfile().unwrap(), "FROM scratch\n");

        std::fs::write(session.context_dir().join("Dockerfile"), "FROM base\n").unwrap();
        assert_eq!(session.read_dockerfile().unwrap(), "FROM base\n");
    }

    #[test]
    fn test_read_dockerfile_custom_name_has_no_fallback() {
        let work = tempfile::TempDir::new().unwrap();
        let container = tempfile::TempDir::new().unwrap();
        let mut session = session_at(work.path(), container.path());
        session.dockerfile_name = Some("Dockerfile.prod".to_string());
        std::fs::create_dir_all(session.context_dir()).unwrap();
        std::fs::write(session.context_dir().join("dockerfile"), "FROM scratch\n").unwrap();

        let err = session.read_dockerfile().unwrap_err();
        assert!(err.to_string().contains("Dockerfile.prod"));
    }

    #[test]
    fn test_dockerfile_size_boundary() {
        let work = tempfile::TempDir::new().unwrap();
        let container = tempfile::TempDir::new().unwrap();
        let session = session_at(work.path(), container.path());
        std::fs::create_dir_all(session.context_dir()).unwrap();

        let header = "FROM scratch\nWORKDIR /x\n";
        let mut content = String::from(header);
        content.push('#');
        while content.len() < MAX_DOCKERFILE_SIZE as usize {
            content.push('y');
        }
        assert_eq!(content.len() as u64, MAX_DOCKERFILE_SIZE);
        std::fs::write(session.context_dir().join("Dockerfile"), &content).unwrap();
        assert!(session.read_dockerfile().is_ok());

        content.push('!');
        std::fs::write(session.context_dir().join("Dockerfile"), &content).unwrap();
        let err = session.read_dockerfile().unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum size"));
    }

    #[test]
    fn test_dockerfile_symlink_cannot_escape_context() {
        let work = tempfile::TempDir::new().unwrap();
        let container = tempfile::TempDir::new().unwrap();
        let session = session_at(work.path(), container.path());
        std::fs::create_dir_all(session.context_dir()).unwrap();

        // A link pointing far above the context clamps to the context
        // root, where no Dockerfile exists.
        std::os::unix::fs::symlink(
            "/../../outside/Dockerfile",
            session.context_dir().join("Dockerfile"),
        )
        .unwrap();
        std::fs::write(work.path().join("outside-Dockerfile"), "FROM scratch\n").unwrap();
        assert!(session.read_dockerfile().is_err());
    }

    #[test]
    fn test_emit_respects_command_type() {
        let work = tempfile::TempDir::new().unwrap();
        let container = tempfile::TempDir::new().unwrap();
        let mut session = session_at(work.path(), container.path());
        session.emit_stdout = false;

        let (events, mut rx) = kiln_core::event::EventSender::channel();
        session.emit(&events, "hidden\n".to_string());
        drop(events);
        assert!(rx.try_recv().is_err());
    }
}
