//! Build event stream.
//!
//! A build session emits an ordered stream of events: human-readable
//! stdout progress, host tasks, reprovision completions, and a terminal
//! end event. Tasks carry non-clonable oneshot reply handles, so the
//! stream is a single-consumer mpsc queue rather than a broadcast.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{KilnError, Result};
use crate::task::{
    ExtractRequest, ExtractSpec, HostTask, ImageRef, ReprovisionRequest, RunOutput, RunRequest,
    TaskReply,
};

/// One observable build event.
#[derive(Debug)]
pub enum BuildEvent {
    /// Human-readable build progress destined for the client's stdout.
    Stdout(String),
    /// A request the host must fulfil before the build continues.
    Task(HostTask),
    /// The builder finished applying a reprovision result; the host may
    /// resume file operations against the container root.
    ImageReprovisioned { id: Option<String> },
    /// Terminal event; carries the failure message when the build aborted.
    End(Option<String>),
}

/// Sending half of a build event stream.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<BuildEvent>,
}

impl EventSender {
    /// Create a connected sender/receiver pair.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BuildEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event. A missing receiver is not an error: an aborted
    /// session simply stops consuming and the build unwinds on the next
    /// task await.
    pub fn send(&self, event: BuildEvent) {
        let _ = self.tx.send(event);
    }

    /// Emit a stdout progress message.
    pub fn stdout(&self, message: impl Into<String>) {
        self.send(BuildEvent::Stdout(message.into()));
    }

    /// Dispatch an `extract_tarfile` task and wait for the host.
    pub async fn extract_tarfile(&self, spec: ExtractSpec) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(BuildEvent::Task(HostTask::ExtractTarfile(ExtractRequest {
            spec,
            reply,
        })));
        flatten(rx.await)
    }

    /// Dispatch an `image_reprovision` task and wait for the host's image
    /// payload.
    pub async fn image_reprovision(&self, image: ImageRef, cmd_name: &str) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.send(BuildEvent::Task(HostTask::ImageReprovision(
            ReprovisionRequest {
                image,
                cmd_name: cmd_name.to_string(),
                reply,
            },
        )));
        flatten(rx.await)
    }

    /// Dispatch a `run` task and wait for the command's outcome.
    pub async fn run(
        &self,
        cmd: Vec<String>,
        env: Vec<String>,
        workdir: String,
        user: String,
    ) -> Result<RunOutput> {
        let (reply, rx) = oneshot::channel();
        self.send(BuildEvent::Task(HostTask::Run(RunRequest {
            cmd,
            env,
            workdir,
            user,
            reply,
        })));
        flatten(rx.await)
    }
}

fn flatten<T>(recv: std::result::Result<TaskReply<T>, oneshot::error::RecvError>) -> Result<T> {
    match recv {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(host_err)) => Err(KilnError::TaskFailure(host_err)),
        Err(_) => Err(KilnError::TaskFailure(
            "host abandoned the task without a reply".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_stdout_events_arrive_in_order() {
        let (events, mut rx) = EventSender::channel();
        events.stdout("one\n");
        events.stdout("two\n");

        match rx.recv().await.unwrap() {
            BuildEvent::Stdout(msg) => assert_eq!(msg, "one\n"),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            BuildEvent::Stdout(msg) => assert_eq!(msg, "two\n"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_extract_round_trip() {
        let (events, mut rx) = EventSender::channel();

        let host = tokio::spawn(async move {
            match rx.recv().await.unwrap() {
                BuildEvent::Task(HostTask::ExtractTarfile(req)) => {
                    assert_eq!(req.spec.tarfile, PathBuf::from("/tmp/ctx.tar"));
                    req.reply.send(Ok(())).unwrap();
                }
                other => panic!("unexpected event: {:?}", other),
            }
        });

        events
            .extract_tarfile(ExtractSpec {
                tarfile: PathBuf::from("/tmp/ctx.tar"),
                extract_dir: PathBuf::from("/tmp/out"),
                strip_dir_count: None,
                replace_pattern: None,
                paths: None,
                compression: None,
            })
            .await
            .unwrap();

        host.await.unwrap();
    }

    #[tokio::test]
    async fn test_host_error_becomes_task_failure() {
        let (events, mut rx) = EventSender::channel();

        tokio::spawn(async move {
            match rx.recv().await.unwrap() {
                BuildEvent::Task(HostTask::Run(req)) => {
                    req.reply.send(Err("zone is gone".to_string())).unwrap();
                }
                other => panic!("unexpected event: {:?}", other),
            }
        });

        let err = events
            .run(vec!["/bin/true".to_string()], Vec::new(), "/".to_string(), String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::TaskFailure(_)));
        assert!(err.to_string().contains("zone is gone"));
    }

    #[tokio::test]
    async fn test_dropped_reply_becomes_task_failure() {
        let (events, mut rx) = EventSender::channel();

        tokio::spawn(async move {
            match rx.recv().await.unwrap() {
                BuildEvent::Task(HostTask::Run(req)) => drop(req.reply),
                other => panic!("unexpected event: {:?}", other),
            }
        });

        let err = events
            .run(vec!["/bin/true".to_string()], Vec::new(), "/".to_string(), String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::TaskFailure(_)));
    }
}
