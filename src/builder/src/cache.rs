//! Per-step build cache.
//!
//! Every instruction gets a synthetic "nop" command line; a previously
//! built image is a hit when it shares the current parent id, the exact
//! nop command, and the current labels. The nop strings are a
//! compatibility surface and must stay byte-identical across runs.

use std::collections::BTreeMap;

use crate::dockerfile::{Instruction, InstructionKind};
use crate::image::{self, InstalledImage};

/// Compute the synthetic nop command for an instruction.
///
/// `run_args` is the sorted `K=V` list of build args with values (only
/// consulted for RUN); `copy_hash` is the per-step composite content hash
/// (only consulted for ADD/COPY).
pub fn nop_cmd(instr: &Instruction, run_args: &[String], copy_hash: Option<&str>) -> Vec<String> {
    match &instr.kind {
        InstructionKind::Run(form) => {
            let mut cmd = Vec::new();
            if !run_args.is_empty() {
                cmd.push(format!("|{}", run_args.len()));
                cmd.extend(run_args.iter().cloned());
            }
            cmd.extend(form.as_config_cmd());
            cmd
        }
        InstructionKind::Add(args) | InstructionKind::Copy(args) => {
            let dest = args.last().map(String::as_str).unwrap_or("");
            shell_nop(format!(
                "#(nop) {} {} in {}",
                instr.name(),
                copy_hash.unwrap_or(""),
                dest
            ))
        }
        InstructionKind::Cmd(form) | InstructionKind::Entrypoint(form) => shell_nop(format!(
            "#(nop) {} {}",
            instr.name(),
            render_argv(&form.as_config_cmd())
        )),
        InstructionKind::Expose(args) => {
            // The key carries the flattened port set the step produces.
            // Unparsable args keep their raw form; the main hook fails
            // the step with the real error before they could matter.
            let rendered = match image::expose_port_list(args) {
                Ok(ports) => ports.join(" "),
                Err(_) => args.join(" "),
            };
            shell_nop(format!("#(nop) EXPOSE {}", rendered))
        }
        _ => shell_nop(format!("#(nop) {} {}", instr.name(), instr.nop_args())),
    }
}

/// Find the first cached image matching the current parent, nop command,
/// and labels. Candidate order is the caller's input order.
pub fn probe<'a>(
    existing: &'a [InstalledImage],
    parent: Option<&str>,
    nop: &[String],
    labels: Option<&BTreeMap<String, String>>,
) -> Option<&'a InstalledImage> {
    let parent = parent.unwrap_or("");
    let hit = existing.iter().find(|candidate| {
        candidate.container_config.image == parent
            && candidate.container_config.cmd.as_deref() == Some(nop)
            && labels_eq(candidate.config.labels.as_ref(), labels)
    });
    match hit {
        Some(image) => tracing::debug!(id = %image.id, "cache candidate matched"),
        None => tracing::debug!(parent = %parent, "no cache candidate matched"),
    }
    hit
}

fn shell_nop(line: String) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), line]
}

/// Render an argv the way the nop line for CMD/ENTRYPOINT spells it:
/// `["a" "b"]` with each element double-quoted.
fn render_argv(argv: &[String]) -> String {
    let quoted: Vec<String> = argv.iter().map(|a| format!("{:?}", a)).collect();
    format!("[{}]", quoted.join(" "))
}

/// Missing and empty label maps compare equal.
fn labels_eq(
    a: Option<&BTreeMap<String, String>>,
    b: Option<&BTreeMap<String, String>>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        (Some(m), None) | (None, Some(m)) => m.is_empty(),
    }
}
