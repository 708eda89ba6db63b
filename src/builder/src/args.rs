//! Build-argument tracking.
//!
//! Two maps: `effective` holds every declared arg with its final value
//! (CLI value beats the Dockerfile default), `consumed` holds the args
//! both declared by ARG and supplied on the CLI. The well-known proxy
//! args are pre-registered and never need declaring. Whatever the CLI
//! supplied but no ARG consumed fails the build at the end.

use std::collections::BTreeMap;

/// Build args usable without an ARG declaration.
pub const PREDEFINED_ARGS: [&str; 8] = [
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "FTP_PROXY",
    "ftp_proxy",
    "NO_PROXY",
    "no_proxy",
];

#[derive(Debug, Clone, Default)]
pub struct BuildArgs {
    effective: BTreeMap<String, Option<String>>,
    consumed: BTreeMap<String, Option<String>>,
    pending_cli: BTreeMap<String, Option<String>>,
}

impl BuildArgs {
    pub fn new(cli: BTreeMap<String, Option<String>>) -> Self {
        let mut args = Self {
            effective: BTreeMap::new(),
            consumed: BTreeMap::new(),
            pending_cli: cli,
        };
        for name in PREDEFINED_ARGS {
            match args.pending_cli.remove(name) {
                Some(value) => {
                    args.consumed.insert(name.to_string(), value.clone());
                    args.effective.insert(name.to_string(), value);
                }
                None => {
                    args.effective.insert(name.to_string(), None);
                }
            }
        }
        args
    }

    /// Register an ARG declaration. A CLI-supplied value wins over the
    /// default, marks the arg consumed, and leaves the pending set.
    pub fn declare(&mut self, name: &str, default: Option<String>) {
        match self.pending_cli.remove(name) {
            Some(cli_value) => {
                self.consumed.insert(name.to_string(), cli_value.clone());
                self.effective.insert(name.to_string(), cli_value.or(default));
            }
            None => {
                self.effective.insert(name.to_string(), default);
            }
        }
    }

    /// `K=V` entries for every arg with a value, sorted by key.
    pub fn live_entries(&self) -> Vec<String> {
        self.effective
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| format!("{}={}", k, v)))
            .collect()
    }

    /// CLI-supplied args no ARG declaration has consumed yet.
    pub fn unconsumed_cli(&self) -> Vec<String> {
        self.pending_cli.keys().cloned().collect()
    }

    pub fn effective(&self) -> &BTreeMap<String, Option<String>> {
        &self.effective
    }

    pub fn consumed(&self) -> &BTreeMap<String, Option<String>> {
        &self.consumed
    }
}
