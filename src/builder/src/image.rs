//! Image configuration and build-time image state.
//!
//! `ImageConfig` is the canonical Docker image config with its wire field
//! names. Unset collection fields stay `None` and serialize as JSON null,
//! never as empty collections. `ImageState` is the mutable image being
//! built; a deep copy of it is snapshotted into a `Layer` after every
//! instruction.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use kiln_core::error::{KilnError, Result};

/// Only supported target.
pub const ARCHITECTURE: &str = "amd64";
pub const OS: &str = "linux";

/// PATH injected into `run` tasks when the image config carries none.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Docker image configuration (the `Config` / `ContainerConfig` shape).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageConfig {
    pub attach_stdin: bool,
    pub attach_stderr: bool,
    pub attach_stdout: bool,
    pub cmd: Option<Vec<String>>,
    pub domainname: String,
    pub entrypoint: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    pub exposed_ports: Option<BTreeMap<String, Value>>,
    pub hostname: String,
    pub image: String,
    pub labels: Option<BTreeMap<String, String>>,
    pub on_build: Option<Vec<String>>,
    pub open_stdin: bool,
    pub stdin_once: bool,
    pub stop_signal: Option<String>,
    pub tty: bool,
    pub user: String,
    pub volumes: Option<BTreeMap<String, Value>>,
    pub working_dir: String,
}

impl ImageConfig {
    /// Insert or replace an environment entry; entries match on their
    /// `KEY=` prefix.
    pub fn env_set(&mut self, key: &str, value: &str) {
        let entry = format!("{}={}", key, value);
        let envs = self.env.get_or_insert_with(Vec::new);
        let prefix = format!("{}=", key);
        if let Some(existing) = envs.iter_mut().find(|e| e.starts_with(&prefix)) {
            *existing = entry;
        } else {
            envs.push(entry);
        }
    }

    /// Environment entries as a slice (empty when unset).
    pub fn env_entries(&self) -> &[String] {
        self.env.as_deref().unwrap_or(&[])
    }
}

/// Flatten EXPOSE arguments into `port/proto` entries: lowercased,
/// `tcp` by default, `-` ranges expanded inclusive. This list is what
/// lands in `config.ExposedPorts` and what the step's cache key renders.
pub fn expose_port_list(args: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for arg in args {
        let lowered = arg.to_lowercase();
        let (port_part, proto) = match lowered.split_once('/') {
            Some((port, proto)) => (port.to_string(), proto.to_string()),
            None => (lowered.clone(), "tcp".to_string()),
        };
        let (begin, end) = match port_part.split_once('-') {
            Some((b, e)) => {
                let begin: u32 = b
                    .parse()
                    .map_err(|_| KilnError::Input(format!("Invalid port range: {}", arg)))?;
                let end: u32 = e
                    .parse()
                    .map_err(|_| KilnError::Input(format!("Invalid port range: {}", arg)))?;
                if end < begin {
                    return Err(KilnError::Input(format!("Invalid port range: {}", arg)));
                }
                (begin, end)
            }
            None => {
                let port: u32 = port_part
                    .parse()
                    .map_err(|_| KilnError::Input(format!("Invalid port: {}", arg)))?;
                (port, port)
            }
        };
        for port in begin..=end {
            out.push(format!("{}/{}", port, proto));
        }
    }
    Ok(out)
}

/// Look up `key` in a `K=V` environment list; the first match wins.
pub fn env_get<'a>(envs: &'a [String], key: &str) -> Option<&'a str> {
    envs.iter().find_map(|entry| {
        let (k, v) = entry.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// One history record per processed instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created: String,
    pub created_by: String,
    pub empty_layer: bool,
}

/// The mutable image being built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageState {
    pub id: Option<String>,
    pub parent: Option<String>,
    pub architecture: String,
    pub os: String,
    pub author: String,
    pub created: Option<String>,
    pub config: ImageConfig,
    pub container_config: ImageConfig,
    pub history: Vec<HistoryEntry>,
}

impl ImageState {
    pub fn new() -> Self {
        Self {
            id: None,
            parent: None,
            architecture: ARCHITECTURE.to_string(),
            os: OS.to_string(),
            author: String::new(),
            created: None,
            config: ImageConfig::default(),
            container_config: ImageConfig::default(),
            history: Vec::new(),
        }
    }

    /// 12-character short form of the current id, if any.
    pub fn short_id(&self) -> Option<&str> {
        self.id.as_deref().map(short_id)
    }
}

impl Default for ImageState {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only record of one processed instruction.
#[derive(Debug, Clone)]
pub struct Layer {
    /// The instruction as written.
    pub cmd: String,
    /// Deep copy of the image state at the moment of append.
    pub image: ImageState,
}

/// An image as delivered by the host: the `image_reprovision` reply shape,
/// also the shape of each `existing_images` cache candidate.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InstalledImage {
    pub id: String,
    pub parent: Option<String>,
    pub created: Option<String>,
    pub config: ImageConfig,
    pub container_config: ImageConfig,
}

/// Parse an `image_reprovision` reply payload (`{"image": {...}}`).
pub fn parse_reprovision_payload(payload: &Value) -> Result<InstalledImage> {
    let image = payload
        .get("image")
        .ok_or_else(|| KilnError::Input("image_reprovision reply is missing an image".to_string()))?;
    Ok(serde_json::from_value(image.clone())?)
}

/// Generate a fresh 256-bit hex image id.
pub fn new_image_id() -> String {
    let mut hasher = Sha256::new();
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hex::encode(hasher.finalize())
}

/// First 12 hex characters of an image id, as used in all human-readable
/// output.
pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

/// Short form of a zone uuid: dashes removed, first 12 characters.
pub fn short_zone_id(uuid: &str) -> String {
    uuid.chars().filter(|c| *c != '-').take(12).collect()
}

/// Current time in the RFC-3339 nanosecond format image configs use.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_set_inserts_and_replaces() {
        let mut config = ImageConfig::default();
        assert!(config.env.is_none());

        config.env_set("PATH", "/bin");
        config.env_set("HOME", "/root");
        assert_eq!(
            config.env,
            Some(vec!["PATH=/bin".to_string(), "HOME=/root".to_string()])
        );

        config.env_set("PATH", "/usr/bin:/bin");
        assert_eq!(
            config.env,
            Some(vec!["PATH=/usr/bin:/bin".to_string(), "HOME=/root".to_string()])
        );
    }

    #[test]
    fn test_env_set_prefix_is_exact() {
        let mut config = ImageConfig::default();
        config.env_set("PATHX", "1");
        config.env_set("PATH", "2");
        assert_eq!(
            config.env,
            Some(vec!["PATHX=1".to_string(), "PATH=2".to_string()])
        );
    }

    #[test]
    fn test_expose_port_list_expansion() {
        let args: Vec<String> = ["2374", "8000-8002", "53/UDP"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            expose_port_list(&args).unwrap(),
            vec!["2374/tcp", "8000/tcp", "8001/tcp", "8002/tcp", "53/udp"]
        );
    }

    #[test]
    fn test_expose_port_list_rejects_bad_input() {
        let reversed = vec!["8010-8000".to_string()];
        let err = expose_port_list(&reversed).unwrap_err();
        assert!(err.to_string().contains("Invalid port range: 8010-8000"));

        let garbled = vec!["80-abc".to_string()];
        assert!(expose_port_list(&garbled).is_err());

        let word = vec!["http".to_string()];
        let err = expose_port_list(&word).unwrap_err();
        assert!(err.to_string().contains("Invalid port: http"));
    }

    #[test]
    fn test_env_get_first_match_wins() {
        let envs = vec!["A=1".to_string(), "A=2".to_string(), "B=x=y".to_string()];
        assert_eq!(env_get(&envs, "A"), Some("1"));
        assert_eq!(env_get(&envs, "B"), Some("x=y"));
        assert_eq!(env_get(&envs, "C"), None);
    }

    #[test]
    fn test_unset_collections_serialize_as_null() {
        let config = ImageConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["Cmd"], Value::Null);
        assert_eq!(json["Entrypoint"], Value::Null);
        assert_eq!(json["Env"], Value::Null);
        assert_eq!(json["ExposedPorts"], Value::Null);
        assert_eq!(json["Labels"], Value::Null);
        assert_eq!(json["Volumes"], Value::Null);
        assert_eq!(json["OnBuild"], Value::Null);
    }

    #[test]
    fn test_config_round_trips_docker_field_names() {
        let raw = r#"{
            "Cmd": ["/bin/sh", "-c", "/hello"],
            "Env": ["PATH=/bin"],
            "WorkingDir": "/workspace",
            "ExposedPorts": {"80/tcp": {}},
            "Labels": {"a": "b"},
            "OnBuild": ["RUN /x"],
            "StopSignal": "SIGTERM",
            "User": "nobody"
        }"#;
        let config: ImageConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.working_dir, "/workspace");
        assert_eq!(config.user, "nobody");
        assert_eq!(config.stop_signal.as_deref(), Some("SIGTERM"));
        assert_eq!(config.on_build, Some(vec!["RUN /x".to_string()]));
        assert!(config.exposed_ports.as_ref().unwrap().contains_key("80/tcp"));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["WorkingDir"], "/workspace");
        assert_eq!(json["Cmd"][2], "/hello");
    }

    #[test]
    fn test_new_image_id_shape() {
        let id = new_image_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_image_id());
    }

    #[test]
    fn test_short_ids() {
        let id = "6530e406dfec4422954aa6e33b2d7b42d68f2a5cdcfff7240f51ec347e12f6ba";
        assert_eq!(short_id(id), "6530e406dfec");
        assert_eq!(
            short_zone_id("7b8f68a6-4342-49ae-9ac2-55ad7a08e477"),
            "7b8f68a64342"
        );
    }

    #[test]
    fn test_layer_snapshot_is_deep() {
        let mut state = ImageState::new();
        state.config.env_set("A", "1");
        let layer = Layer {
            cmd: "ENV A 1".to_string(),
            image: state.clone(),
        };

        state.config.env_set("A", "2");
        assert_eq!(
            layer.image.config.env,
            Some(vec!["A=1".to_string()])
        );
    }

    #[test]
    fn test_parse_reprovision_payload() {
        let payload = serde_json::json!({
            "image": {
                "Id": "abc123",
                "Config": {"Cmd": ["/bin/busybox"]},
                "ContainerConfig": {}
            }
        });
        let installed = parse_reprovision_payload(&payload).unwrap();
        assert_eq!(installed.id, "abc123");
        assert_eq!(
            installed.config.cmd,
            Some(vec!["/bin/busybox".to_string()])
        );

        let bad = serde_json::json!({"no_image": true});
        assert!(parse_reprovision_payload(&bad).is_err());
    }
}
