//! Flasher configuration
//!
//! Covers the bus transport, per-state retry policies, the MCU flash layouts
//! and the board catalog (with named groups). Files are TOML or YAML, picked
//! by extension.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;
use crate::layout::Microcontroller;
use crate::session::SessionState;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Bus transport
    #[serde(default)]
    pub transport: TransportConfig,
    /// Retry policy per protocol state
    #[serde(default)]
    pub retry: RetryConfig,
    /// Flash layouts, referenced by name from boards. Built-in layouts are
    /// used when a name is not defined here.
    #[serde(default)]
    pub mcus: Vec<Microcontroller>,
    /// Board catalog
    #[serde(default)]
    pub boards: Vec<BoardConfig>,
    /// Named board groups
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    /// Directory that relative artifact paths are resolved against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_dir: Option<PathBuf>,
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Raw CAN frames over SocketCAN (Linux only)
    SocketCan(SocketCanConfig),
    /// Simulated bootloaders for every configured board
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// SocketCAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// CAN interface name (e.g., "can0")
    pub interface: String,
    /// Use 29-bit identifiers
    #[serde(default)]
    pub extended_ids: bool,
}

/// Mock transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated reply latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

// =============================================================================
// Retry Configuration
// =============================================================================

/// Timeout and resend budget for one protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub timeout_ms: u64,
    /// Resends after the first transmission
    pub max_retries: u32,
}

impl RetryPolicy {
    pub const fn new(timeout_ms: u64, max_retries: u32) -> Self {
        Self {
            timeout_ms,
            max_retries,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Retry policies for the states that wait on a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_handshake")]
    pub handshake: RetryPolicy,
    #[serde(default = "default_erase")]
    pub erase: RetryPolicy,
    #[serde(default = "default_transfer")]
    pub transfer: RetryPolicy,
    #[serde(default = "default_verify")]
    pub verify: RetryPolicy,
}

fn default_handshake() -> RetryPolicy {
    RetryPolicy::new(1000, 3)
}

fn default_erase() -> RetryPolicy {
    RetryPolicy::new(5000, 2)
}

fn default_transfer() -> RetryPolicy {
    RetryPolicy::new(200, 5)
}

fn default_verify() -> RetryPolicy {
    RetryPolicy::new(5000, 2)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            handshake: default_handshake(),
            erase: default_erase(),
            transfer: default_transfer(),
            verify: default_verify(),
        }
    }
}

impl RetryConfig {
    /// Same policy for every state
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            handshake: policy,
            erase: policy,
            transfer: policy,
            verify: policy,
        }
    }

    /// Policy governing `state`, if the state waits on a reply
    pub fn for_state(&self, state: &SessionState) -> Option<RetryPolicy> {
        match state {
            SessionState::Handshaking => Some(self.handshake),
            SessionState::Erasing => Some(self.erase),
            SessionState::Transferring => Some(self.transfer),
            SessionState::Verifying => Some(self.verify),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, policy) in [
            ("handshake", self.handshake),
            ("erase", self.erase),
            ("transfer", self.transfer),
            ("verify", self.verify),
        ] {
            if policy.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "retry.{}.timeout_ms must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Board Configuration
// =============================================================================

/// Board catalog entry as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    pub name: String,
    /// Identifier of host -> board frames
    #[serde(deserialize_with = "deserialize_can_id")]
    pub request_id: u32,
    /// Identifier of board -> host frames
    #[serde(deserialize_with = "deserialize_can_id")]
    pub response_id: u32,
    /// Flash layout name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcu: Option<String>,
    /// Firmware artifact for this board
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    /// Identifier the running application broadcasts its build commit on
    #[serde(
        default,
        deserialize_with = "deserialize_opt_can_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub commit_id: Option<u32>,
}

/// A board to flash, resolved from the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardTarget {
    pub name: String,
    pub request_id: u32,
    pub response_id: u32,
    /// Flash layout used for the write-protect pre-flight check
    pub mcu: Option<Microcontroller>,
    pub artifact: Option<PathBuf>,
    pub commit_id: Option<u32>,
}

impl BoardTarget {
    pub fn new(name: impl Into<String>, request_id: u32, response_id: u32) -> Self {
        Self {
            name: name.into(),
            request_id,
            response_id,
            mcu: None,
            artifact: None,
            commit_id: None,
        }
    }

    pub fn with_mcu(mut self, mcu: Microcontroller) -> Self {
        self.mcu = Some(mcu);
        self
    }

    pub fn with_artifact(mut self, artifact: impl Into<PathBuf>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    pub fn with_commit_id(mut self, commit_id: u32) -> Self {
        self.commit_id = Some(commit_id);
        self
    }
}

impl fmt::Display for BoardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (tx {:#x}, rx {:#x})",
            self.name, self.request_id, self.response_id
        )
    }
}

impl FlashConfig {
    /// Load and validate a config file (TOML, or YAML for `.yaml`/`.yml`)
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let config: Self = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        config.validate()?;
        tracing::debug!(
            path = %path.display(),
            boards = config.boards.len(),
            groups = config.groups.len(),
            "Loaded config"
        );
        Ok(config)
    }

    /// Check catalog consistency: unique names and identifiers, known MCU
    /// and group references, non-zero timeouts
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;

        let mut mcu_names = HashSet::new();
        for mcu in &self.mcus {
            if !mcu_names.insert(mcu.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    what: "MCU name",
                    value: mcu.name.clone(),
                });
            }
            mcu.validate()?;
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for board in &self.boards {
            if !names.insert(board.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    what: "board name",
                    value: board.name.clone(),
                });
            }
            if board.request_id == board.response_id {
                return Err(ConfigError::Invalid(format!(
                    "board '{}' uses {:#x} for both request and response",
                    board.name, board.request_id
                )));
            }
            for id in [Some(board.request_id), Some(board.response_id), board.commit_id]
                .into_iter()
                .flatten()
            {
                if !ids.insert(id) {
                    return Err(ConfigError::Duplicate {
                        what: "CAN identifier",
                        value: format!("{:#x}", id),
                    });
                }
            }
            if let Some(mcu) = &board.mcu {
                self.find_mcu(mcu).ok_or_else(|| ConfigError::UnknownMcu {
                    board: board.name.clone(),
                    mcu: mcu.clone(),
                })?;
            }
        }

        for (group, members) in &self.groups {
            if names.contains(group.as_str()) {
                return Err(ConfigError::Duplicate {
                    what: "board/group name",
                    value: group.clone(),
                });
            }
            for member in members {
                if !names.contains(member.as_str()) {
                    return Err(ConfigError::UnknownBoard(format!(
                        "{} (in group '{}')",
                        member, group
                    )));
                }
            }
        }

        Ok(())
    }

    /// Layout by name: config-defined first, then built-in
    pub fn find_mcu(&self, name: &str) -> Option<Microcontroller> {
        self.mcus
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .or_else(|| Microcontroller::builtin(name))
    }

    /// Resolve board and group names into targets, in catalog order.
    ///
    /// An empty selection means every board. Names may be repeated or
    /// overlap between groups; each board appears once.
    pub fn resolve_targets(&self, selection: &[String]) -> Result<Vec<BoardTarget>, ConfigError> {
        let mut wanted: HashSet<&str> = HashSet::new();
        if selection.is_empty() {
            wanted.extend(self.boards.iter().map(|b| b.name.as_str()));
        }
        for name in selection {
            if let Some(members) = self.groups.get(name) {
                wanted.extend(members.iter().map(String::as_str));
            } else if self.boards.iter().any(|b| &b.name == name) {
                wanted.insert(name.as_str());
            } else {
                return Err(ConfigError::UnknownBoard(name.clone()));
            }
        }

        self.boards
            .iter()
            .filter(|b| wanted.contains(b.name.as_str()))
            .map(|b| self.target_for(b))
            .collect()
    }

    fn target_for(&self, board: &BoardConfig) -> Result<BoardTarget, ConfigError> {
        let mcu = match &board.mcu {
            Some(name) => Some(self.find_mcu(name).ok_or_else(|| ConfigError::UnknownMcu {
                board: board.name.clone(),
                mcu: name.clone(),
            })?),
            None => None,
        };
        let artifact = board.artifact.as_ref().map(|p| match &self.build_dir {
            Some(dir) if p.is_relative() => dir.join(p),
            _ => p.clone(),
        });

        Ok(BoardTarget {
            name: board.name.clone(),
            request_id: board.request_id,
            response_id: board.response_id,
            mcu,
            artifact,
            commit_id: board.commit_id,
        })
    }
}

/// Parse a CAN identifier (decimal, or hex with 0x prefix)
pub fn parse_can_id(s: &str) -> Result<u32, ConfigError> {
    let s = s.trim();
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };

    u32::from_str_radix(digits, radix).map_err(|_| ConfigError::InvalidId(s.to_string()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CanIdRepr {
    Number(u32),
    Text(String),
}

impl CanIdRepr {
    fn into_id<E: serde::de::Error>(self) -> Result<u32, E> {
        match self {
            Self::Number(id) => Ok(id),
            Self::Text(text) => parse_can_id(&text).map_err(E::custom),
        }
    }
}

fn deserialize_can_id<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    CanIdRepr::deserialize(deserializer)?.into_id()
}

fn deserialize_opt_can_id<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<CanIdRepr>::deserialize(deserializer)?
        .map(CanIdRepr::into_id)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const CATALOG: &str = r#"
[transport]
type = "socketcan"
interface = "can0"

[retry]
handshake = { timeout_ms = 500, max_retries = 5 }

[[boards]]
name = "VC"
request_id = 1210
response_id = "0x4BB"
mcu = "STM32H733xx"
artifact = "VC/quadruna_VC_app_metadata.hex"
commit_id = "0xCC"

[[boards]]
name = "FSM"
request_id = "1220"
response_id = 1221
mcu = "STM32F412xx"

[[boards]]
name = "h7dev"
request_id = 1300
response_id = 1301

[groups]
quadruna = ["VC", "FSM"]
"#;

    fn catalog() -> FlashConfig {
        let mut config: FlashConfig = toml::from_str(CATALOG).unwrap();
        config.build_dir = Some(PathBuf::from("/build"));
        config
    }

    #[test]
    fn test_parse_catalog() {
        let config = catalog();
        config.validate().unwrap();

        assert!(matches!(
            config.transport,
            TransportConfig::SocketCan(SocketCanConfig { ref interface, extended_ids: false }) if interface == "can0"
        ));
        assert_eq!(config.boards[0].response_id, 0x4BB);
        assert_eq!(config.boards[1].request_id, 1220);

        // Unspecified states keep their defaults
        assert_eq!(config.retry.handshake, RetryPolicy::new(500, 5));
        assert_eq!(config.retry.transfer, RetryPolicy::new(200, 5));
    }

    #[test]
    fn test_defaults() {
        let config: FlashConfig = toml::from_str("").unwrap();
        assert!(matches!(config.transport, TransportConfig::Mock(_)));
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.retry.erase, RetryPolicy::new(5000, 2));
        assert_eq!(config.retry.verify.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_can_id() {
        assert_eq!(parse_can_id("1210").unwrap(), 1210);
        assert_eq!(parse_can_id("0x4BA").unwrap(), 0x4BA);
        assert_eq!(parse_can_id(" 0X18DA00F1 ").unwrap(), 0x18DA_00F1);
        assert!(matches!(parse_can_id("0xZZ"), Err(ConfigError::InvalidId(_))));
    }

    #[test]
    fn test_resolve_group_keeps_catalog_order() {
        let config = catalog();
        let targets = config
            .resolve_targets(&["quadruna".to_string(), "VC".to_string()])
            .unwrap();

        let names: Vec<_> = targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["VC", "FSM"]);
        assert_eq!(
            targets[0].artifact.as_deref(),
            Some(Path::new("/build/VC/quadruna_VC_app_metadata.hex"))
        );
        assert_eq!(targets[0].mcu.as_ref().unwrap().name, "STM32H733xx");
        assert_eq!(targets[0].commit_id, Some(0xCC));
        assert_eq!(targets[1].artifact, None);
        assert_eq!(targets[1].commit_id, None);
    }

    #[test]
    fn test_resolve_empty_selection_is_everything() {
        let targets = catalog().resolve_targets(&[]).unwrap();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[2].mcu, None);
    }

    #[test]
    fn test_resolve_unknown_name() {
        let err = catalog().resolve_targets(&["BMS".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBoard(ref name) if name == "BMS"));
    }

    #[test]
    fn test_duplicate_identifier_rejected() {
        let mut config = catalog();
        config.boards[2].request_id = 1221;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate { what: "CAN identifier", .. }));
    }

    #[test]
    fn test_commit_id_clashing_with_protocol_id_rejected() {
        let mut config = catalog();
        config.boards[2].commit_id = Some(1210);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Duplicate { what: "CAN identifier", ref value }) if value == "0x4ba"
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut config = catalog();
        config.boards[2].name = "VC".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Duplicate { what: "board name", .. })
        ));
    }

    #[test]
    fn test_unknown_mcu_rejected() {
        let mut config = catalog();
        config.boards[2].mcu = Some("STM32G474".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownMcu { ref mcu, .. }) if mcu == "STM32G474"
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = catalog();
        config.retry.verify.timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_group_with_unknown_member_rejected() {
        let mut config = catalog();
        config
            .groups
            .insert("bench".to_string(), vec!["RSM".to_string()]);
        assert!(matches!(config.validate(), Err(ConfigError::UnknownBoard(_))));
    }

    #[test]
    fn test_load_yaml_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "transport:\n  type: mock\n  latency_ms: 2\nboards:\n  - name: BMS\n    request_id: \"0x4B0\"\n    response_id: 1201\n"
        )
        .unwrap();

        let config = FlashConfig::load(file.path()).unwrap();
        assert!(matches!(config.transport, TransportConfig::Mock(MockConfig { latency_ms: 2 })));
        assert_eq!(config.boards[0].request_id, 1200);
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[[boards]]\nname = \"VC\"\n").unwrap();
        assert!(matches!(
            FlashConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
