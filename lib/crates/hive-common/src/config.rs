use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Sensor mode an agent runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// No workload; the agent waits for the coordinator to assign one.
    #[default]
    Unset,
    /// Decoy service accepting inbound sessions.
    Honeypot,
    /// Outbound-session client exercising decoy services.
    Client,
}

impl Mode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Unset => "",
            Mode::Honeypot => "honeypot",
            Mode::Client => "client",
        }
    }

    #[must_use]
    pub fn is_unset(self) -> bool {
        self == Mode::Unset
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Unset => f.write_str("unset"),
            other => f.write_str(other.as_str()),
        }
    }
}

impl Serialize for Mode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Mode {
    /// `""` and `null` both mean unset; older coordinators sent either.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref() {
            None | Some("") => Ok(Mode::Unset),
            Some("honeypot") => Ok(Mode::Honeypot),
            Some("client") => Ok(Mode::Client),
            Some(other) => Err(serde::de::Error::unknown_variant(
                other,
                &["", "honeypot", "client"],
            )),
        }
    }
}

/// Where the agent reaches the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorEndpoints {
    /// Endpoint the agent subscribes to for commands, e.g. `tcp://coord:5712`.
    pub command_url: String,
    /// Endpoint the agent publishes events to, e.g. `tcp://coord:5713`.
    pub event_url: String,
}

/// Agent configuration document, as pushed by the coordinator and persisted
/// on the agent host.
///
/// Equality is structural over the whole document, including mode-specific
/// sections the agent itself does not interpret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Identity assigned at provisioning time.
    pub id: String,

    #[serde(default)]
    pub mode: Mode,

    /// Resolve the public address through an external service at startup.
    #[serde(default)]
    pub fetch_ip: bool,

    pub coordinator: CoordinatorEndpoints,

    /// Mode-specific sections, kept verbatim.
    #[serde(flatten)]
    pub sections: Map<String, Value>,
}

impl Configuration {
    /// Parse a configuration document from JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Render the document the way it is stored on disk.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Look up a mode-specific section such as `"honeypot"`.
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&Value> {
        self.sections.get(name)
    }
}
