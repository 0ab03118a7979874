//! Domain primitive and wire types used across the stepbox workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{CONTAINER_NAME_HEX_LEN, CONTAINER_NAME_PREFIX};

/// Unique name of a sandbox container, as seen by the isolation runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerName(String);

impl ContainerName {
    /// Creates a container name from an existing string value.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Generates a fresh name: the shared prefix plus random hex characters.
    #[must_use]
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(format!(
            "{CONTAINER_NAME_PREFIX}{}",
            &hex[..CONTAINER_NAME_HEX_LEN]
        ))
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request to run a pre-compiled binary in the sandbox.
///
/// Byte fields travel as standard base64 strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// The executable to run.
    #[serde(with = "base64_bytes", default)]
    pub binary: Vec<u8>,
    /// Source the binary was built from, written next to it for diagnostics.
    #[serde(rename = "mainDotGo", with = "base64_bytes", default)]
    pub source_context: Vec<u8>,
    /// Directory the binary was built in.
    #[serde(rename = "buildLoc", default)]
    pub build_loc: String,
    /// Extra arguments for the binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

/// The outcome of a run, returned to the caller as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    /// User-visible failure reason. When set, the binary did not produce a
    /// trustworthy result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Exit code of the contained process.
    pub exit_code: i32,
    /// Everything the contained process wrote after its handshake marker.
    #[serde(with = "base64_opt_bytes", default)]
    pub execution_steps: Option<Vec<u8>>,
}

impl RunResponse {
    /// Builds a response carrying only a user-visible error.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            exit_code: 0,
            execution_steps: None,
        }
    }

    /// Builds a response for a process that ran to completion.
    #[must_use]
    pub const fn completed(exit_code: i32, execution_steps: Vec<u8>) -> Self {
        Self {
            error: None,
            exit_code,
            execution_steps: Some(execution_steps),
        }
    }
}

/// Metadata line sent to the contained process ahead of the binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMeta {
    /// Arguments forwarded to the binary. `None` serializes as `null`.
    pub args: Option<Vec<String>>,
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map_or_else(|| Ok(Vec::new()), |s| STANDARD.decode(s).map_err(serde::de::Error::custom))
    }
}

mod base64_opt_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_str(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
