use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HobsError;

const IDENTITY_DELIMITER: &str = "___";
const MVM_SUFFIX: &str = "/measured_vs_modeled";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = HobsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        // Used as a path segment in the mirror, so no separators.
        let is_valid = !trimmed.is_empty()
            && !trimmed.contains('/')
            && !trimmed.contains('\\')
            && trimmed != "."
            && trimmed != "..";
        if !is_valid {
            return Err(HobsError::InvalidRequestId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stage(String);

impl Stage {
    pub fn production() -> Self {
        Self("production".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Stage {
    fn default() -> Self {
        Self::production()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Stage {
    type Err = HobsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !is_valid {
            return Err(HobsError::InvalidStage(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Running,
    Success,
    Error,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Running)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Running => write!(f, "RUNNING"),
            RequestStatus::Success => write!(f, "SUCCESS"),
            RequestStatus::Error => write!(f, "ERROR"),
        }
    }
}

impl FromStr for RequestStatus {
    type Err = HobsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "RUNNING" => Ok(RequestStatus::Running),
            "SUCCESS" => Ok(RequestStatus::Success),
            "ERROR" => Ok(RequestStatus::Error),
            _ => Err(HobsError::InvalidStatus(value.to_string())),
        }
    }
}

/// A status check response: the parsed status plus the payload it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub status: RequestStatus,
    pub raw: Value,
}

impl StatusReport {
    pub fn from_json(raw: Value) -> Result<Self, HobsError> {
        let status = raw
            .get("request_status")
            .and_then(|value| value.as_str())
            .ok_or_else(|| {
                HobsError::UnexpectedResponse(format!("status payload without request_status: {raw}"))
            })?
            .parse()?;
        Ok(Self { status, raw })
    }

    /// Server-provided explanation for an ERROR status, or the whole payload.
    pub fn detail(&self) -> String {
        ["message", "error", "detail"]
            .iter()
            .find_map(|key| self.raw.get(*key).and_then(|value| value.as_str()))
            .map(|value| value.to_string())
            .unwrap_or_else(|| self.raw.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigRequest {
    pub study_names: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,
    pub refresh_config: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MvmRequest {
    pub study_names: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpolation_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreatmentIdentity {
    pub study_name: String,
    pub site_name: String,
    pub treatment_name: String,
    pub soil_id: String,
}

impl fmt::Display for TreatmentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{IDENTITY_DELIMITER}{}{IDENTITY_DELIMITER}{}{IDENTITY_DELIMITER}{}",
            self.study_name, self.site_name, self.treatment_name, self.soil_id
        )
    }
}

impl FromStr for TreatmentIdentity {
    type Err = HobsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value.split(IDENTITY_DELIMITER).collect::<Vec<_>>();
        let [study, site, treatment, soil] = parts.as_slice() else {
            return Err(HobsError::MalformedIdentity(value.to_string()));
        };
        if parts.iter().any(|part| part.is_empty()) {
            return Err(HobsError::MalformedIdentity(value.to_string()));
        }
        Ok(Self {
            study_name: study.to_string(),
            site_name: site.to_string(),
            treatment_name: treatment.to_string(),
            soil_id: soil.to_string(),
        })
    }
}

impl TreatmentIdentity {
    /// Parses an archive label such as `configs/study___site___treatment___soil`.
    /// Only the second path segment is used; a label without `/` is parsed whole.
    pub fn from_label(label: &str) -> Result<Self, HobsError> {
        let name = label.split('/').nth(1).unwrap_or(label);
        name.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    #[serde(flatten)]
    pub identity: TreatmentIdentity,
    pub config: Value,
}

impl ConfigRecord {
    /// Blob name used when mirroring: the config's own `name`, else the identity.
    pub fn blob_name(&self) -> String {
        self.config
            .get("name")
            .and_then(|value| value.as_str())
            .filter(|value| !value.trim().is_empty())
            .map(|value| value.to_string())
            .unwrap_or_else(|| self.identity.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MvmRecord {
    pub study_name: String,
    pub mvms: Value,
}

impl MvmRecord {
    pub fn from_entry(label: &str, mvms: Value) -> Self {
        Self {
            study_name: label.replace(MVM_SUFFIX, ""),
            mvms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedEntry {
    pub label: String,
    pub reason: String,
}

/// Normalized configs of one request, with entries whose label did not parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigBatch {
    pub records: Vec<ConfigRecord>,
    pub rejected: Vec<RejectedEntry>,
}
