use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Created,
    Running,
    Complete,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Status only moves forward: created → running → complete | failed.
    /// A build that never got to run may fail straight from created.
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running)
                | (Self::Created, Self::Failed)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Failed)
        )
    }

    /// States a build must currently be in for `self` to be written.
    pub fn predecessors(&self) -> &'static [BuildStatus] {
        match self {
            Self::Created => &[],
            Self::Running => &[Self::Created],
            Self::Complete => &[Self::Running],
            Self::Failed => &[Self::Created, Self::Running],
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid build status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Build {
    pub id: String,
    pub app: String,
    pub status: BuildStatus,
    pub logs: String,
    pub created: String,
    pub ended: Option<String>,
}

/// Optional filters for listing builds. Empty strings are treated as absent,
/// matching how query parameters arrive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildFilter {
    pub id: Option<String>,
    pub created: Option<String>,
    /// Keep only the newest `limit` builds (still returned oldest first).
    #[serde(default, deserialize_with = "empty_as_none")]
    pub limit: Option<usize>,
}

/// Query parameters arrive as strings; an empty one means "not given".
pub(crate) fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)?.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

impl BuildFilter {
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref().filter(|s| !s.is_empty())
    }

    pub fn created(&self) -> Option<&str> {
        self.created.as_deref().filter(|s| !s.is_empty())
    }
}

/// Where a build gets its source from. Exactly one per build.
#[derive(Debug, Clone)]
pub enum BuildSource {
    /// Uploaded tarball (optionally gzipped).
    Archive(Vec<u8>),
    /// Repository reference, e.g. `https://github.com/org/app.git#main`.
    Remote(String),
}

impl BuildSource {
    /// Pick the source for a create request: an uploaded archive wins, then a
    /// non-empty reference. Supplying both, or neither, is rejected.
    pub fn select(archive: Option<Vec<u8>>, repo: Option<String>) -> Result<Self, String> {
        let repo = repo.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        match (archive, repo) {
            (Some(_), Some(_)) => Err("specify either source or repo, not both".to_string()),
            (Some(bytes), None) => Ok(Self::Archive(bytes)),
            (None, Some(repo)) => Ok(Self::Remote(repo)),
            (None, None) => Err("no source or repo".to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Archive(_) => "local",
            Self::Remote(_) => "remote",
        }
    }
}

/// Generate an opaque build id: `B` followed by ten uppercase hex digits.
pub fn new_build_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    format!("B{}", &raw[..10])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrips_through_str() {
        for status in [
            BuildStatus::Created,
            BuildStatus::Running,
            BuildStatus::Complete,
            BuildStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
        assert!("queued".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn test_status_never_regresses() {
        use BuildStatus::*;
        assert!(Created.can_transition_to(Running));
        assert!(Created.can_transition_to(Failed));
        assert!(Running.can_transition_to(Complete));
        assert!(Running.can_transition_to(Failed));

        assert!(!Running.can_transition_to(Created));
        assert!(!Complete.can_transition_to(Running));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Complete));
        assert!(!Created.can_transition_to(Complete));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_predecessors_agree_with_transitions() {
        use BuildStatus::*;
        for next in [Created, Running, Complete, Failed] {
            for prev in next.predecessors() {
                assert!(prev.can_transition_to(next), "{prev} -> {next}");
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(BuildStatus::Complete.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(!BuildStatus::Created.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_serializes_as_lowercase_token() {
        let json = serde_json::to_string(&BuildStatus::Complete).unwrap();
        assert_eq!(json, "\"complete\"");
    }

    #[test]
    fn test_select_source_prefers_exactly_one() {
        assert!(matches!(
            BuildSource::select(Some(vec![1, 2]), None),
            Ok(BuildSource::Archive(_))
        ));
        assert!(matches!(
            BuildSource::select(None, Some("https://example/repo.git".into())),
            Ok(BuildSource::Remote(r)) if r == "https://example/repo.git"
        ));
    }

    #[test]
    fn test_select_source_rejects_neither_and_both() {
        assert_eq!(
            BuildSource::select(None, None).unwrap_err(),
            "no source or repo"
        );
        assert_eq!(
            BuildSource::select(None, Some("   ".into())).unwrap_err(),
            "no source or repo"
        );
        assert!(BuildSource::select(Some(vec![0]), Some("git@x:y".into())).is_err());
    }

    #[test]
    fn test_filter_ignores_empty_query_values() {
        let filter = BuildFilter {
            id: Some(String::new()),
            created: Some("2024-01-01T00:00:00Z".into()),
            limit: None,
        };
        assert_eq!(filter.id(), None);
        assert_eq!(filter.created(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn test_new_build_id_shape() {
        let id = new_build_id();
        assert_eq!(id.len(), 11);
        assert!(id.starts_with('B'));
        assert!(id[1..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_ne!(id, new_build_id());
    }
}
