use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

mod batch;

pub use batch::{validate_issues, IssueResult, ValidationReport};

/// Labels that exempt an issue from the missing-hierarchy-label warning.
pub const STANDALONE_LABELS: [&str; 5] =
    ["bug", "defect", "security-issue", "feature-request", "theme"];

pub const CLOSED_WARNING: &str = "Issue is closed";

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct IssueNumber(pub u64);

impl Display for IssueNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for IssueNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    Closed,
}

impl IssueState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

/// Read-only snapshot of one tracked issue.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct Issue {
    pub number: IssueNumber,
    pub title: String,
    pub labels: Vec<String>,
    pub state: IssueState,
    /// Parent resolved from the issue's event history, if any.
    pub parent: Option<IssueNumber>,
}

impl Issue {
    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|candidate| candidate == label)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == IssueState::Closed
    }

    #[must_use]
    pub fn hierarchy_level(&self) -> Option<HierarchyLevel> {
        HierarchyLevel::from_labels(&self.labels)
    }

    #[must_use]
    pub fn has_standalone_label(&self) -> bool {
        self.labels.iter().any(|label| STANDALONE_LABELS.contains(&label.as_str()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum HierarchyLevel {
    Theme,
    UserStory,
    Task,
    SubTask,
}

impl HierarchyLevel {
    pub const ALL: [Self; 4] = [Self::Theme, Self::UserStory, Self::Task, Self::SubTask];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Theme => "theme",
            Self::UserStory => "user-story",
            Self::Task => "task",
            Self::SubTask => "sub-task",
        }
    }

    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Theme => "Theme",
            Self::UserStory => "User Story",
            Self::Task => "Task",
            Self::SubTask => "Sub-Task",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "theme" => Some(Self::Theme),
            "user-story" => Some(Self::UserStory),
            "task" => Some(Self::Task),
            "sub-task" => Some(Self::SubTask),
            _ => None,
        }
    }

    /// The level an issue at `self` must be a sub-issue of. Themes are roots.
    #[must_use]
    pub fn required_parent(self) -> Option<Self> {
        match self {
            Self::Theme => None,
            Self::UserStory => Some(Self::Theme),
            Self::Task => Some(Self::UserStory),
            Self::SubTask => Some(Self::Task),
        }
    }

    /// First hierarchy label in `labels`; later ones are ignored.
    #[must_use]
    pub fn from_labels(labels: &[String]) -> Option<Self> {
        labels.iter().find_map(|label| Self::parse(label))
    }
}

impl Display for HierarchyLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation outcome for one issue. An error always makes the verdict invalid.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct Verdict {
    valid: bool,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl Verdict {
    #[must_use]
    pub fn valid() -> Self {
        Self { valid: true, errors: Vec::new(), warnings: Vec::new() }
    }

    #[must_use]
    pub fn invalid(error: impl Into<String>) -> Self {
        Self { valid: false, errors: vec![error.into()], warnings: Vec::new() }
    }

    #[must_use]
    pub fn closed() -> Self {
        let mut verdict = Self::valid();
        verdict.push_warning(CLOSED_WARNING);
        verdict
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        self.valid = false;
        self.errors.push(error.into());
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// Check `issue` against the hierarchy rules.
///
/// `parent` is the already-fetched snapshot of `issue.parent`. When the issue
/// has a parent link but no snapshot is supplied, the parent label check is
/// skipped and the issue is treated as valid.
#[must_use]
pub fn validate_issue_hierarchy(issue: &Issue, parent: Option<&Issue>) -> Verdict {
    let mut verdict = Verdict::valid();

    let Some(level) = issue.hierarchy_level() else {
        if !issue.has_standalone_label() {
            verdict.push_warning(format!(
                "Issue #{} has no hierarchy label (theme, user-story, task, sub-task)",
                issue.number
            ));
        }
        return verdict;
    };

    match level.required_parent() {
        None => {
            if let Some(parent_number) = issue.parent {
                verdict.push_warning(format!(
                    "Issue #{} ({level}) should be standalone but has parent #{parent_number}",
                    issue.number
                ));
            }
        }
        Some(required) => {
            if issue.parent.is_none() {
                return Verdict::invalid(format!(
                    "Issue #{number} ({level}) must be a sub-issue of a {required} issue.\n  \
                     → Create this issue using \"Create sub-issue\" from the parent {required}.",
                    number = issue.number
                ));
            }

            if let Some(parent) = parent {
                if !parent.has_label(required.as_str()) {
                    return Verdict::invalid(format!(
                        "Issue #{} ({level}) has parent #{}, but parent must have label \
                         \"{required}\". Parent has labels: {}",
                        issue.number,
                        parent.number,
                        parent.labels.join(", ")
                    ));
                }
            }
        }
    }

    verdict
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FetchError {
    #[error("failed to fetch issue #{number}: not found: {message}")]
    NotFound { number: IssueNumber, message: String },
    #[error("failed to fetch issue #{number}: API error: HTTP {status}: {message}")]
    Api { number: IssueNumber, status: u16, message: String },
    #[error("failed to fetch issue #{number}: transport error: {message}")]
    Transport { number: IssueNumber, message: String },
    #[error("failed to fetch issue #{number}: malformed response: {message}")]
    Decode { number: IssueNumber, message: String },
    #[error(
        "failed to fetch issue #{number}: event history exceeds {pages} pages; parent link unknown"
    )]
    HistoryTooLong { number: IssueNumber, pages: usize },
}

impl FetchError {
    #[must_use]
    pub fn number(&self) -> IssueNumber {
        match self {
            Self::NotFound { number, .. }
            | Self::Api { number, .. }
            | Self::Transport { number, .. }
            | Self::Decode { number, .. }
            | Self::HistoryTooLong { number, .. } => *number,
        }
    }
}

/// Read access to the remote issue tracker.
pub trait IssueSource {
    /// Fetch the current snapshot of one issue. `parent` is left unset.
    ///
    /// # Errors
    /// Returns [`FetchError`] when the issue cannot be retrieved or decoded.
    fn fetch_issue(&self, number: IssueNumber) -> Result<Issue, FetchError>;

    /// Resolve the parent link of one issue from its event history.
    ///
    /// # Errors
    /// Returns [`FetchError`] when the event history cannot be retrieved or decoded.
    fn resolve_parent(&self, number: IssueNumber) -> Result<Option<IssueNumber>, FetchError>;
}
