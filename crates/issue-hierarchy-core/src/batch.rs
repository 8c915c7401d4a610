use serde::Serialize;

use crate::{validate_issue_hierarchy, FetchError, Issue, IssueNumber, IssueSource, Verdict};

/// Outcome for one requested issue number.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct IssueResult {
    pub number: IssueNumber,
    /// Absent when the issue itself could not be fetched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<Issue>,
    #[serde(flatten)]
    pub verdict: Verdict,
}

impl IssueResult {
    fn checked(issue: Issue, verdict: Verdict) -> Self {
        Self { number: issue.number, issue: Some(issue), verdict }
    }

    fn failed(number: IssueNumber, issue: Option<Issue>, err: &FetchError) -> Self {
        Self { number, issue, verdict: Verdict::invalid(err.to_string()) }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.verdict.is_valid()
    }
}

/// Aggregate result of one batch, ordered like the requested numbers.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ValidationReport {
    pub all_valid: bool,
    pub results: Vec<IssueResult>,
}

impl ValidationReport {
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.results.iter().filter(|result| result.is_valid()).count()
    }

    #[must_use]
    pub fn invalid_count(&self) -> usize {
        self.results.len() - self.valid_count()
    }
}

/// Validate `numbers` one after another against `source`.
///
/// A failed lookup only invalidates the issue it belongs to; the batch always
/// runs to completion.
pub fn validate_issues<S>(source: &S, numbers: &[IssueNumber]) -> ValidationReport
where
    S: IssueSource + ?Sized,
{
    let results = numbers.iter().map(|number| check_issue(source, *number)).collect::<Vec<_>>();
    let all_valid = results.iter().all(IssueResult::is_valid);
    ValidationReport { all_valid, results }
}

fn check_issue<S>(source: &S, number: IssueNumber) -> IssueResult
where
    S: IssueSource + ?Sized,
{
    tracing::info!(issue = number.0, "checking issue");

    let mut issue = match source.fetch_issue(number) {
        Ok(issue) => issue,
        Err(err) => {
            tracing::warn!(issue = number.0, error = %err, "issue lookup failed");
            return IssueResult::failed(number, None, &err);
        }
    };

    if issue.is_closed() {
        tracing::info!(issue = number.0, "issue is closed, skipping hierarchy checks");
        return IssueResult::checked(issue, Verdict::closed());
    }

    let parent_link = match source.resolve_parent(number) {
        Ok(parent_link) => parent_link,
        Err(err) => {
            tracing::warn!(issue = number.0, error = %err, "parent resolution failed");
            return IssueResult::failed(number, Some(issue), &err);
        }
    };
    issue.parent = parent_link;

    let parent = match issue.parent.map(|parent| source.fetch_issue(parent)).transpose() {
        Ok(parent) => parent,
        Err(err) => {
            tracing::warn!(issue = number.0, parent = err.number().0, error = %err, "parent lookup failed");
            return IssueResult::failed(number, Some(issue), &err);
        }
    };

    let verdict = validate_issue_hierarchy(&issue, parent.as_ref());
    tracing::info!(issue = number.0, valid = verdict.is_valid(), "issue checked");
    IssueResult::checked(issue, verdict)
}
