//! GitHub REST implementation of [`IssueSource`].
//!
//! Parent links are read from the issue timeline: the first `connected` event
//! whose subject is an issue names the parent. Later links are ignored.

use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use issue_hierarchy_core::{FetchError, Issue, IssueNumber, IssueSource, IssueState};
use serde::de::DeserializeOwned;
use serde::Deserialize;

pub const TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const REPOSITORY_ENV: &str = "GITHUB_REPOSITORY";
pub const API_URL_ENV: &str = "GITHUB_API_URL";
pub const TIMEOUT_MS_ENV: &str = "ISSUE_HIERARCHY_TIMEOUT_MS";

pub const DEFAULT_REPOSITORY: &str = "seriously-not-prod/break-things-here";
pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 120_000;
const TIMELINE_PAGE_SIZE: usize = 100;
const MAX_TIMELINE_PAGES: usize = 100;
const MAX_ERROR_BODY_CHARS: usize = 200;
const USER_AGENT: &str = "Issue-Hierarchy-Validator";
const ACCEPT: &str = "application/vnd.github+json";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("GITHUB_TOKEN environment variable is required")]
    MissingToken,
    #[error("invalid repository `{0}`: expected owner/repo")]
    InvalidRepository(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RepositoryCoordinate {
    pub owner: String,
    pub repo: String,
}

impl FromStr for RepositoryCoordinate {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        match trimmed.split_once('/') {
            Some((owner, repo))
                if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') =>
            {
                Ok(Self { owner: owner.to_string(), repo: repo.to_string() })
            }
            _ => Err(ConfigError::InvalidRepository(trimmed.to_string())),
        }
    }
}

impl Display for RepositoryCoordinate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Process-wide settings, resolved once at startup.
#[derive(Clone)]
pub struct GitHubConfig {
    pub token: String,
    pub repository: RepositoryCoordinate,
    pub api_base_url: String,
    pub timeout: Duration,
}

impl Debug for GitHubConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("token", &"<redacted>")
            .field("repository", &self.repository)
            .field("api_base_url", &self.api_base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GitHubConfig {
    /// Read configuration from the process environment.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the token is missing or the repository is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which maps variable names to values.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the token is missing or the repository is malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup(TOKEN_ENV)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingToken)?;

        let repository = lookup(REPOSITORY_ENV)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REPOSITORY.to_string())
            .parse::<RepositoryCoordinate>()?;

        let api_base_url = lookup(API_URL_ENV)
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let timeout_ms = lookup(TIMEOUT_MS_ENV)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map_or(DEFAULT_TIMEOUT_MS, |value| value.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS));

        Ok(Self {
            token,
            repository,
            api_base_url,
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LabelPayload {
    Named { name: String },
    Bare(String),
}

impl LabelPayload {
    fn into_name(self) -> String {
        match self {
            Self::Named { name } | Self::Bare(name) => name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    labels: Vec<LabelPayload>,
    state: IssueState,
}

impl IssuePayload {
    fn into_issue(self) -> Issue {
        Issue {
            number: IssueNumber(self.number),
            title: self.title,
            labels: self.labels.into_iter().map(LabelPayload::into_name).collect(),
            state: self.state,
            parent: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Eq, PartialEq)]
pub struct TimelineEvent {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub source: Option<EventSource>,
    #[serde(default)]
    pub subject: Option<EventSubject>,
}

#[derive(Debug, Clone, Default, Deserialize, Eq, PartialEq)]
pub struct EventSource {
    #[serde(default)]
    pub issue: Option<LinkedIssue>,
}

#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
pub struct LinkedIssue {
    pub number: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Eq, PartialEq)]
pub struct EventSubject {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl TimelineEvent {
    /// The parent named by a sub-issue link event, if this is one.
    #[must_use]
    pub fn linked_parent(&self) -> Option<IssueNumber> {
        if self.event.as_deref() != Some("connected") {
            return None;
        }
        let linked = self.source.as_ref()?.issue.as_ref()?;
        let subject_is_issue =
            self.subject.as_ref().and_then(|subject| subject.kind.as_deref()) == Some("issue");
        subject_is_issue.then_some(IssueNumber(linked.number))
    }
}

/// First parent link in emitted order.
#[must_use]
pub fn resolve_parent_from_events(events: &[TimelineEvent]) -> Option<IssueNumber> {
    events.iter().find_map(TimelineEvent::linked_parent)
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

fn summarize_error_body(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) {
        return parsed.message;
    }
    let trimmed = body.trim();
    if trimmed.chars().count() > MAX_ERROR_BODY_CHARS {
        let head = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>();
        format!("{head}...")
    } else {
        trimmed.to_string()
    }
}

/// Blocking GitHub client. One request at a time, bounded by the configured timeout.
pub struct GitHubClient {
    agent: ureq::Agent,
    api_base_url: String,
    repository: RepositoryCoordinate,
    auth_header: String,
    max_timeline_pages: usize,
}

impl Debug for GitHubClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("api_base_url", &self.api_base_url)
            .field("repository", &self.repository)
            .finish_non_exhaustive()
    }
}

impl GitHubClient {
    #[must_use]
    pub fn new(config: &GitHubConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build();

        Self {
            agent,
            api_base_url: config.api_base_url.clone(),
            repository: config.repository.clone(),
            auth_header: format!("Bearer {}", config.token),
            max_timeline_pages: MAX_TIMELINE_PAGES,
        }
    }

    #[must_use]
    pub fn repository(&self) -> &RepositoryCoordinate {
        &self.repository
    }

    fn issue_url(&self, number: IssueNumber) -> String {
        format!(
            "{}/repos/{}/{}/issues/{number}",
            self.api_base_url, self.repository.owner, self.repository.repo
        )
    }

    fn get_json<T>(&self, number: IssueNumber, url: &str) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
    {
        tracing::debug!(issue = number.0, %url, "GET");
        let response = self
            .agent
            .get(url)
            .set("Authorization", &self.auth_header)
            .set("Accept", ACCEPT)
            .call()
            .map_err(|err| map_request_error(number, err))?;

        response
            .into_json::<T>()
            .map_err(|err| FetchError::Decode { number, message: err.to_string() })
    }
}

fn map_request_error(number: IssueNumber, err: ureq::Error) -> FetchError {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            let message = summarize_error_body(&body);
            tracing::debug!(issue = number.0, status, bytes = body.len(), "GitHub API error");
            if status == 404 {
                FetchError::NotFound { number, message }
            } else {
                FetchError::Api { number, status, message }
            }
        }
        ureq::Error::Transport(transport) => {
            FetchError::Transport { number, message: transport.to_string() }
        }
    }
}

impl IssueSource for GitHubClient {
    fn fetch_issue(&self, number: IssueNumber) -> Result<Issue, FetchError> {
        let payload: IssuePayload = self.get_json(number, &self.issue_url(number))?;
        Ok(payload.into_issue())
    }

    /// Scans the whole timeline until a short page. Hitting the page cap is an
    /// error rather than "no parent", since the link may sit past the cap.
    fn resolve_parent(&self, number: IssueNumber) -> Result<Option<IssueNumber>, FetchError> {
        let base = format!("{}/timeline", self.issue_url(number));
        for page in 1..=self.max_timeline_pages {
            let url = format!("{base}?per_page={TIMELINE_PAGE_SIZE}&page={page}");
            let events: Vec<TimelineEvent> = self.get_json(number, &url)?;
            if let Some(parent) = resolve_parent_from_events(&events) {
                return Ok(Some(parent));
            }
            if events.len() < TIMELINE_PAGE_SIZE {
                return Ok(None);
            }
        }
        tracing::warn!(
            issue = number.0,
            pages = self.max_timeline_pages,
            "timeline scan hit page cap"
        );
        Err(FetchError::HistoryTooLong { number, pages: self.max_timeline_pages })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use super::*;

    struct MockResponse {
        path: String,
        status: u16,
        body: String,
        delay_ms: u64,
    }

    impl MockResponse {
        fn ok(path: impl Into<String>, body: impl Into<String>) -> Self {
            Self { path: path.into(), status: 200, body: body.into(), delay_ms: 0 }
        }

        fn status(path: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
            Self { path: path.into(), status, body: body.into(), delay_ms: 0 }
        }
    }

    fn reason_phrase(status: u16) -> &'static str {
        match status {
            401 => "Unauthorized",
            404 => "Not Found",
            500 => "Internal Server Error",
            _ => "OK",
        }
    }

    fn read_request(stream: &mut TcpStream) -> String {
        let mut buffer = [0_u8; 8192];
        let bytes = stream
            .read(&mut buffer)
            .unwrap_or_else(|err| panic!("failed to read request: {err}"));
        String::from_utf8_lossy(&buffer[..bytes]).to_string()
    }

    fn spawn_mock_server(responses: Vec<MockResponse>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .unwrap_or_else(|err| panic!("failed to bind test server: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("failed to read local addr: {err}"));
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for response in responses {
                let (mut stream, _) = listener
                    .accept()
                    .unwrap_or_else(|err| panic!("failed to accept connection: {err}"));
                let request = read_request(&mut stream);
                let path = request
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or_default()
                    .to_string();
                assert_eq!(path, response.path);
                requests.push(request);

                if response.delay_ms > 0 {
                    thread::sleep(Duration::from_millis(response.delay_ms));
                }

                let payload = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    response.status,
                    reason_phrase(response.status),
                    response.body.len(),
                    response.body
                );
                // The client may already have hung up on a delayed response.
                let _ = stream.write_all(payload.as_bytes());
            }
            requests
        });
        (format!("http://{addr}"), handle)
    }

    fn join_server(handle: thread::JoinHandle<Vec<String>>) -> Vec<String> {
        handle.join().unwrap_or_else(|_| panic!("mock server thread panicked"))
    }

    fn test_config(base_url: &str, timeout_ms: u64) -> GitHubConfig {
        GitHubConfig {
            token: "test-token".to_string(),
            repository: RepositoryCoordinate { owner: "acme".to_string(), repo: "widgets".to_string() },
            api_base_url: base_url.to_string(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn events(value: serde_json::Value) -> Vec<TimelineEvent> {
        serde_json::from_value(value).unwrap_or_else(|err| panic!("invalid timeline fixture: {err}"))
    }

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect::<BTreeMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn first_connected_issue_event_wins() {
        let timeline = events(serde_json::json!([
            {"event": "labeled", "label": {"name": "task"}},
            {"event": "connected", "source": {"issue": {"number": 12}}, "subject": {"type": "pull_request"}},
            {"event": "connected", "source": {"issue": {"number": 7}}, "subject": {"type": "issue"}},
            {"event": "connected", "source": {"issue": {"number": 9}}, "subject": {"type": "issue"}}
        ]));
        assert_eq!(resolve_parent_from_events(&timeline), Some(IssueNumber(7)));
    }

    #[test]
    fn events_without_source_issue_are_ignored() {
        let timeline = events(serde_json::json!([
            {"event": "connected", "subject": {"type": "issue"}},
            {"event": "connected", "source": {}, "subject": {"type": "issue"}},
            {"event": "cross-referenced", "source": {"issue": {"number": 3}}, "subject": {"type": "issue"}},
            {}
        ]));
        assert_eq!(resolve_parent_from_events(&timeline), None);
    }

    #[test]
    fn repository_coordinate_requires_owner_and_repo() {
        let parsed = "acme/widgets"
            .parse::<RepositoryCoordinate>()
            .unwrap_or_else(|err| panic!("valid coordinate rejected: {err}"));
        assert_eq!(parsed.to_string(), "acme/widgets");

        for raw in ["acme", "/widgets", "acme/", "acme/widgets/extra"] {
            assert_eq!(
                raw.parse::<RepositoryCoordinate>(),
                Err(ConfigError::InvalidRepository(raw.to_string()))
            );
        }
    }

    #[test]
    fn config_requires_non_blank_token() {
        assert_eq!(GitHubConfig::from_lookup(lookup_from(&[])).err(), Some(ConfigError::MissingToken));
        assert_eq!(
            GitHubConfig::from_lookup(lookup_from(&[(TOKEN_ENV, "  ")])).err(),
            Some(ConfigError::MissingToken)
        );
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = GitHubConfig::from_lookup(lookup_from(&[(TOKEN_ENV, "secret")]))
            .unwrap_or_else(|err| panic!("defaults should load: {err}"));
        assert_eq!(defaults.repository.to_string(), DEFAULT_REPOSITORY);
        assert_eq!(defaults.api_base_url, DEFAULT_API_URL);
        assert_eq!(defaults.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert!(!format!("{defaults:?}").contains("secret"));

        let custom = GitHubConfig::from_lookup(lookup_from(&[
            (TOKEN_ENV, "secret"),
            (REPOSITORY_ENV, "acme/widgets"),
            (API_URL_ENV, "https://ghe.example.com/api/v3/"),
            (TIMEOUT_MS_ENV, "5"),
        ]))
        .unwrap_or_else(|err| panic!("overrides should load: {err}"));
        assert_eq!(custom.repository.owner, "acme");
        assert_eq!(custom.api_base_url, "https://ghe.example.com/api/v3");
        assert_eq!(custom.timeout, Duration::from_millis(MIN_TIMEOUT_MS));
    }

    #[test]
    fn error_body_prefers_api_message() {
        assert_eq!(summarize_error_body(r#"{"message":"Bad credentials","status":"401"}"#), "Bad credentials");
        assert_eq!(summarize_error_body(" upstream down "), "upstream down");
        assert!(summarize_error_body(&"x".repeat(500)).ends_with("..."));
    }

    #[test]
    fn fetch_issue_decodes_labels_and_state() {
        let (base_url, handle) = spawn_mock_server(vec![MockResponse::ok(
            "/repos/acme/widgets/issues/42",
            r#"{"number":42,"title":"Ship it","labels":[{"name":"task","color":"fff"},"backend"],"state":"open"}"#,
        )]);
        let client = GitHubClient::new(&test_config(&base_url, 2_000));

        let issue = client
            .fetch_issue(IssueNumber(42))
            .unwrap_or_else(|err| panic!("fetch should succeed: {err}"));

        assert_eq!(issue.title, "Ship it");
        assert_eq!(issue.labels, vec!["task".to_string(), "backend".to_string()]);
        assert_eq!(issue.state, IssueState::Open);
        assert_eq!(issue.parent, None);

        let requests = join_server(handle);
        let request = requests[0].to_ascii_lowercase();
        assert!(request.contains("authorization: bearer test-token"));
        assert!(request.contains("accept: application/vnd.github+json"));
    }

    #[test]
    fn missing_issue_maps_to_not_found() {
        let (base_url, handle) = spawn_mock_server(vec![MockResponse::status(
            "/repos/acme/widgets/issues/404",
            404,
            r#"{"message":"Not Found"}"#,
        )]);
        let client = GitHubClient::new(&test_config(&base_url, 2_000));

        let err = client.fetch_issue(IssueNumber(404)).err();
        join_server(handle);

        assert_eq!(
            err,
            Some(FetchError::NotFound { number: IssueNumber(404), message: "Not Found".to_string() })
        );
    }

    #[test]
    fn server_error_keeps_status() {
        let (base_url, handle) = spawn_mock_server(vec![MockResponse::status(
            "/repos/acme/widgets/issues/5",
            500,
            "boom",
        )]);
        let client = GitHubClient::new(&test_config(&base_url, 2_000));

        let err = client.fetch_issue(IssueNumber(5)).err();
        join_server(handle);

        assert_eq!(
            err.map(|err| err.to_string()),
            Some("failed to fetch issue #5: API error: HTTP 500: boom".to_string())
        );
    }

    #[test]
    fn malformed_payload_maps_to_decode_error() {
        let (base_url, handle) = spawn_mock_server(vec![MockResponse::ok(
            "/repos/acme/widgets/issues/6",
            r#"{"title":"no number"}"#,
        )]);
        let client = GitHubClient::new(&test_config(&base_url, 2_000));

        let err = client.fetch_issue(IssueNumber(6)).err();
        join_server(handle);

        assert!(matches!(err, Some(FetchError::Decode { number: IssueNumber(6), .. })));
    }

    #[test]
    fn slow_response_maps_to_transport_error() {
        let (base_url, handle) = spawn_mock_server(vec![MockResponse {
            path: "/repos/acme/widgets/issues/8".to_string(),
            status: 200,
            body: r#"{"number":8,"title":"slow","labels":[],"state":"open"}"#.to_string(),
            delay_ms: 600,
        }]);
        let client = GitHubClient::new(&test_config(&base_url, 150));

        let err = client.fetch_issue(IssueNumber(8)).err();
        join_server(handle);

        assert!(matches!(err, Some(FetchError::Transport { number: IssueNumber(8), .. })));
    }

    #[test]
    fn unreachable_host_maps_to_transport_error() {
        let client = GitHubClient::new(&test_config("http://127.0.0.1:9", 500));
        let err = client.fetch_issue(IssueNumber(1)).err();
        assert!(matches!(err, Some(FetchError::Transport { .. })));
    }

    #[test]
    fn resolve_parent_pages_until_match() {
        let filler = serde_json::Value::Array(
            (0..TIMELINE_PAGE_SIZE).map(|_| serde_json::json!({"event": "commented"})).collect(),
        )
        .to_string();
        let (base_url, handle) = spawn_mock_server(vec![
            MockResponse::ok("/repos/acme/widgets/issues/50/timeline?per_page=100&page=1", filler),
            MockResponse::ok(
                "/repos/acme/widgets/issues/50/timeline?per_page=100&page=2",
                r#"[{"event":"connected","source":{"issue":{"number":49}},"subject":{"type":"issue"}}]"#,
            ),
        ]);
        let client = GitHubClient::new(&test_config(&base_url, 2_000));

        let parent = client
            .resolve_parent(IssueNumber(50))
            .unwrap_or_else(|err| panic!("timeline should resolve: {err}"));
        join_server(handle);

        assert_eq!(parent, Some(IssueNumber(49)));
    }

    #[test]
    fn short_timeline_without_link_has_no_parent() {
        let (base_url, handle) = spawn_mock_server(vec![MockResponse::ok(
            "/repos/acme/widgets/issues/51/timeline?per_page=100&page=1",
            r#"[{"event":"labeled"},{"event":"connected","source":{"issue":{"number":2}}}]"#,
        )]);
        let client = GitHubClient::new(&test_config(&base_url, 2_000));

        let parent = client
            .resolve_parent(IssueNumber(51))
            .unwrap_or_else(|err| panic!("timeline should resolve: {err}"));
        let requests = join_server(handle);

        assert_eq!(parent, None);
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn timeline_past_page_cap_is_an_error() {
        let filler = || {
            serde_json::Value::Array(
                (0..TIMELINE_PAGE_SIZE).map(|_| serde_json::json!({"event": "commented"})).collect(),
            )
            .to_string()
        };
        let (base_url, handle) = spawn_mock_server(vec![
            MockResponse::ok("/repos/acme/widgets/issues/60/timeline?per_page=100&page=1", filler()),
            MockResponse::ok("/repos/acme/widgets/issues/60/timeline?per_page=100&page=2", filler()),
        ]);
        let mut client = GitHubClient::new(&test_config(&base_url, 2_000));
        client.max_timeline_pages = 2;

        let err = client.resolve_parent(IssueNumber(60)).err();
        let requests = join_server(handle);

        assert_eq!(requests.len(), 2);
        assert_eq!(err, Some(FetchError::HistoryTooLong { number: IssueNumber(60), pages: 2 }));
    }
}
