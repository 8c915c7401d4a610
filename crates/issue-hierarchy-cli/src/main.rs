use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use issue_hierarchy_core::{validate_issues, HierarchyLevel, IssueNumber, ValidationReport};
use issue_hierarchy_github::{GitHubClient, GitHubConfig};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const REPORT_CONTRACT_VERSION: &str = "report.v1";
const RULE: &str = "═══════════════════════════════════════════════════════════";

#[derive(Debug, Parser)]
#[command(name = "validate-issue-hierarchy", version)]
#[command(about = "Check that issues follow the Theme → User Story → Task → Sub-Task hierarchy")]
struct Cli {
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Issue numbers to validate. Values without a leading positive integer are ignored.
    #[arg(value_name = "ISSUE", allow_hyphen_values = true)]
    issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    init_tracing();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Returns whether every requested issue passed.
fn run(cli: &Cli) -> Result<bool> {
    if cli.issues.is_empty() {
        return Err(anyhow!(
            "no issue numbers given\nUsage: validate-issue-hierarchy <ISSUE>...\n\
             Example: validate-issue-hierarchy 123 456 789"
        ));
    }

    let numbers = parse_issue_numbers(&cli.issues);
    if numbers.is_empty() {
        return Err(anyhow!("no valid issue numbers provided"));
    }

    let config = GitHubConfig::from_env().context("invalid configuration")?;
    tracing::debug!(?config, "configuration loaded");
    let client = GitHubClient::new(&config);
    let repository = config.repository.to_string();

    let report = validate_issues(&client, &numbers);

    match cli.format {
        OutputFormat::Text => println!("{}", render_text_report(&repository, &numbers, &report)),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json_report(&repository, &report)?)
                .context("failed to serialize validation report")?
        ),
    }

    Ok(report.all_valid)
}

fn parse_issue_numbers(args: &[String]) -> Vec<IssueNumber> {
    args.iter().filter_map(|arg| parse_issue_number(arg)).collect()
}

/// Reads the leading decimal integer of `arg` (after whitespace and an optional
/// sign) and ignores the rest, so `"12abc"` is 12 and `"3.5"` is 3.
fn parse_issue_number(arg: &str) -> Option<IssueNumber> {
    let trimmed = arg.trim_start();
    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let digits = unsigned.find(|c: char| !c.is_ascii_digit()).unwrap_or(unsigned.len());
    let value = unsigned[..digits].parse::<u64>().ok()?;
    (!negative && value > 0).then_some(IssueNumber(value))
}

fn json_report(repository: &str, report: &ValidationReport) -> Result<Value> {
    let results =
        serde_json::to_value(&report.results).context("failed to serialize issue results")?;
    Ok(serde_json::json!({
        "contract_version": REPORT_CONTRACT_VERSION,
        "repository": repository,
        "all_valid": report.all_valid,
        "valid_count": report.valid_count(),
        "invalid_count": report.invalid_count(),
        "results": results,
    }))
}

fn hierarchy_diagram() -> Vec<String> {
    HierarchyLevel::ALL
        .iter()
        .enumerate()
        .map(|(depth, level)| {
            let placement = match level.required_parent() {
                None => "(standalone)".to_string(),
                Some(parent) => format!("(sub-issue of {})", parent.display_name()),
            };
            if depth == 0 {
                format!("  {} {placement}", level.display_name())
            } else {
                format!("  {}└── {} {placement}", "    ".repeat(depth - 1), level.display_name())
            }
        })
        .collect()
}

fn render_text_report(repository: &str, numbers: &[IssueNumber], report: &ValidationReport) -> String {
    let mut lines = vec![
        "Validating issue hierarchy...".to_string(),
        String::new(),
        format!("Repository: {repository}"),
        format!(
            "Issues to validate: {}",
            numbers.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        ),
        String::new(),
    ];

    for result in &report.results {
        let title = result
            .issue
            .as_ref()
            .map(|issue| format!(" {}", issue.title))
            .unwrap_or_default();
        let status = if result.is_valid() { "PASS" } else { "FAIL" };
        lines.push(format!("[{status}] #{}{title}", result.number));
        for error in result.verdict.errors() {
            for (index, line) in error.lines().enumerate() {
                if index == 0 {
                    lines.push(format!("  error: {line}"));
                } else {
                    lines.push(format!("  {line}"));
                }
            }
        }
        for warning in result.verdict.warnings() {
            lines.push(format!("  warning: {warning}"));
        }
    }

    lines.push(String::new());
    lines.push(RULE.to_string());
    lines.push("Summary:".to_string());
    lines.push(RULE.to_string());
    lines.push(format!("Valid issues: {}", report.valid_count()));
    lines.push(format!("Invalid issues: {}", report.invalid_count()));
    lines.push(String::new());

    if report.all_valid {
        lines.push("All issues follow proper hierarchy!".to_string());
    } else {
        lines.push("Validation failed! Issues do not follow proper hierarchy.".to_string());
        lines.push(String::new());
        lines.push("Required hierarchy:".to_string());
        lines.extend(hierarchy_diagram());
        lines.push(String::new());
        lines.push("How to fix:".to_string());
        lines.push("  1. Navigate to the parent issue".to_string());
        lines.push("  2. Click \"Create sub-issue\" at the bottom".to_string());
        lines.push("  3. Or click dropdown → \"Add existing issue\"".to_string());
    }

    lines.join("\n")
}
