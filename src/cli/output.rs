//! Output formatting for CLI commands.
//!
//! Formatters return strings; the entrypoint decides which stream they go to.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::planner::{
    format_duration, ApplyReport, ChangeAction, ChangeOutcome, ChangeStatus, PlanArtifact, PlanName,
};

use super::commands::OutputFormat;

/// Longest reason or error shown in a table cell.
const MAX_CELL_CHARS: usize = 60;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Planned change row for table display.
#[derive(Tabled)]
struct PlanChangeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Change outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Time")]
    duration: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// Stored plan row for table display.
#[derive(Tabled)]
struct PlanListRow {
    #[tabled(rename = "Plan")]
    name: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Created")]
    created_at: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns whether machine-readable output was requested.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Formats a plan artifact for display.
    #[must_use]
    pub fn format_plan(&self, plan: &PlanArtifact) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &PlanArtifact) -> String {
        let mut output = String::new();

        let _ = writeln!(output, "Plan {}", plan.name.bold());
        let _ = writeln!(
            output,
            "   Source: {}   State serial: {}",
            plan.source_path, plan.state_serial
        );

        if plan.is_empty() {
            let _ = writeln!(
                output,
                "{} No changes. Infrastructure matches the resource file.",
                "✓".green()
            );
            return output;
        }

        let rows: Vec<PlanChangeRow> = plan
            .changes
            .iter()
            .enumerate()
            .map(|(i, c)| PlanChangeRow {
                index: i + 1,
                action: Self::format_action(c.action),
                resource: c.resource_id.clone(),
                kind: c.resource_kind.clone(),
                reason: Self::truncate(&c.reason, MAX_CELL_CHARS),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete",
            plan.count(ChangeAction::Create).to_string().green(),
            plan.count(ChangeAction::Update).to_string().yellow(),
            plan.count(ChangeAction::Delete).to_string().red()
        );

        output
    }

    /// Formats an apply report for display.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    /// Formats a report as text.
    fn format_report_text(report: &ApplyReport) -> String {
        let mut output = String::new();

        let _ = writeln!(
            output,
            "Apply {} with provider {} ({})",
            report.plan.bold(),
            report.provider,
            report.policy
        );

        if !report.outcomes.is_empty() {
            let rows: Vec<OutcomeRow> = report.outcomes.iter().map(Self::outcome_row).collect();
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let marker = if report.success {
            "✓".green()
        } else {
            "✗".red()
        };
        let _ = writeln!(output, "{marker} {report}");

        if report.cancelled {
            let _ = writeln!(output, "{} Run was cancelled", "⚠".yellow());
        }
        if report.timed_out {
            let _ = writeln!(output, "{} Run hit its time limit", "⚠".yellow());
        }

        output
    }

    /// Builds a table row for one outcome.
    fn outcome_row(outcome: &ChangeOutcome) -> OutcomeRow {
        let error = match (&outcome.cause, &outcome.error) {
            (Some(cause), Some(error)) => format!("[{cause}] {error}"),
            (None, Some(error)) => error.clone(),
            _ => String::new(),
        };

        OutcomeRow {
            index: outcome.index + 1,
            action: Self::format_action(outcome.action),
            resource: outcome.resource_id.clone(),
            status: Self::format_status(outcome.status),
            duration: format_duration(std::time::Duration::from_millis(outcome.duration_ms)),
            error: Self::truncate(&error, MAX_CELL_CHARS),
        }
    }

    /// Formats the stored plan list for display.
    #[must_use]
    pub fn format_plan_list(&self, plans: &[PlanName]) -> String {
        match self.format {
            OutputFormat::Json => {
                let entries: Vec<PlanEntryJson> = plans.iter().map(PlanEntryJson::from).collect();
                serde_json::to_string_pretty(&entries).unwrap_or_default()
            }
            OutputFormat::Text => {
                if plans.is_empty() {
                    return String::from("No plans stored.\n");
                }

                let rows: Vec<PlanListRow> = plans
                    .iter()
                    .map(|p| PlanListRow {
                        name: p.to_string(),
                        resource: p.resource().to_string(),
                        created_at: p.timestamp(),
                    })
                    .collect();

                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    /// Formats a change action with color.
    fn format_action(action: ChangeAction) -> String {
        match action {
            ChangeAction::Create => "+ create".green().to_string(),
            ChangeAction::Update => "~ update".yellow().to_string(),
            ChangeAction::Delete => "- delete".red().to_string(),
        }
    }

    /// Formats a change status with color.
    fn format_status(status: ChangeStatus) -> String {
        let text = status.to_string();
        match status {
            ChangeStatus::Succeeded => text.green().to_string(),
            ChangeStatus::Failed => text.red().to_string(),
            ChangeStatus::Skipped => text.dimmed().to_string(),
            ChangeStatus::Pending | ChangeStatus::InProgress => text.yellow().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

// JSON serialization helpers

#[derive(serde::Serialize)]
struct PlanEntryJson {
    name: String,
    resource: String,
    created_at: String,
}

/// Writes a block of output, ending it with a newline, and flushes.
///
/// # Errors
///
/// Returns the first write or flush error, such as a closed pipe.
pub fn write_block(out: &mut impl std::io::Write, text: &str) -> std::io::Result<()> {
    out.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        out.write_all(b"\n")?;
    }
    out.flush()
}

impl From<&PlanName> for PlanEntryJson {
    fn from(name: &PlanName) -> Self {
        Self {
            name: name.to_string(),
            resource: name.resource().to_string(),
            created_at: name.timestamp(),
        }
    }
}
