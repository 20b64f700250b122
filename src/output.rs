// ABOUTME: Output formatting for CLI feedback.
// ABOUTME: Supports normal, quiet (CI), and JSON output modes for runs, plans, and rejections.

use serde::Serialize;
use std::time::Instant;

use crate::deploy::{DeploymentRun, Rejection, RunStatus};
use crate::plan::RolloutStep;

/// Output mode for CLI feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-friendly output with progress messages
    Normal,
    /// Minimal output for CI (only final result)
    Quiet,
    /// JSON lines for scripting
    Json,
}

/// Handles CLI output based on the configured mode.
pub struct Output {
    mode: OutputMode,
    started: Option<Instant>,
}

#[derive(Serialize)]
struct Event<'a> {
    event: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_secs: Option<f64>,
}

impl Output {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            started: None,
        }
    }

    /// Report durations on success from now on.
    pub fn start_timer(&mut self) {
        self.started = Some(Instant::now());
    }

    fn elapsed(&self) -> Option<f64> {
        self.started.map(|t| t.elapsed().as_secs_f64())
    }

    fn event(&self, event: &str, message: &str) -> Option<String> {
        serde_json::to_string(&Event {
            event,
            message,
            duration_secs: self.elapsed(),
        })
        .ok()
    }

    /// Progress lines only appear in normal mode.
    pub fn progress(&self, message: &str) {
        if self.mode == OutputMode::Normal {
            println!("{message}");
        }
    }

    pub fn success(&self, message: &str) {
        match (self.mode, self.elapsed()) {
            (OutputMode::Json, _) => {
                if let Some(line) = self.event("success", message) {
                    println!("{line}");
                }
            }
            (OutputMode::Normal, Some(secs)) => println!("{message} ({secs:.1}s)"),
            _ => println!("{message}"),
        }
    }

    pub fn error(&self, message: &str) {
        match self.mode {
            OutputMode::Json => {
                if let Some(line) = self.event("error", message) {
                    eprintln!("{line}");
                }
            }
            _ => eprintln!("Error: {message}"),
        }
    }

    /// Print one value as a JSON line, or `human` otherwise.
    fn record<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) {
        if self.mode == OutputMode::Json {
            if let Ok(json) = serde_json::to_string(value) {
                println!("{json}");
            }
        } else {
            println!("{}", human());
        }
    }

    pub fn run_status(&self, status: &RunStatus) {
        self.record(status, || status_line(status));
    }

    pub fn rejection(&self, rejection: &Rejection) {
        self.record(rejection, || {
            format!(
                "{}  {:<16} {:<24} rejected  {}",
                rejection.at.format("%Y-%m-%d %H:%M:%S"),
                rejection.workload.to_string(),
                rejection.revision.to_string(),
                rejection.reason
            )
        });
    }

    /// Print the step plan of a run that has not started.
    pub fn plan(&self, run: &DeploymentRun) {
        self.record(&run.steps, || {
            let from = run
                .previous
                .as_ref()
                .map(|a| a.pinned())
                .unwrap_or_else(|| "nothing".to_string());
            let mut text = format!(
                "{from} -> {} ({} step(s), {})",
                run.target.pinned(),
                run.steps.len(),
                run.policy.strategy.as_str()
            );
            for step in &run.steps {
                text.push('\n');
                text.push_str(&step_line(step));
            }
            text
        });
    }
}

fn step_line(step: &RolloutStep) -> String {
    let targets: Vec<String> = step
        .targets
        .iter()
        .map(|t| format!("{}x {}", t.replicas, t.artifact.digest().short()))
        .collect();
    format!(
        "  {}. {} (min healthy {}, pause {})",
        step.index + 1,
        targets.join(", "),
        step.abort.min_healthy,
        humantime_serde::re::humantime::format_duration(step.pause)
    )
}

fn status_line(status: &RunStatus) -> String {
    let mut line = format!(
        "{}  {}  {:<16} {:<24} {:<12} step {}/{}  {}",
        status.id,
        status.updated_at.format("%Y-%m-%d %H:%M:%S"),
        status.workload.to_string(),
        status.revision.to_string(),
        status.state.as_str(),
        (status.step_index + 1).min(status.steps),
        status.steps,
        status.target
    );
    if let Some(failure) = &status.failure {
        line.push_str(&format!("\n    {failure}"));
    }
    line
}
