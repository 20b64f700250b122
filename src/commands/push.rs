// ABOUTME: Push and plan commands.
// ABOUTME: Turns a revision into a deployment run, or previews its rollout plan.

use super::connection::connect;
use conveyor::config::Config;
use conveyor::coordinator::PushEvent;
use conveyor::deploy::RunState;
use conveyor::error::{Error, Result};
use conveyor::output::Output;
use conveyor::types::{Revision, WorkloadId};

fn event(config: &Config, workload: &str, commit: &str, branch: &str) -> Result<PushEvent> {
    let id = WorkloadId::new(workload).map_err(|e| Error::InvalidConfig(e.to_string()))?;
    config.workload(&id)?;
    Ok(PushEvent::new(id, Revision::new(commit, branch)))
}

/// Deploy `commit` of `workload` and wait for the run to finish.
pub async fn push(
    config: Config,
    workload: &str,
    commit: &str,
    branch: &str,
    tests_passed: Option<bool>,
    mut output: Output,
) -> Result<()> {
    let mut event = event(&config, workload, commit, branch)?;
    event.tests_passed = tests_passed;

    output.start_timer();
    output.progress(&format!("Deploying {} ({})", event.workload, event.revision));

    let coordinator = connect(&config, &output).await?;
    let run = coordinator.submit(event).await?;
    output.run_status(&run.status());

    if run.state == RunState::Succeeded {
        output.success(&format!("Deployed {}", run.target.pinned()));
        return Ok(());
    }

    Err(Error::RunFailed {
        run: run.id.to_string(),
        state: run.state.to_string(),
        reason: run
            .failure
            .map(|f| f.to_string())
            .unwrap_or_else(|| "no reason recorded".to_string()),
    })
}

/// Resolve `commit` and print the steps a push would take.
pub async fn plan(
    config: Config,
    workload: &str,
    commit: &str,
    branch: &str,
    output: Output,
) -> Result<()> {
    let event = event(&config, workload, commit, branch)?;
    let coordinator = connect(&config, &output).await?;
    let run = coordinator.preview(&event).await?;
    output.plan(&run);
    Ok(())
}
