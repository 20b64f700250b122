// ABOUTME: Run inspection and abort commands.
// ABOUTME: Reads the run store directly; no engine connection is needed.

use super::connection::open_store;
use conveyor::config::Config;
use conveyor::deploy::{RunStore, request_abort};
use conveyor::error::{Error, Result};
use conveyor::output::Output;
use conveyor::types::{RunId, WorkloadId};

pub async fn status(config: Config, run: &str, output: Output) -> Result<()> {
    let store = open_store(&config).await?;
    let run = store.load(&RunId::new(run)).await?;
    output.run_status(&run.status());
    Ok(())
}

pub async fn runs(config: Config, workload: Option<&str>, rejected: bool, output: Output) -> Result<()> {
    let store = open_store(&config).await?;
    let workload = workload
        .map(|w| WorkloadId::new(w).map_err(|e| Error::InvalidConfig(e.to_string())))
        .transpose()?;

    if rejected {
        for rejection in store.rejections().await? {
            if workload.as_ref().is_none_or(|w| w == &rejection.workload) {
                output.rejection(&rejection);
            }
        }
        return Ok(());
    }

    let runs = match &workload {
        Some(w) => store.for_workload(w).await?,
        None => store.list().await?,
    };
    if runs.is_empty() {
        output.progress("No runs recorded");
    }
    for run in &runs {
        output.run_status(&run.status());
    }
    Ok(())
}

pub async fn abort(config: Config, run: &str, output: Output) -> Result<()> {
    let store = open_store(&config).await?;
    let id = RunId::new(run);
    request_abort(&store, &id).await?;
    output.success(&format!("Abort requested for {id}"));
    Ok(())
}
