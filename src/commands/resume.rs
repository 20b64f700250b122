// ABOUTME: Resume command implementation.
// ABOUTME: Drives every run a previous process left unfinished to a terminal state.

use super::connection::connect;
use conveyor::config::Config;
use conveyor::error::{Error, Result};
use conveyor::output::Output;

pub async fn resume(config: Config, mut output: Output) -> Result<()> {
    output.start_timer();
    let coordinator = connect(&config, &output).await?;
    let outcomes = coordinator.recover().await?;

    if outcomes.is_empty() {
        output.success("No interrupted runs");
        return Ok(());
    }

    let mut failed = 0;
    for (id, outcome) in outcomes {
        match outcome {
            Ok(run) => output.run_status(&run.status()),
            Err(e) => {
                output.error(&format!("{id}: {e}"));
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(Error::ResumeFailed(failed));
    }
    output.success("Interrupted runs finished");
    Ok(())
}
