// ABOUTME: Config scaffolding for new projects.
// ABOUTME: Creates a conveyor.yml template with every recognised option spelled out.

use std::path::Path;

use crate::error::{Error, Result};
use crate::types::WorkloadId;

use super::{CONFIG_FILENAME, Config, validate_template_repository};

pub fn init_config(
    dir: &Path,
    workload: Option<&str>,
    repository: Option<&str>,
    force: bool,
) -> Result<()> {
    let config_path = dir.join(CONFIG_FILENAME);

    if config_path.exists() && !force {
        return Err(Error::AlreadyExists(config_path));
    }

    let mut config = Config::template();

    if let Some(id) = workload {
        config.workloads.head.id =
            WorkloadId::new(id).map_err(|e| Error::InvalidConfig(e.to_string()))?;
    }

    if let Some(repo) = repository {
        validate_template_repository(repo)?;
        config.workloads.head.repository = repo.to_string();
    }

    let yaml = generate_template_yaml(&config);
    std::fs::write(&config_path, yaml)?;

    Ok(())
}

fn generate_template_yaml(config: &Config) -> String {
    let workload = config.workloads.first();
    format!(
        r#"workloads:
  - id: {}
    repository: {}
    replicas: {}
    # Registry tag pushed by CI. Placeholders: {{commit}}, {{short}}, {{branch}}
    tag: "{}"
    readiness:
      probe:
        type: http        # http | tcp | exec | cluster
        path: /healthz
        port: 8080
      timeout: 5s
      success_threshold: 1
      failure_threshold: 3

rollout:
  strategy: rolling-update   # rolling-update | recreate
  max_unavailable: 1
  max_surge: 0
  step_pause: 5s

verify:
  poll_interval: 2s
  timeout: 2m

coordinator:
  max_retries: 5
  backoff_base: 5s
  # Refuse to deploy revisions whose tests did not pass
  require_tests: false
"#,
        workload.id, workload.repository, workload.replicas, workload.tag
    )
}
