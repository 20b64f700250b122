// ABOUTME: Integration tests for the pipeline coordinator.
// ABOUTME: Push handling, gates, rejections, per-workload queueing, locks, and recovery.

mod support;

use conveyor::cluster::SimulatedCluster;
use conveyor::config::Config;
use conveyor::coordinator::{Coordinator, PushEvent};
use conveyor::deploy::{
    DeployErrorKind, LockHolderInfo, MemoryRunStore, RunState, RunStore, WorkloadLocks,
};
use conveyor::hooks::HookRunner;
use conveyor::plan::WorkloadSpec;
use conveyor::registry::StaticRegistry;
use conveyor::types::{ArtifactRef, Digest, Revision, RunId, WorkloadId};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use support::{SlowStore, init_tracing};
use tempfile::TempDir;

const CONFIG: &str = r#"
workloads:
  - id: web
    repository: registry.test/web
    replicas: 2
    tag: "{short}"
    readiness:
      probe:
        type: cluster
      timeout: 1s
      success_threshold: 1
      failure_threshold: 2
  - id: api
    repository: registry.test/api
    replicas: 1
    tag: "{short}"
    readiness:
      probe:
        type: cluster
rollout:
  max_unavailable: 1
  step_pause: 0s
verify:
  poll_interval: 5ms
  timeout: 500ms
coordinator:
  max_retries: 2
  backoff_base: 1ms
registry:
  retries: 1
  backoff: 1ms
cluster:
  call_timeout: 1s
  apply_retries: 1
  apply_backoff: 1ms
"#;

struct Harness {
    coordinator: Arc<Coordinator>,
    registry: Arc<StaticRegistry>,
    cluster: Arc<SimulatedCluster>,
    store: Arc<MemoryRunStore>,
}

fn harness_with(config: &Config, locks: WorkloadLocks) -> Harness {
    init_tracing();
    let registry = Arc::new(StaticRegistry::new());
    let cluster = Arc::new(SimulatedCluster::new());
    let store = Arc::new(MemoryRunStore::new());
    let coordinator = Coordinator::new(
        config,
        registry.clone(),
        cluster.clone(),
        store.clone(),
        locks,
    );
    Harness {
        coordinator: Arc::new(coordinator),
        registry,
        cluster,
        store,
    }
}

fn harness() -> Harness {
    harness_with(&Config::from_yaml(CONFIG).unwrap(), WorkloadLocks::in_process())
}

/// A coordinator standing in for a separate process: its own lock table
/// over the lock directory `dir`, sharing `store` and `cluster`.
fn coordinator_on(
    config: &Config,
    registry: &Arc<StaticRegistry>,
    cluster: &Arc<SimulatedCluster>,
    store: Arc<dyn RunStore>,
    dir: &Path,
) -> Arc<Coordinator> {
    Arc::new(Coordinator::new(
        config,
        registry.clone(),
        cluster.clone(),
        store,
        WorkloadLocks::new(dir.to_path_buf()),
    ))
}

fn workload(id: &str) -> WorkloadId {
    WorkloadId::new(id).unwrap()
}

fn digest(hex: &str) -> Digest {
    Digest::parse(&format!("sha256:{hex}")).unwrap()
}

/// Push of `commit` to `workload`; the tag is the first seven characters.
fn push(id: &str, commit: &str) -> PushEvent {
    PushEvent::new(workload(id), Revision::new(commit, "main"))
}

impl Harness {
    fn publish(&self, id: &str, commit: &str, hex: &str) {
        self.registry
            .publish(&format!("registry.test/{id}"), &commit[..7], digest(hex));
    }
}

fn create_hook(dir: &TempDir, name: &str, script: &str) {
    let hooks_dir = dir.path().join(".conveyor").join("hooks");
    fs::create_dir_all(&hooks_dir).unwrap();

    let hook_path = hooks_dir.join(name);
    fs::write(&hook_path, script).unwrap();

    let mut perms = fs::metadata(&hook_path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&hook_path, perms).unwrap();
}

mod pushes {
    use super::*;

    #[tokio::test]
    async fn first_push_deploys_resolved_artifact() {
        let h = harness();
        h.publish("web", "1111111aaaa", "aa");

        let run = h.coordinator.submit(push("web", "1111111aaaa")).await.unwrap();

        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.target.tag(), "1111111");
        assert!(run.previous.is_none());
        assert_eq!(h.cluster.counts(&workload("web")).get(&digest("aa")), Some(&2));
    }

    #[tokio::test]
    async fn second_push_rolls_from_settled_artifact() {
        let h = harness();
        h.publish("web", "1111111aaaa", "aa");
        h.publish("web", "2222222bbbb", "bb");

        h.coordinator.submit(push("web", "1111111aaaa")).await.unwrap();
        let run = h.coordinator.submit(push("web", "2222222bbbb")).await.unwrap();

        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.previous.as_ref().map(|a| a.digest().clone()), Some(digest("aa")));
        assert_eq!(run.steps.len(), 2);
        let counts = h.cluster.counts(&workload("web"));
        assert_eq!(counts.get(&digest("bb")), Some(&2));
        assert_eq!(counts.get(&digest("aa")).copied().unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn after_rollback_next_push_starts_from_previous() {
        let h = harness();
        h.publish("web", "1111111aaaa", "aa");
        h.publish("web", "2222222bbbb", "bb");
        h.publish("web", "3333333cccc", "cc");
        h.coordinator.submit(push("web", "1111111aaaa")).await.unwrap();

        h.cluster.set_unready(&digest("bb"));
        let rolled_back = h.coordinator.submit(push("web", "2222222bbbb")).await.unwrap();
        assert_eq!(rolled_back.state, RunState::RolledBack);

        let run = h.coordinator.submit(push("web", "3333333cccc")).await.unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.previous.as_ref().map(|a| a.digest().clone()), Some(digest("aa")));
    }

    #[tokio::test]
    async fn unknown_workload_is_refused() {
        let h = harness();
        let err = h.coordinator.submit(push("worker", "1111111aaaa")).await.unwrap_err();
        assert_eq!(err.kind(), DeployErrorKind::UnknownWorkload);
    }

    #[tokio::test]
    async fn preview_plans_without_side_effects() {
        let h = harness();
        h.publish("web", "1111111aaaa", "aa");

        let run = h.coordinator.preview(&push("web", "1111111aaaa")).await.unwrap();

        assert_eq!(run.state, RunState::Pending);
        assert_eq!(run.steps.len(), 1);
        assert!(h.cluster.applied().is_empty());
        assert!(h.store.list().await.unwrap().is_empty());
    }
}

mod rejections {
    use super::*;

    #[tokio::test]
    async fn unbuilt_revision_is_retried_then_rejected_without_a_run() {
        let h = harness();

        let err = h.coordinator.submit(push("web", "1111111aaaa")).await.unwrap_err();

        assert_eq!(err.kind(), DeployErrorKind::NotBuilt);
        // One lookup per attempt: the first plus two re-queues.
        assert_eq!(h.registry.lookups(), 3);
        assert!(h.store.list().await.unwrap().is_empty());
        assert!(h.cluster.applied().is_empty());

        let rejections = h.store.rejections().await.unwrap();
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].reason.kind, DeployErrorKind::NotBuilt);
        assert_eq!(rejections[0].workload, workload("web"));
    }

    #[tokio::test]
    async fn unreachable_registry_is_rejected_after_local_retries() {
        let h = harness();
        h.registry.set_unavailable(true);

        let err = h.coordinator.submit(push("web", "1111111aaaa")).await.unwrap_err();

        assert_eq!(err.kind(), DeployErrorKind::RegistryUnavailable);
        assert_eq!(h.registry.lookups(), 2);
        assert!(h.store.list().await.unwrap().is_empty());
        assert_eq!(h.store.rejections().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gate_refuses_unpassed_revisions() {
        let mut config = Config::from_yaml(CONFIG).unwrap();
        config.coordinator.require_tests = true;
        let h = harness_with(&config, WorkloadLocks::in_process());
        h.publish("web", "1111111aaaa", "aa");

        let err = h.coordinator.submit(push("web", "1111111aaaa")).await.unwrap_err();
        assert_eq!(err.kind(), DeployErrorKind::TestsFailed);
        let err = h
            .coordinator
            .submit(push("web", "1111111aaaa").with_tests(false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), DeployErrorKind::TestsFailed);
        assert_eq!(h.registry.lookups(), 0);

        let run = h
            .coordinator
            .submit(push("web", "1111111aaaa").with_tests(true))
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Succeeded);
    }

    #[tokio::test]
    async fn failing_pre_deploy_hook_rejects_push() {
        let dir = TempDir::new().unwrap();
        create_hook(&dir, "pre-deploy", "#!/bin/sh\necho 'freeze in effect' >&2\nexit 1\n");
        let mut h = harness();
        h.coordinator = Arc::new(
            Coordinator::new(
                &Config::from_yaml(CONFIG).unwrap(),
                h.registry.clone(),
                h.cluster.clone(),
                h.store.clone(),
                WorkloadLocks::in_process(),
            )
            .with_hooks(HookRunner::new(dir.path())),
        );
        h.publish("web", "1111111aaaa", "aa");

        let err = h.coordinator.submit(push("web", "1111111aaaa")).await.unwrap_err();

        assert_eq!(err.kind(), DeployErrorKind::HookFailed);
        assert!(err.to_string().contains("freeze in effect"));
        assert_eq!(h.registry.lookups(), 0);
        assert_eq!(h.store.rejections().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn push_refused_by_another_process_lock_is_recorded() {
        let dir = TempDir::new().unwrap();
        let config = Config::from_yaml(CONFIG).unwrap();
        let h = harness_with(&config, WorkloadLocks::new(dir.path().to_path_buf()));
        h.publish("web", "2222222bbbb", "bb");

        let web = config.workload(&workload("web")).unwrap();
        let current = WorkloadSpec {
            workload: web.id.clone(),
            replicas: web.replicas,
            artifact: None,
            readiness: web.readiness.clone(),
        };
        let target = ArtifactRef::new("registry.test/web", "1111111", digest("aa")).unwrap();
        let active = h
            .coordinator
            .machine()
            .prepare(current, Revision::new("1111111aaaa", "main"), target)
            .unwrap();
        h.store.save(&active).await.unwrap();
        let elsewhere = WorkloadLocks::new(dir.path().to_path_buf());
        let _held = elsewhere.acquire(&workload("web"), &active.id).unwrap();

        let err = h.coordinator.submit(push("web", "2222222bbbb")).await.unwrap_err();
        assert_eq!(err.kind(), DeployErrorKind::DeploymentInProgress);
        assert_eq!(err.lock_holder_info().map(|i| &i.run), Some(&active.id));

        let rejections = h.store.rejections().await.unwrap();
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].reason.kind, DeployErrorKind::DeploymentInProgress);
        assert_eq!(rejections[0].revision, Revision::new("2222222bbbb", "main"));
        assert_eq!(h.store.for_workload(&workload("web")).await.unwrap().len(), 1);
        assert!(h.cluster.counts(&workload("web")).is_empty());
    }
}

mod hooks {
    use super::*;

    #[tokio::test]
    async fn post_deploy_hook_sees_the_outcome() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("post-deploy.out");
        create_hook(
            &dir,
            "post-deploy",
            &format!(
                "#!/bin/sh\necho \"$CONVEYOR_WORKLOAD $CONVEYOR_STATE $CONVEYOR_ARTIFACT\" > {}\n",
                out.display()
            ),
        );
        let h = harness();
        let coordinator = Coordinator::new(
            &Config::from_yaml(CONFIG).unwrap(),
            h.registry.clone(),
            h.cluster.clone(),
            h.store.clone(),
            WorkloadLocks::in_process(),
        )
        .with_hooks(HookRunner::new(dir.path()));
        h.publish("web", "1111111aaaa", "aa");

        coordinator.submit(push("web", "1111111aaaa")).await.unwrap();

        let written = fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "web succeeded registry.test/web@sha256:aa");
    }
}

mod concurrency {
    use super::*;

    async fn wait_for_active_run(h: &Harness) {
        while h.store.non_terminal().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn push_during_a_run_is_queued_and_deployed_after_it() {
        let h = harness();
        h.publish("web", "1111111aaaa", "aa");
        h.publish("web", "2222222bbbb", "bb");
        h.cluster.set_apply_delay(Duration::from_millis(50));

        let first = tokio::spawn({
            let coordinator = h.coordinator.clone();
            async move { coordinator.submit(push("web", "1111111aaaa")).await }
        });
        wait_for_active_run(&h).await;

        let err = h.coordinator.submit(push("web", "2222222bbbb")).await.unwrap_err();
        assert_eq!(err.kind(), DeployErrorKind::DeploymentInProgress);
        assert_eq!(h.coordinator.queued(&workload("web")).len(), 1);

        let run = first.await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert!(h.coordinator.queued(&workload("web")).is_empty());

        let runs = h.store.for_workload(&workload("web")).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.state == RunState::Succeeded));
        assert_eq!(runs[1].target.digest(), &digest("bb"));
        assert_eq!(h.cluster.counts(&workload("web")).get(&digest("bb")), Some(&2));
    }

    #[tokio::test]
    async fn independent_workloads_deploy_concurrently() {
        let h = harness();
        h.publish("web", "1111111aaaa", "aa");
        h.publish("api", "1111111aaaa", "ab");
        h.cluster.set_apply_delay(Duration::from_millis(20));

        let (web, api) = tokio::join!(
            h.coordinator.submit(push("web", "1111111aaaa")),
            h.coordinator.submit(push("api", "1111111aaaa")),
        );

        assert_eq!(web.unwrap().state, RunState::Succeeded);
        assert_eq!(api.unwrap().state, RunState::Succeeded);
    }

    #[tokio::test]
    async fn second_process_never_breaks_a_lock_before_its_run_is_saved() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let config = Config::from_yaml(CONFIG).unwrap();
        let registry = Arc::new(StaticRegistry::new());
        registry.publish("registry.test/web", "1111111", digest("aa"));
        registry.publish("registry.test/web", "2222222", digest("bb"));
        let cluster = Arc::new(SimulatedCluster::new());
        let store = Arc::new(SlowStore::new(MemoryRunStore::new(), Duration::from_millis(50)));

        let first = coordinator_on(&config, &registry, &cluster, store.clone(), dir.path());
        let second = coordinator_on(&config, &registry, &cluster, store.clone(), dir.path());

        let running = tokio::spawn(async move { first.submit(push("web", "1111111aaaa")).await });
        while !dir.path().join("web.lock").exists() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let err = second.submit(push("web", "2222222bbbb")).await.unwrap_err();
        assert_eq!(err.kind(), DeployErrorKind::DeploymentInProgress);
        assert!(store.non_terminal().await.unwrap().len() <= 1);

        let run = running.await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.target.digest(), &digest("aa"));

        let counts = cluster.counts(&workload("web"));
        assert_eq!(counts.get(&digest("aa")), Some(&2));
        assert_eq!(counts.get(&digest("bb")), None);

        let runs = store.for_workload(&workload("web")).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(store.rejections().await.unwrap().len(), 1);
        assert!(!dir.path().join("web.lock").exists());
    }
}

mod recovery {
    use super::*;

    #[tokio::test]
    async fn recover_resumes_interrupted_runs() {
        let dir = TempDir::new().unwrap();
        let config = Config::from_yaml(CONFIG).unwrap();
        let h = harness_with(&config, WorkloadLocks::new(dir.path().to_path_buf()));
        h.publish("web", "1111111aaaa", "aa");

        let web = config.workload(&workload("web")).unwrap();
        let current = WorkloadSpec {
            workload: web.id.clone(),
            replicas: web.replicas,
            artifact: None,
            readiness: web.readiness.clone(),
        };
        let target = ArtifactRef::new("registry.test/web", "1111111", digest("aa")).unwrap();
        let run = h
            .coordinator
            .machine()
            .prepare(current, Revision::new("1111111aaaa", "main"), target)
            .unwrap();
        h.store.save(&run).await.unwrap();

        // The crashed process still holds the lock file.
        let crashed = WorkloadLocks::new(dir.path().to_path_buf());
        std::mem::forget(crashed.acquire(&workload("web"), &run.id).unwrap());

        let outcomes = h.coordinator.recover().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        let (id, outcome) = &outcomes[0];
        assert_eq!(id, &run.id);
        assert_eq!(outcome.as_ref().unwrap().state, RunState::Succeeded);
        assert!(!dir.path().join("web.lock").exists());
        assert!(h.coordinator.recover().await.unwrap().is_empty());
    }

    /// Leave a lock file for the never-saved run `run` owned by `pid` on
    /// this host.
    fn leave_lock(dir: &Path, run: &str, pid: u32) {
        let mut info = LockHolderInfo::new(&workload("web"), &RunId::new(run));
        info.pid = pid;
        fs::write(dir.join("web.lock"), serde_json::to_vec(&info).unwrap()).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn lock_of_unknown_run_from_a_dead_process_is_broken() {
        let dir = TempDir::new().unwrap();
        let h = harness_with(
            &Config::from_yaml(CONFIG).unwrap(),
            WorkloadLocks::new(dir.path().to_path_buf()),
        );
        h.publish("web", "1111111aaaa", "aa");
        leave_lock(dir.path(), "gone", u32::MAX);

        let run = h.coordinator.submit(push("web", "1111111aaaa")).await.unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert!(!dir.path().join("web.lock").exists());
    }

    #[tokio::test]
    async fn lock_of_unknown_run_from_a_live_process_is_kept() {
        let dir = TempDir::new().unwrap();
        let h = harness_with(
            &Config::from_yaml(CONFIG).unwrap(),
            WorkloadLocks::new(dir.path().to_path_buf()),
        );
        h.publish("web", "1111111aaaa", "aa");
        leave_lock(dir.path(), "starting", std::process::id());

        let err = h.coordinator.submit(push("web", "1111111aaaa")).await.unwrap_err();
        assert_eq!(err.kind(), DeployErrorKind::DeploymentInProgress);
        assert!(h.cluster.counts(&workload("web")).is_empty());

        let holder = fs::read_to_string(dir.path().join("web.lock")).unwrap();
        let holder: LockHolderInfo = serde_json::from_str(&holder).unwrap();
        assert_eq!(holder.run.as_str(), "starting");
    }
}
