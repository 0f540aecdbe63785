//! Protocol flow integration tests
//!
//! Drives whole protocol runs through the wired context with scripted
//! engines, on both queue backends.

use std::sync::Arc;

use protoflow::budget::BudgetMode;
use protoflow::config::{Config, QueueBackend};
use protoflow::context::AppContext;
use protoflow::domain::{
    JobStatus, JobType, NewProject, NewProtocolRun, ProtocolRun, ProtocolStatus, QaPolicy, StepRun, StepStatus,
    StepUpdate, event_types,
};
use protoflow::engine::{EngineError, EngineOutput, EngineRegistry, ScriptedEngine, ScriptedQa};
use protoflow::error::{ProtoflowError, Result};
use protoflow::id::now_ms;
use protoflow::policy::{FailureKind, LoopPolicy, PolicyCondition, PolicyKind, TriggerMode, TriggerPolicy};
use protoflow::spec::{ProtocolSpec, StepSpec};
use protoflow::store::{SqliteStore, StateStore};
use tempfile::TempDir;

struct Harness {
    ctx: AppContext,
    engine: Arc<ScriptedEngine>,
    qa: Arc<ScriptedQa>,
    project_id: i64,
}

fn config(backend: QueueBackend) -> Config {
    let mut config = Config::default();
    config.queue.backend = backend;
    config.queue.backoff_base_ms = 0;
    config.queue.backoff_cap_secs = 0;
    config
}

fn harness_with_store(config: Config, store: Arc<dyn StateStore>, engine: ScriptedEngine, qa: ScriptedQa) -> Harness {
    let engine = Arc::new(engine);
    let qa = Arc::new(qa);
    let engines = EngineRegistry::new().with(engine.clone());
    let ctx = AppContext::build(config, store, engines, Some(qa.clone())).unwrap();
    let project_id = match ctx.store.list_projects().unwrap().first() {
        Some(project) => project.id,
        None => {
            ctx.orchestrator
                .create_project(NewProject::new("demo", "git@example.com:demo.git"))
                .unwrap()
                .id
        }
    };
    Harness {
        ctx,
        engine,
        qa,
        project_id,
    }
}

fn harness(config: Config, engine: ScriptedEngine, qa: ScriptedQa) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    harness_with_store(config, store, engine, qa)
}

impl Harness {
    fn protocol(&self, name: &str, steps: Vec<StepSpec>) -> ProtocolRun {
        let spec = ProtocolSpec {
            steps,
            ..Default::default()
        };
        self.ctx
            .orchestrator
            .create_protocol_run(NewProtocolRun::new(self.project_id, name, "main").with_spec(spec))
            .unwrap()
    }

    fn run(&self, id: i64) -> ProtocolRun {
        self.ctx.store.protocol_run(id).unwrap()
    }

    fn steps(&self, id: i64) -> Vec<StepRun> {
        self.ctx.store.list_step_runs(id).unwrap()
    }

    fn events(&self, id: i64) -> Vec<String> {
        self.ctx
            .store
            .list_events(Some(id))
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }
}

fn skip(name: &str) -> StepSpec {
    StepSpec::new(name).with_qa_policy(QaPolicy::Skip)
}

/// Integration test: a skip-QA protocol runs to completion on the inline queue
#[tokio::test]
async fn test_inline_protocol_runs_to_completion() {
    let h = harness(config(QueueBackend::Inline), ScriptedEngine::new("codex"), ScriptedQa::passing());
    let run = h.protocol("feature-x", vec![skip("01-setup"), skip("02-build"), skip("03-docs")]);

    let started = h.ctx.orchestrator.start(run.id, Some(ProtocolStatus::Pending)).await.unwrap();

    assert_eq!(started.status, ProtocolStatus::Completed);
    assert!(started.spec_hash.is_some());
    let steps = h.steps(run.id);
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(h.engine.calls(), 3);
    assert_eq!(h.qa.calls(), 0);

    let events = h.events(run.id);
    assert_eq!(events.first().map(String::as_str), Some(event_types::PROTOCOL_CREATED));
    assert_eq!(events.last().map(String::as_str), Some(event_types::PROTOCOL_COMPLETED));
    assert_eq!(events.iter().filter(|e| *e == event_types::QA_SKIPPED).count(), 3);

    // Steps ran in declared order
    let order: Vec<String> = h.engine.requests().into_iter().map(|r| r.step_name).collect();
    assert_eq!(order, vec!["01-setup", "02-build", "03-docs"]);
}

/// Integration test: an invalid spec blocks the protocol without creating steps
#[tokio::test]
async fn test_invalid_spec_blocks_planning() {
    let h = harness(config(QueueBackend::Inline), ScriptedEngine::new("codex"), ScriptedQa::passing());
    let run = h.protocol(
        "broken",
        vec![
            skip("01-setup"),
            skip("01-setup"),
            skip("02-build").with_policy(PolicyKind::Trigger(TriggerPolicy::new(["99-missing"]).depth_cap(2))),
        ],
    );

    let started = h.ctx.orchestrator.start(run.id, None).await.unwrap();

    assert_eq!(started.status, ProtocolStatus::Blocked);
    assert!(h.steps(run.id).is_empty());
    let event = h
        .ctx
        .store
        .list_events(Some(run.id))
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == event_types::SPEC_VALIDATION_ERROR)
        .expect("validation event");
    let errors = event.metadata["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 2);
    assert_eq!(h.engine.calls(), 0);
}

/// Integration test: a loop policy resets the step with a fresh job, then blocks once exhausted
#[tokio::test]
async fn test_loop_policy_blocks_after_limit() -> Result<()> {
    let engine = ScriptedEngine::new("codex")
        .then_ok("setup done")
        .then_fail("tests failed", false)
        .then_fail("tests still failing", false);
    let h = harness(config(QueueBackend::Durable), engine, ScriptedQa::passing());
    let run = h.protocol(
        "loopy",
        vec![
            skip("01-setup"),
            skip("02-impl").with_policy(PolicyKind::Loop(LoopPolicy::new(1))),
            skip("03-docs"),
        ],
    );

    h.ctx.orchestrator.start(run.id, None).await?;
    // Planning, step 1, then the first attempt of step 2
    for _ in 0..3 {
        assert!(h.ctx.process_next().await?);
    }

    let steps = h.steps(run.id);
    let impl_step = &steps[1];
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(impl_step.status, StepStatus::Pending);
    assert_eq!(impl_step.runtime_state.loop_count, 1);
    assert_eq!(impl_step.runtime_state.last_error.as_deref(), Some("tests failed"));
    assert_eq!(steps[2].status, StepStatus::Pending);
    assert_eq!(h.run(run.id).status, ProtocolStatus::Running);

    let jobs_for_impl = |status: JobStatus| -> Result<Vec<String>> {
        Ok(h.ctx
            .queue()
            .list_jobs(Some(status))?
            .into_iter()
            .filter(|j| j.job_type == JobType::ExecuteStep && j.target_id == impl_step.id)
            .map(|j| j.idempotency_key)
            .collect())
    };
    let rerun = jobs_for_impl(JobStatus::Queued)?;
    let first = jobs_for_impl(JobStatus::Finished)?;
    assert_eq!(rerun.len(), 1);
    assert_eq!(first.len(), 1);
    assert_ne!(rerun[0], first[0]);

    h.ctx.drain().await?;

    let steps = h.steps(run.id);
    assert_eq!(steps[1].status, StepStatus::Blocked);
    assert_eq!(steps[1].runtime_state.loop_count, 1);
    assert_eq!(steps[1].runtime_state.last_error.as_deref(), Some("tests still failing"));
    assert_eq!(steps[2].status, StepStatus::Pending);
    assert_eq!(h.run(run.id).status, ProtocolStatus::Blocked);
    assert_eq!(h.engine.calls(), 3);
    assert!(h.engine.requests()[2].prompt.contains("tests failed"));

    let events = h.events(run.id);
    assert_eq!(events.iter().filter(|e| *e == event_types::LOOP_DECISION).count(), 1);
    assert!(events.contains(&event_types::LOOP_LIMIT_REACHED.to_string()));
    assert!(events.contains(&event_types::PROTOCOL_BLOCKED.to_string()));
    Ok(())
}

/// Integration test: a step-back loop reruns earlier steps, leaving listed ones alone
#[tokio::test]
async fn test_loop_steps_back_over_earlier_steps() {
    let engine = ScriptedEngine::new("codex")
        .then_ok("a")
        .then_ok("b")
        .then_ok("c")
        .then_fail("review rejected", false);
    let h = harness(config(QueueBackend::Inline), engine, ScriptedQa::passing());
    let run = h.protocol(
        "rework",
        vec![
            skip("01-a"),
            skip("02-b"),
            skip("03-c"),
            skip("04-d").with_policy(PolicyKind::Loop(LoopPolicy::new(2).step_back(2, &["03-c"]))),
        ],
    );

    h.ctx.orchestrator.start(run.id, None).await.unwrap();

    assert_eq!(h.run(run.id).status, ProtocolStatus::Completed);
    let order: Vec<String> = h.engine.requests().into_iter().map(|r| r.step_name).collect();
    assert_eq!(order, vec!["01-a", "02-b", "03-c", "04-d", "02-b", "04-d"]);
    assert_eq!(h.steps(run.id)[3].runtime_state.loop_count, 1);

    let decision = h
        .ctx
        .store
        .list_events(Some(run.id))
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == event_types::LOOP_DECISION)
        .expect("loop decision");
    assert_eq!(decision.metadata["target_step_index"], 1);
    assert_eq!(decision.metadata["steps_reset"], serde_json::json!([1, 3]));
}

/// Integration test: a failure-conditioned trigger runs its target instead of blocking
#[tokio::test]
async fn test_failure_trigger_routes_to_target() {
    let engine = ScriptedEngine::new("codex").then_fail("lint errors", false);
    let h = harness(config(QueueBackend::Inline), engine, ScriptedQa::passing());
    let run = h.protocol(
        "routed",
        vec![
            skip("01-impl")
                .with_policy(PolicyKind::Trigger(TriggerPolicy::new(["02-fix"]).when(PolicyCondition::ExecFailed))),
            skip("02-fix"),
        ],
    );

    h.ctx.orchestrator.start(run.id, None).await.unwrap();

    let steps = h.steps(run.id);
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert_eq!(steps[1].status, StepStatus::Completed);
    assert_eq!(steps[1].runtime_state.triggered_by, Some(steps[0].id));
    assert_eq!(h.run(run.id).status, ProtocolStatus::Running);

    let events = h.events(run.id);
    assert!(events.contains(&event_types::TRIGGER_DECISION.to_string()));
    assert!(events.contains(&event_types::TRIGGER_EXECUTED_INLINE.to_string()));
    assert!(!events.contains(&event_types::PROTOCOL_BLOCKED.to_string()));
}

/// Integration test: a trigger waiting for another condition is skipped and recorded
#[tokio::test]
async fn test_trigger_condition_mismatch_is_recorded() {
    let h = harness(config(QueueBackend::Inline), ScriptedEngine::new("codex"), ScriptedQa::passing());
    let run = h.protocol(
        "quiet",
        vec![
            skip("01-impl")
                .with_policy(PolicyKind::Trigger(TriggerPolicy::new(["02-fix"]).when(PolicyCondition::ExecFailed))),
            skip("02-fix"),
        ],
    );

    h.ctx.orchestrator.start(run.id, None).await.unwrap();

    assert_eq!(h.run(run.id).status, ProtocolStatus::Completed);
    let skipped = h
        .ctx
        .store
        .list_events(Some(run.id))
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == event_types::TRIGGER_CONDITION_SKIPPED)
        .expect("condition skip event");
    assert_eq!(skipped.metadata["condition"], "exec_failed");
    assert_eq!(skipped.metadata["reason"], "exec_completed");
    assert!(!h.events(run.id).contains(&event_types::TRIGGER_DECISION.to_string()));
}

/// Integration test: a failure kind on the skip list is not looped
#[tokio::test]
async fn test_loop_skip_list_blocks_immediately() {
    let h = harness(config(QueueBackend::Inline), ScriptedEngine::new("codex"), ScriptedQa::failing());
    let run = h.protocol(
        "strict",
        vec![StepSpec::new("01-impl")
            .with_qa_policy(QaPolicy::Light)
            .with_policy(PolicyKind::Loop(LoopPolicy::new(3).skipping([FailureKind::Qa])))],
    );

    h.ctx.orchestrator.start(run.id, None).await.unwrap();

    let step = &h.steps(run.id)[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.runtime_state.loop_count, 0);
    assert_eq!(h.engine.calls(), 1);
    assert_eq!(h.qa.calls(), 1);
    assert_eq!(h.run(run.id).status, ProtocolStatus::Blocked);
}

/// Integration test: a QA failure blocks, and a manual retry clears it
#[tokio::test]
async fn test_retry_after_qa_failure() {
    let h = harness(
        config(QueueBackend::Inline),
        ScriptedEngine::new("codex"),
        ScriptedQa::passing().then_fail(),
    );
    let run = h.protocol("gated", vec![StepSpec::new("01-impl").with_qa_policy(QaPolicy::Full)]);

    h.ctx.orchestrator.start(run.id, None).await.unwrap();
    assert_eq!(h.run(run.id).status, ProtocolStatus::Blocked);
    assert_eq!(h.steps(run.id)[0].status, StepStatus::Failed);

    let retried = h
        .ctx
        .orchestrator
        .retry_latest(run.id, Some(ProtocolStatus::Blocked))
        .await
        .unwrap();

    assert_eq!(retried.status, StepStatus::Completed);
    assert_eq!(retried.retries, 1);
    assert!(retried.runtime_state.last_error.is_none());
    assert_eq!(h.run(run.id).status, ProtocolStatus::Completed);
    assert_eq!(h.engine.calls(), 2);
    assert_eq!(h.qa.calls(), 2);

    let events = h.events(run.id);
    assert!(events.contains(&event_types::QA_FAILED.to_string()));
    assert!(events.contains(&event_types::STEP_RETRY.to_string()));
}

/// Integration test: skip QA never consults the QA capability
#[tokio::test]
async fn test_skip_policy_never_calls_qa() {
    let h = harness(config(QueueBackend::Inline), ScriptedEngine::new("codex"), ScriptedQa::failing());
    let run = h.protocol("fast", vec![skip("01-a"), skip("02-b")]);

    h.ctx.orchestrator.start(run.id, None).await.unwrap();

    assert_eq!(h.run(run.id).status, ProtocolStatus::Completed);
    assert_eq!(h.qa.calls(), 0);
    assert!(!h.events(run.id).contains(&event_types::QA_ENQUEUED.to_string()));
}

/// Integration test: full QA produces exactly one QA job per execution
#[tokio::test]
async fn test_full_qa_enqueues_one_job() {
    let h = harness(config(QueueBackend::Durable), ScriptedEngine::new("codex"), ScriptedQa::passing());
    let run = h.protocol("gated", vec![StepSpec::new("01-impl").with_qa_policy(QaPolicy::Full)]);

    h.ctx.orchestrator.start(run.id, None).await.unwrap();
    h.ctx.drain().await.unwrap();

    assert_eq!(h.run(run.id).status, ProtocolStatus::Completed);
    assert_eq!(h.qa.calls(), 1);
    let qa_jobs: Vec<_> = h
        .ctx
        .queue()
        .list_jobs(None)
        .unwrap()
        .into_iter()
        .filter(|j| j.job_type == JobType::RunQa)
        .collect();
    assert_eq!(qa_jobs.len(), 1);
    assert_eq!(qa_jobs[0].status, JobStatus::Finished);
}

/// Integration test: an inline trigger runs its target within the same chain
#[tokio::test]
async fn test_inline_trigger_runs_target() {
    let h = harness(config(QueueBackend::Inline), ScriptedEngine::new("codex"), ScriptedQa::passing());
    let run = h.protocol(
        "triggers",
        vec![
            skip("01-impl").with_policy(PolicyKind::Trigger(TriggerPolicy::new(["03-lint"]).depth_cap(2))),
            skip("02-test"),
            skip("03-lint"),
        ],
    );

    h.ctx.orchestrator.start(run.id, None).await.unwrap();

    assert_eq!(h.run(run.id).status, ProtocolStatus::Completed);
    let steps = h.steps(run.id);
    let lint = steps.iter().find(|s| s.step_name == "03-lint").unwrap();
    assert_eq!(lint.runtime_state.trigger_depth, 1);
    assert_eq!(lint.runtime_state.triggered_by, Some(steps[0].id));

    let order: Vec<String> = h.engine.requests().into_iter().map(|r| r.step_name).collect();
    assert_eq!(order, vec!["01-impl", "03-lint", "02-test"]);

    let events = h.events(run.id);
    assert!(events.contains(&event_types::TRIGGER_DECISION.to_string()));
    assert!(events.contains(&event_types::TRIGGER_EXECUTED_INLINE.to_string()));
    assert!(!events.contains(&event_types::TRIGGER_INLINE_DEPTH_EXCEEDED.to_string()));
}

/// Integration test: past the inline depth limit the trigger goes through the queue
#[tokio::test]
async fn test_trigger_depth_falls_back_to_queue() {
    let mut cfg = config(QueueBackend::Inline);
    cfg.orchestrator.max_inline_trigger_depth = 0;
    let h = harness(cfg, ScriptedEngine::new("codex"), ScriptedQa::passing());
    let run = h.protocol(
        "deep",
        vec![
            skip("01-impl").with_policy(PolicyKind::Trigger(TriggerPolicy::new(["02-lint"]).depth_cap(5))),
            skip("02-lint"),
        ],
    );

    h.ctx.orchestrator.start(run.id, None).await.unwrap();

    assert_eq!(h.run(run.id).status, ProtocolStatus::Completed);
    let events = h.events(run.id);
    assert!(events.contains(&event_types::TRIGGER_INLINE_DEPTH_EXCEEDED.to_string()));
    assert!(events.contains(&event_types::TRIGGER_ENQUEUED.to_string()));
    assert!(!events.contains(&event_types::TRIGGER_EXECUTED_INLINE.to_string()));
    assert_eq!(h.engine.calls(), 2);
}

/// Integration test: a trigger aimed at a completed step is skipped
#[tokio::test]
async fn test_trigger_skips_completed_target() {
    let h = harness(config(QueueBackend::Inline), ScriptedEngine::new("codex"), ScriptedQa::passing());
    let run = h.protocol(
        "backwards",
        vec![
            skip("01-setup"),
            skip("02-impl").with_policy(PolicyKind::Trigger(TriggerPolicy::new(["01-setup"]).mode(TriggerMode::Enqueue).depth_cap(2))),
        ],
    );

    h.ctx.orchestrator.start(run.id, None).await.unwrap();

    assert_eq!(h.run(run.id).status, ProtocolStatus::Completed);
    assert_eq!(h.engine.calls(), 2);
    assert!(h.events(run.id).contains(&event_types::TRIGGER_SKIPPED.to_string()));
}

/// Integration test: a paused protocol discards in-flight work until resumed
#[tokio::test]
async fn test_pause_discards_and_resume_reruns() {
    let mut cfg = config(QueueBackend::Durable);
    cfg.orchestrator.auto_advance = false;
    let h = harness(cfg, ScriptedEngine::new("codex"), ScriptedQa::passing());
    let run = h.protocol("pausable", vec![skip("01-impl")]);
    let orch = &h.ctx.orchestrator;

    orch.start(run.id, None).await.unwrap();
    h.ctx.drain().await.unwrap();
    assert_eq!(h.run(run.id).status, ProtocolStatus::Planned);

    let step = orch.run_next_step(run.id, Some(ProtocolStatus::Planned)).await.unwrap().unwrap();
    assert_eq!(step.status, StepStatus::Running);
    orch.pause(run.id, Some(ProtocolStatus::Running)).unwrap();
    h.ctx.drain().await.unwrap();

    assert_eq!(h.engine.calls(), 0);
    assert_eq!(h.steps(run.id)[0].status, StepStatus::Running);
    assert!(h.events(run.id).contains(&event_types::RESULT_DISCARDED.to_string()));

    let resumed = orch.resume(run.id, Some(ProtocolStatus::Paused)).await.unwrap();
    assert_eq!(resumed.status, ProtocolStatus::Running);
    h.ctx.drain().await.unwrap();

    assert_eq!(h.engine.calls(), 1);
    assert_eq!(h.steps(run.id)[0].status, StepStatus::Completed);
    assert_eq!(h.run(run.id).status, ProtocolStatus::Completed);
}

/// Integration test: cancelling closes every open step and drops queued work
#[tokio::test]
async fn test_cancel_closes_open_steps() {
    let mut cfg = config(QueueBackend::Durable);
    cfg.orchestrator.auto_advance = false;
    let h = harness(cfg, ScriptedEngine::new("codex"), ScriptedQa::passing());
    let run = h.protocol("doomed", vec![skip("01-a"), skip("02-b"), skip("03-c")]);
    let orch = &h.ctx.orchestrator;

    orch.start(run.id, None).await.unwrap();
    h.ctx.drain().await.unwrap();
    orch.run_next_step(run.id, None).await.unwrap();

    let cancelled = orch.cancel(run.id, Some(ProtocolStatus::Running)).unwrap();
    assert_eq!(cancelled.status, ProtocolStatus::Cancelled);
    assert!(h.steps(run.id).iter().all(|s| s.status == StepStatus::Cancelled));

    h.ctx.drain().await.unwrap();
    assert_eq!(h.engine.calls(), 0);

    // Terminal protocols accept no further actions
    let err = orch.resume(run.id, None).await.unwrap_err();
    assert!(err.is_conflict());
}

/// Integration test: a stale expectation is rejected and recorded
#[tokio::test]
async fn test_stale_expectation_is_rejected() {
    let h = harness(config(QueueBackend::Durable), ScriptedEngine::new("codex"), ScriptedQa::passing());
    let run = h.protocol("guarded", vec![skip("01-a")]);

    let err = h
        .ctx
        .orchestrator
        .start(run.id, Some(ProtocolStatus::Planned))
        .await
        .unwrap_err();

    assert!(matches!(err, ProtoflowError::StateConflict { .. }));
    assert_eq!(h.run(run.id).status, ProtocolStatus::Pending);
    assert!(h.events(run.id).contains(&event_types::TRANSITION_REJECTED.to_string()));
    assert_eq!(h.ctx.queue().stats().unwrap().total(), 0);
}

/// Integration test: of several writers with the same expectation only one wins
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_guarded_updates() {
    let mut cfg = config(QueueBackend::Durable);
    cfg.orchestrator.auto_advance = false;
    let h = harness(cfg, ScriptedEngine::new("codex"), ScriptedQa::passing());
    let run = h.protocol("racy", vec![skip("01-a")]);
    h.ctx.orchestrator.start(run.id, None).await.unwrap();
    h.ctx.drain().await.unwrap();
    let step = h.steps(run.id)[0].clone();
    assert_eq!(step.status, StepStatus::Pending);

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let store = h.ctx.store.clone();
            let id = step.id;
            tokio::spawn(async move { store.update_step(id, StepStatus::Pending, StepUpdate::to(StepStatus::Running)) })
        })
        .collect();

    let mut wins = 0;
    for writer in writers {
        match writer.await.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => assert!(e.is_conflict(), "unexpected error: {}", e),
        }
    }
    assert_eq!(wins, 1);

    let current = h.ctx.store.step_run(step.id).unwrap();
    assert_eq!(current.status, StepStatus::Running);
    assert_eq!(current.version, step.version + 1);
}

/// Integration test: retryable engine failures exhaust the job and block the step
#[tokio::test]
async fn test_durable_retry_exhaustion_blocks() {
    let mut cfg = config(QueueBackend::Durable);
    cfg.queue.max_attempts = 2;
    let engine = ScriptedEngine::new("codex").otherwise(Err(EngineError::failure("rate limited", true)));
    let h = harness(cfg, engine, ScriptedQa::passing());
    let run = h.protocol("flaky", vec![skip("01-a")]);

    h.ctx.orchestrator.start(run.id, None).await.unwrap();
    h.ctx.drain().await.unwrap();

    assert_eq!(h.engine.calls(), 2);
    let step = &h.steps(run.id)[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(h.run(run.id).status, ProtocolStatus::Blocked);

    let failed = h.ctx.queue().list_jobs(Some(JobStatus::Failed)).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].job_type, JobType::ExecuteStep);
    assert_eq!(failed[0].attempt, 2);

    let events = h.events(run.id);
    assert!(events.contains(&event_types::JOB_FAILED.to_string()));
    assert!(events.contains(&event_types::STEP_FAILED.to_string()));
}

/// Integration test: an unregistered engine degrades the step for manual review
#[tokio::test]
async fn test_missing_engine_degrades_step() {
    let h = harness(config(QueueBackend::Inline), ScriptedEngine::new("codex"), ScriptedQa::passing());
    let run = h.protocol("manual", vec![skip("01-a").with_engine("claude")]);

    h.ctx.orchestrator.start(run.id, None).await.unwrap();

    let step = h.steps(run.id)[0].clone();
    assert_eq!(step.status, StepStatus::NeedsQa);
    assert!(step.summary.as_deref().unwrap_or("").starts_with("[degraded]"));
    assert_eq!(h.run(run.id).status, ProtocolStatus::Running);

    let approved = h.ctx.orchestrator.approve(step.id, Some(StepStatus::NeedsQa)).await.unwrap();
    assert_eq!(approved.status, StepStatus::Completed);
    assert_eq!(h.run(run.id).status, ProtocolStatus::Completed);
    assert!(h.events(run.id).contains(&event_types::MANUAL_APPROVAL.to_string()));
}

/// Integration test: each manual QA request gets its own job
#[tokio::test]
async fn test_manual_qa_requests_are_not_coalesced() {
    let mut cfg = config(QueueBackend::Durable);
    cfg.qa.auto_qa_after_exec = false;
    let h = harness(cfg, ScriptedEngine::new("codex"), ScriptedQa::passing());
    let run = h.protocol("manual-qa", vec![StepSpec::new("01-impl").with_qa_policy(QaPolicy::Full)]);
    let orch = &h.ctx.orchestrator;

    orch.start(run.id, None).await.unwrap();
    h.ctx.drain().await.unwrap();
    let step = h.steps(run.id)[0].clone();
    assert_eq!(step.status, StepStatus::NeedsQa);
    assert_eq!(h.qa.calls(), 0);

    orch.run_qa(step.id, Some(StepStatus::NeedsQa)).await.unwrap();
    orch.run_qa(step.id, Some(StepStatus::NeedsQa)).await.unwrap();
    let queued: Vec<_> = h
        .ctx
        .queue()
        .list_jobs(Some(JobStatus::Queued))
        .unwrap()
        .into_iter()
        .filter(|j| j.job_type == JobType::RunQa)
        .collect();
    assert_eq!(queued.len(), 2);
    assert_ne!(queued[0].idempotency_key, queued[1].idempotency_key);

    h.ctx.drain().await.unwrap();
    // The second job finds the step completed and is discarded
    assert_eq!(h.steps(run.id)[0].status, StepStatus::Completed);
    assert_eq!(h.run(run.id).status, ProtocolStatus::Completed);
    assert_eq!(h.qa.calls(), 1);
}

/// Integration test: queued jobs survive a restart of the process
#[tokio::test]
async fn test_durable_jobs_survive_restart() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("protoflow.db");
    let run_id;

    {
        let store = Arc::new(SqliteStore::open(&db_path)?);
        let h = harness_with_store(
            config(QueueBackend::Durable),
            store,
            ScriptedEngine::new("codex"),
            ScriptedQa::passing(),
        );
        run_id = h.protocol("persistent", vec![skip("01-a")]).id;
        h.ctx.orchestrator.start(run_id, None).await?;
        assert_eq!(h.ctx.queue().stats()?.queued, 1);
    }

    {
        let store = Arc::new(SqliteStore::open(&db_path)?);
        let h = harness_with_store(
            config(QueueBackend::Durable),
            store,
            ScriptedEngine::new("codex"),
            ScriptedQa::passing(),
        );
        assert_eq!(h.run(run_id).status, ProtocolStatus::Planning);
        h.ctx.drain().await?;
        assert_eq!(h.run(run_id).status, ProtocolStatus::Completed);
        assert_eq!(h.engine.calls(), 1);
    }

    Ok(())
}

/// Integration test: a job claimed by a worker that stopped mid-job runs again after restart
#[tokio::test]
async fn test_interrupted_job_is_redelivered_after_restart() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("protoflow.db");
    let run_id;

    {
        let store = Arc::new(SqliteStore::open(&db_path)?);
        let h = harness_with_store(
            config(QueueBackend::Durable),
            store,
            ScriptedEngine::new("codex"),
            ScriptedQa::passing(),
        );
        run_id = h.protocol("interrupted", vec![skip("01-a")]).id;
        h.ctx.orchestrator.start(run_id, None).await?;
        assert!(h.ctx.process_next().await?);

        // Claimed, then the worker goes away before running it
        let claimed = h.ctx.store.claim_next_job(now_ms(), 60_000)?.expect("queued execute job");
        assert_eq!(claimed.job_type, JobType::ExecuteStep);
        assert_eq!(h.ctx.queue().stats()?.started, 1);
        assert_eq!(h.engine.calls(), 0);
    }

    {
        let store = Arc::new(SqliteStore::open(&db_path)?);
        let h = harness_with_store(
            config(QueueBackend::Durable),
            store,
            ScriptedEngine::new("codex"),
            ScriptedQa::passing(),
        );
        assert_eq!(h.steps(run_id)[0].status, StepStatus::Running);
        h.ctx.drain().await?;

        assert_eq!(h.run(run_id).status, ProtocolStatus::Completed);
        assert_eq!(h.steps(run_id)[0].status, StepStatus::Completed);
        assert_eq!(h.engine.calls(), 1);
        let stats = h.ctx.queue().stats()?;
        assert_eq!(stats.started, 0);
        assert_eq!(stats.queued, 0);
    }

    Ok(())
}

/// Integration test: protocol token usage survives a restart and still caps later steps
#[tokio::test]
async fn test_protocol_budget_counts_usage_from_before_restart() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("protoflow.db");
    let budgeted = || {
        let mut cfg = config(QueueBackend::Durable);
        cfg.orchestrator.auto_advance = false;
        cfg.budget.mode = BudgetMode::Strict;
        cfg.budget.max_tokens_per_protocol = Some(100);
        cfg
    };
    let engine = || {
        ScriptedEngine::new("codex").otherwise(Ok(EngineOutput {
            tokens_used: Some(90),
            ..EngineOutput::new("done")
        }))
    };
    let run_id;

    {
        let store = Arc::new(SqliteStore::open(&db_path)?);
        let h = harness_with_store(budgeted(), store, engine(), ScriptedQa::passing());
        run_id = h.protocol("budgeted", vec![skip("01-a"), skip("02-b")]).id;
        h.ctx.orchestrator.start(run_id, None).await?;
        h.ctx.drain().await?;
        h.ctx.orchestrator.run_next_step(run_id, None).await?;
        h.ctx.drain().await?;

        assert_eq!(h.steps(run_id)[0].status, StepStatus::Completed);
        assert_eq!(h.engine.calls(), 1);
        assert_eq!(h.ctx.store.protocol_token_usage(run_id)?, 90);
    }

    {
        let store = Arc::new(SqliteStore::open(&db_path)?);
        let h = harness_with_store(budgeted(), store, engine(), ScriptedQa::passing());
        assert_eq!(h.ctx.store.protocol_token_usage(run_id)?, 90);
        h.ctx.orchestrator.run_next_step(run_id, None).await?;
        h.ctx.drain().await?;

        assert_eq!(h.engine.calls(), 0);
        let step = &h.steps(run_id)[1];
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.runtime_state.last_error.as_deref().unwrap_or("").contains("over its limit"));
        assert_eq!(h.run(run_id).status, ProtocolStatus::Blocked);
        assert_eq!(h.ctx.store.protocol_token_usage(run_id)?, 90);
    }

    Ok(())
}

/// Integration test: of two actions racing on one step exactly one wins
#[tokio::test]
async fn test_racing_actions_have_one_winner() {
    let engine = ScriptedEngine::new("codex").then_fail("boom", false);
    let h = harness(config(QueueBackend::Durable), engine, ScriptedQa::passing());
    let run = h.protocol("contested", vec![skip("01-impl")]);
    let orch = &h.ctx.orchestrator;

    orch.start(run.id, None).await.unwrap();
    h.ctx.drain().await.unwrap();
    let step = h.steps(run.id)[0].clone();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(h.run(run.id).status, ProtocolStatus::Blocked);

    let (rerun, qa) = tokio::join!(
        orch.run_step(step.id, Some(StepStatus::Failed)),
        orch.run_qa(step.id, Some(StepStatus::Failed)),
    );

    let results = [rerun, qa];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).expect("one action loses");
    assert!(matches!(loser, ProtoflowError::StateConflict { .. }), "unexpected error: {}", loser);

    let events = h.events(run.id);
    assert_eq!(events.iter().filter(|e| *e == event_types::TRANSITION_REJECTED).count(), 1);
    assert_eq!(h.ctx.queue().stats().unwrap().queued, 1);
    assert_eq!(h.run(run.id).status, ProtocolStatus::Running);
}
