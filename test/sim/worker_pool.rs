//! Worker pool simulation.
//!
//! Drives a [`Reconciler`] and a [`QuotaScheduler`] with a small fake pool
//! of workers, one tick per second, the way a dispatcher would:
//!
//! 1. Enqueue jobs that become due
//! 2. Advance running jobs, reporting completed ones absent
//! 3. Stop everything listed in the cancellation feed, acknowledge it, and
//!    put preempted jobs back in the queue
//! 4. Poll with every idle worker and start what comes back
//!
//! ## Running
//!
//! ```bash
//! RUST_LOG=debug cargo test -p qsched-sim --test worker_pool -- --nocapture
//! ```

use std::collections::BTreeMap;

use anyhow::{bail, ensure, Context};
use chrono::{DateTime, Duration, TimeZone, Utc};
use qsched_events::{RecordingEventSink, TaskEventKind};
use qsched_id::{AccountId, RequestId, WorkerId};
use qsched_reconcile::{
    IdleWorker, LabelSet, Reconciler, ReconcilerConfig, TaskAbsentRequest, TaskRunningRequest,
    TaskScheduler, TaskWaitingRequest, PREEMPTED_MESSAGE,
};
use qsched_scheduler::{AccountConfig, QuotaScheduler};
use tracing::{debug, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const WORKER_QUEUE_TIMEOUT_SECS: u64 = 5;
const MAX_TICKS: i64 = 200;

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn labels(names: &[&str]) -> LabelSet {
    names.iter().copied().collect()
}

#[derive(Debug, Clone)]
struct Job {
    id: RequestId,
    account: AccountId,
    labels: LabelSet,
    due_tick: i64,
    duration: i64,
    enqueue_time: DateTime<Utc>,
}

impl Job {
    fn new(id: &str, account: &str, names: &[&str], due_tick: i64, duration: i64) -> Self {
        Self {
            id: RequestId::new(id),
            account: AccountId::new(account),
            labels: labels(names),
            due_tick,
            duration,
            enqueue_time: t0() + Duration::seconds(due_tick),
        }
    }

    fn waiting(&self, now: DateTime<Utc>) -> TaskWaitingRequest {
        TaskWaitingRequest {
            account_id: self.account.clone(),
            request_id: self.id.clone(),
            labels: self.labels.clone(),
            enqueue_time: self.enqueue_time,
            time: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
}

#[derive(Debug)]
struct Run {
    request_id: RequestId,
    remaining: i64,
}

/// A pool of fake workers fed by one reconciler.
struct Pool {
    scheduler: QuotaScheduler,
    reconciler: Reconciler,
    events: RecordingEventSink,
    workers: Vec<(WorkerId, LabelSet)>,
    runs: BTreeMap<WorkerId, Run>,
    jobs: BTreeMap<RequestId, Job>,
    outcomes: BTreeMap<RequestId, Vec<Outcome>>,
    /// Scripted out-of-band failures, by tick.
    failures: BTreeMap<i64, (RequestId, String)>,
    preemptions: usize,
}

impl Pool {
    fn new(scheduler: QuotaScheduler, workers: &[(&str, &[&str])], jobs: Vec<Job>) -> Self {
        Self {
            scheduler,
            reconciler: Reconciler::new(ReconcilerConfig::new(std::time::Duration::from_secs(
                WORKER_QUEUE_TIMEOUT_SECS,
            ))),
            events: RecordingEventSink::new(),
            workers: workers
                .iter()
                .map(|(id, names)| (WorkerId::new(*id), labels(names)))
                .collect(),
            runs: BTreeMap::new(),
            jobs: jobs.into_iter().map(|j| (j.id.clone(), j)).collect(),
            outcomes: BTreeMap::new(),
            failures: BTreeMap::new(),
            preemptions: 0,
        }
    }

    fn settled(&self) -> bool {
        self.jobs.keys().all(|id| self.outcomes.contains_key(id))
    }

    fn job(&self, request_id: &RequestId) -> anyhow::Result<&Job> {
        self.jobs
            .get(request_id)
            .with_context(|| format!("unknown job {request_id}"))
    }

    fn tick(&mut self, tick: i64) -> anyhow::Result<()> {
        let now = t0() + Duration::seconds(tick);

        let due: Vec<TaskWaitingRequest> = self
            .jobs
            .values()
            .filter(|j| j.due_tick == tick)
            .map(|j| j.waiting(now))
            .collect();
        for request in due {
            self.reconciler
                .notify_task_waiting(&mut self.scheduler, &mut self.events, request);
        }

        if let Some((request_id, message)) = self.failures.remove(&tick) {
            self.reconciler.add_task_error(request_id, message);
        }

        let finished: Vec<WorkerId> = self
            .runs
            .iter_mut()
            .filter_map(|(worker_id, run)| {
                run.remaining -= 1;
                (run.remaining <= 0).then(|| worker_id.clone())
            })
            .collect();
        for worker_id in finished {
            let Some(run) = self.runs.remove(&worker_id) else {
                continue;
            };
            debug!(tick, worker_id = %worker_id, request_id = %run.request_id, "Job finished");
            self.outcomes
                .entry(run.request_id.clone())
                .or_default()
                .push(Outcome::Completed);
            self.reconciler.notify_task_absent(
                &mut self.scheduler,
                &mut self.events,
                TaskAbsentRequest {
                    request_id: run.request_id,
                    time: now,
                },
            );
        }

        for cancellation in self.reconciler.cancellations(&self.scheduler) {
            match &cancellation.worker_id {
                Some(worker_id) => {
                    ensure!(
                        cancellation.error_message == PREEMPTED_MESSAGE,
                        "unexpected cancellation message {:?}",
                        cancellation.error_message
                    );
                    let killed = self
                        .runs
                        .remove(worker_id)
                        .with_context(|| format!("cancelled run on idle worker {worker_id}"))?;
                    ensure!(
                        killed.request_id == cancellation.request_id,
                        "worker {worker_id} was running {}, not {}",
                        killed.request_id,
                        cancellation.request_id
                    );
                    info!(
                        tick,
                        worker_id = %worker_id,
                        request_id = %killed.request_id,
                        "Killed preempted job"
                    );
                    self.preemptions += 1;
                }
                None => {
                    self.outcomes
                        .entry(cancellation.request_id.clone())
                        .or_default()
                        .push(Outcome::Failed);
                }
            }

            self.reconciler.notify_task_absent(
                &mut self.scheduler,
                &mut self.events,
                TaskAbsentRequest {
                    request_id: cancellation.request_id.clone(),
                    time: now,
                },
            );

            if cancellation.worker_id.is_some() {
                let retry = self.job(&cancellation.request_id)?.waiting(now);
                self.reconciler
                    .notify_task_waiting(&mut self.scheduler, &mut self.events, retry);
            }
        }

        let idle: Vec<IdleWorker> = self
            .workers
            .iter()
            .filter(|(id, _)| !self.runs.contains_key(id))
            .map(|(id, labels)| IdleWorker::new(id.clone(), labels.clone()))
            .collect();
        let assignments =
            self.reconciler
                .assign_tasks(&mut self.scheduler, &mut self.events, now, &idle);

        for assignment in assignments {
            if let Some((busy, _)) = self
                .runs
                .iter()
                .find(|(_, run)| run.request_id == assignment.request_id)
            {
                bail!(
                    "{} assigned to {} while running on {busy}",
                    assignment.request_id,
                    assignment.worker_id
                );
            }
            let duration = self.job(&assignment.request_id)?.duration;
            debug!(
                tick,
                worker_id = %assignment.worker_id,
                request_id = %assignment.request_id,
                provision_required = assignment.provision_required,
                "Starting job"
            );
            self.reconciler.notify_task_running(
                &mut self.scheduler,
                &mut self.events,
                TaskRunningRequest {
                    request_id: assignment.request_id.clone(),
                    worker_id: assignment.worker_id.clone(),
                    time: now,
                },
            );
            self.runs.insert(
                assignment.worker_id,
                Run {
                    request_id: assignment.request_id,
                    remaining: duration,
                },
            );
        }

        Ok(())
    }

    fn run(&mut self) -> anyhow::Result<i64> {
        for tick in 0..MAX_TICKS {
            self.tick(tick)?;
            if tick > 0 && self.settled() && self.runs.is_empty() {
                return Ok(tick);
            }
        }
        bail!("pool did not settle within {MAX_TICKS} ticks")
    }
}

fn quota_scheduler() -> anyhow::Result<QuotaScheduler> {
    let mut scheduler = QuotaScheduler::new(t0());
    scheduler.add_account(AccountId::new("batch"), AccountConfig::default(), [0.0; 3])?;
    scheduler.add_account(
        AccountId::new("interactive"),
        AccountConfig {
            charge_rate: [1.0, 0.0, 0.0],
            max_charge_seconds: 100.0,
            ..Default::default()
        },
        [100.0, 0.0, 0.0],
    )?;
    Ok(scheduler)
}

const WORKERS: &[(&str, &[&str])] = &[("gpu-0", &["gpu"]), ("cpu-1", &[]), ("cpu-2", &[])];
const SINGLE_WORKER: &[(&str, &[&str])] = &[("cpu-1", &[])];

fn mixed_jobs() -> Vec<Job> {
    let mut jobs = vec![Job::new("batch-0", "batch", &["gpu"], 0, 10)];
    jobs.extend((1..6).map(|i| Job::new(&format!("batch-{i}"), "batch", &[], 0, 10)));
    jobs.push(Job::new("interactive-0", "interactive", &["gpu"], 2, 5));
    jobs.push(Job::new("interactive-1", "interactive", &[], 2, 5));
    jobs
}

#[test]
fn test_pool_drains_with_preemption() -> anyhow::Result<()> {
    init_tracing();

    let mut pool = Pool::new(quota_scheduler()?, WORKERS, mixed_jobs());
    pool.failures
        .insert(1, (RequestId::new("batch-5"), "input missing".to_string()));

    let ticks = pool.run()?;
    info!(ticks, preemptions = pool.preemptions, "Pool settled");

    for (request_id, outcomes) in &pool.outcomes {
        let expected = if request_id.as_str() == "batch-5" {
            Outcome::Failed
        } else {
            Outcome::Completed
        };
        assert_eq!(outcomes, &vec![expected], "{request_id}");
    }
    assert_eq!(pool.outcomes.len(), pool.jobs.len());

    assert!(pool.preemptions >= 1);
    assert_eq!(
        pool.events.of_kind(TaskEventKind::Preempted).count(),
        pool.preemptions
    );

    assert!(pool.reconciler.cancellations(&pool.scheduler).is_empty());
    assert_eq!(pool.reconciler.leases().count(), 0);
    assert_eq!(pool.reconciler.task_errors().count(), 0);
    assert_eq!(pool.scheduler.waiting_requests().count(), 0);
    assert_eq!(pool.scheduler.assigned_requests().count(), 0);
    Ok(())
}

#[test]
fn test_gpu_job_preempts_run_on_gpu_worker() -> anyhow::Result<()> {
    init_tracing();

    let mut pool = Pool::new(quota_scheduler()?, WORKERS, mixed_jobs());
    for tick in 0..=2 {
        pool.tick(tick)?;
    }

    let gpu = WorkerId::new("gpu-0");
    assert_eq!(
        pool.reconciler.lease(&gpu).map(|l| l.request_id.as_str()),
        Some("interactive-0")
    );
    assert!(!pool
        .scheduler
        .is_assigned(&RequestId::new("batch-0"), &gpu));

    pool.tick(3)?;
    assert_eq!(
        pool.runs.get(&gpu).map(|r| r.request_id.as_str()),
        Some("interactive-0")
    );
    assert!(pool.reconciler.lease(&gpu).is_none());
    Ok(())
}

#[test]
fn test_funded_jobs_wait_without_free_capacity_when_nothing_to_preempt() -> anyhow::Result<()> {
    init_tracing();

    let jobs = vec![
        Job::new("interactive-0", "interactive", &[], 0, 3),
        Job::new("interactive-1", "interactive", &[], 0, 3),
    ];
    let mut pool = Pool::new(quota_scheduler()?, SINGLE_WORKER, jobs);

    let ticks = pool.run()?;
    assert_eq!(pool.preemptions, 0);
    assert!(ticks >= 6);
    assert!(pool
        .outcomes
        .values()
        .all(|o| o == &vec![Outcome::Completed]));
    Ok(())
}
