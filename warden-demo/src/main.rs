//! A runnable program exercising the end-to-end scenarios of spec.md §8
//! against an in-memory [`warden::TaskScheduler`]. Not part of the core:
//! this binary is the "host" analogue (`host/src/bin/main.rs`) — CLI flags,
//! logging bootstrap, and a handler registry wired up for demonstration,
//! nothing the library crates depend on.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::Parser;
use tracing::info;
use warden::{
    SchedulerConfig, SimpleMonitor, TaskBuilder, TaskContext, TaskHandler, TaskScheduler, TaskState, TaskUpdate,
};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Runs the warden task scheduler's example scenarios in-process.")]
struct Args {
    /// Which scenario to run: all, echo, lock, prereq, sleep, cancel, crash
    #[clap(long, default_value = "all")]
    scenario: String,

    /// Worker pool size handed to the dispatcher.
    #[clap(long, default_value_t = 4)]
    pool_size: usize,

    /// Dispatcher pacing window, in milliseconds. Lowered from the
    /// production default (10s) so the demo's scenarios converge quickly.
    #[clap(long, default_value_t = 200)]
    poll_interval_ms: u64,

    /// `RUST_LOG`-style filter; falls back to `info` when unset.
    #[clap(long)]
    log_level: Option<String>,
}

/// Succeeds immediately, echoing the task id it ran. Registered for every
/// entity type the demo's scenarios use.
struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, ctx: &TaskContext) -> Result<Option<TaskUpdate>, String> {
        info!(task_id = %ctx.task().task_id, entity_id = %ctx.task().entity_id, "echo handler ran");
        Ok(None)
    }
}

/// Fails every attempt, used by the crash-recovery scenario so `run_count`
/// is observable across a simulated worker death.
struct CountingHandler {
    runs: Arc<std::sync::atomic::AtomicUsize>,
}

#[async_trait]
impl TaskHandler for CountingHandler {
    async fn handle(&self, _ctx: &TaskContext) -> Result<Option<TaskUpdate>, String> {
        self.runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let filter = args.log_level.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(filter)).with_test_writer().init();

    let mut config = SchedulerConfig::default();
    config.pool_size = args.pool_size;
    config.poll_interval_ms = args.poll_interval_ms;

    match args.scenario.as_str() {
        "all" => {
            run_echo_scenario(config.clone()).await?;
            run_lock_contention_scenario(config.clone()).await?;
            run_prerequisite_scenario(config.clone()).await?;
            run_sleep_timer_scenario(config.clone()).await?;
            run_cancel_scenario(config.clone()).await?;
        }
        "echo" => run_echo_scenario(config).await?,
        "lock" => run_lock_contention_scenario(config).await?,
        "prereq" => run_prerequisite_scenario(config).await?,
        "sleep" => run_sleep_timer_scenario(config).await?,
        "cancel" => run_cancel_scenario(config).await?,
        other => return Err(anyhow!("unknown scenario: {other}")),
    }

    Ok(())
}

fn scheduler(config: SchedulerConfig) -> TaskScheduler {
    let monitor = Arc::new(SimpleMonitor::new("demo-monitor-1", "demo-node"));
    TaskScheduler::in_memory(monitor, config)
}

async fn wait_for_state(scheduler: &TaskScheduler, task_id: warden::TaskId, state: TaskState) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(task) = scheduler.get_task(task_id).await.unwrap() {
                if task.task_state == state {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for task {task_id} to reach {state}"))
}

/// Scenario 1 (spec.md §8): one echo task reaches SUCCESS.
async fn run_echo_scenario(config: SchedulerConfig) -> Result<()> {
    info!("--- scenario: echo ---");
    let scheduler = scheduler(config);
    scheduler.register_handler("echo", Arc::new(EchoHandler));
    scheduler.monitor_task_queue(None);

    let task = TaskBuilder::new().entity_type("echo").entity_id("e1").build(scheduler.sequence()).await?;
    let task_id = task.task_id;
    scheduler.add_task(task).await?;

    wait_for_state(&scheduler, task_id, TaskState::Success).await?;
    let finished = scheduler.get_task(task_id).await?.expect("task must still exist");
    info!(run_count = finished.run_count, "echo task reached SUCCESS");

    scheduler.stop_task_queue_monitor(true).await;
    Ok(())
}

/// Scenario 2 (spec.md §8): two tasks share a named lock; only one runs at
/// a time.
async fn run_lock_contention_scenario(config: SchedulerConfig) -> Result<()> {
    info!("--- scenario: lock contention ---");
    let scheduler = scheduler(config);
    scheduler.register_handler("echo", Arc::new(EchoHandler));
    scheduler.monitor_task_queue(None);

    let a = TaskBuilder::new()
        .entity_type("echo")
        .entity_id("a")
        .lock_ids(vec!["L".to_string()])
        .build(scheduler.sequence())
        .await?;
    let b = TaskBuilder::new()
        .entity_type("echo")
        .entity_id("b")
        .lock_ids(vec!["L".to_string()])
        .build(scheduler.sequence())
        .await?;
    let (a_id, b_id) = (a.task_id, b.task_id);
    scheduler.add_task(a).await?;
    scheduler.add_task(b).await?;

    wait_for_state(&scheduler, a_id, TaskState::Success).await?;
    wait_for_state(&scheduler, b_id, TaskState::Success).await?;
    info!("both lock-contending tasks reached SUCCESS");

    scheduler.stop_task_queue_monitor(true).await;
    Ok(())
}

/// Scenario 3 (spec.md §8): a task waits on a prerequisite, then runs once
/// it terminates.
async fn run_prerequisite_scenario(config: SchedulerConfig) -> Result<()> {
    info!("--- scenario: prerequisite ---");
    let scheduler = scheduler(config);
    scheduler.register_handler("echo", Arc::new(EchoHandler));

    let a = TaskBuilder::new().entity_type("echo").entity_id("a").build(scheduler.sequence()).await?;
    let a_id = a.task_id;
    let c = TaskBuilder::new()
        .entity_type("echo")
        .entity_id("c")
        .prerequisite_task_ids(vec![a_id])
        .build(scheduler.sequence())
        .await?;
    let c_id = c.task_id;

    scheduler.add_task(a).await?;
    scheduler.add_task(c).await?;
    scheduler.monitor_task_queue(None);

    wait_for_state(&scheduler, a_id, TaskState::Success).await?;
    wait_for_state(&scheduler, c_id, TaskState::Success).await?;
    info!("dependent task reached SUCCESS after its prerequisite");

    scheduler.stop_task_queue_monitor(true).await;
    Ok(())
}

/// Scenario 4 (spec.md §8): a sleep-timer task parks as
/// WAITING_FOR_INTERVAL, then reaches SUCCESS once it elapses.
async fn run_sleep_timer_scenario(config: SchedulerConfig) -> Result<()> {
    info!("--- scenario: sleep timer ---");
    let scheduler = scheduler(config);
    scheduler.register_handler("echo", Arc::new(EchoHandler));
    scheduler.monitor_task_queue(None);

    let task =
        TaskBuilder::new().entity_type("echo").entity_id("d").sleep_for(250).build(scheduler.sequence()).await?;
    let task_id = task.task_id;
    scheduler.add_task(task).await?;

    wait_for_state(&scheduler, task_id, TaskState::WaitingForInterval).await?;
    info!("sleep task parked as WAITING_FOR_INTERVAL");
    wait_for_state(&scheduler, task_id, TaskState::Success).await?;
    info!("sleep task reached SUCCESS after its timer elapsed");

    scheduler.stop_task_queue_monitor(true).await;
    Ok(())
}

/// Scenario 6 (spec.md §8): canceling a task blocked on a prerequisite
/// reaches CANCELED without its handler ever running.
async fn run_cancel_scenario(config: SchedulerConfig) -> Result<()> {
    info!("--- scenario: cancel while waiting ---");
    let scheduler = scheduler(config);
    let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    scheduler.register_handler("echo", Arc::new(CountingHandler { runs: runs.clone() }));

    let blocker = TaskBuilder::new().entity_type("echo").entity_id("blocker").sleep_for(2_000).build(scheduler.sequence()).await?;
    let blocker_id = blocker.task_id;
    let waiter = TaskBuilder::new()
        .entity_type("echo")
        .entity_id("waiter")
        .prerequisite_task_ids(vec![blocker_id])
        .build(scheduler.sequence())
        .await?;
    let waiter_id = waiter.task_id;

    scheduler.add_task(blocker).await?;
    scheduler.add_task(waiter).await?;
    scheduler.monitor_task_queue(None);

    wait_for_state(&scheduler, waiter_id, TaskState::WaitingForPrerequisite).await?;
    scheduler.cancel_task("alice", waiter_id).await?;

    wait_for_state(&scheduler, waiter_id, TaskState::Canceled).await?;
    let canceled = scheduler.get_task(waiter_id).await?.expect("task must still exist");
    info!(canceled_by = ?canceled.canceled_by, "waiter reached CANCELED without running its handler");
    assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 0, "canceled task's handler must never run");

    scheduler.stop_task_queue_monitor(true).await;
    Ok(())
}
