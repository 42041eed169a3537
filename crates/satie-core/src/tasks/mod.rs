//! Background task runner.
//!
//! Tasks register at server start with a trigger: `OnStart` tasks launch
//! once when the worker comes up, `Scheduled` tasks launch on their
//! interval (optionally capped to a repeat count). Every launch gets a
//! snowflake run id and a tracked [`TaskRun`]; a periodic sweep clears
//! finished runs. Shutdown cancels everything outstanding.

pub mod snowflake;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::Env;
use crate::handler::BoxFuture;
use snowflake::SnowflakeGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    OnStart,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunStatus::Complete | RunStatus::Failed | RunStatus::Cancelled)
    }
}

/// One launch of a registered task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub run_id: u64,
    pub status: RunStatus,
    pub start: f64,
    pub end: Option<f64>,
    pub elapsed: f64,
    pub result: Option<String>,
    pub error: Option<String>,
}

pub type TaskFn = Arc<dyn Fn() -> BoxFuture<Result<Option<String>, String>> + Send + Sync>;

/// A task registration: name, callable, trigger, and optional schedule.
pub struct TaskDef {
    pub name: String,
    pub trigger: Trigger,
    pub schedule: Option<Duration>,
    pub repeat: Option<u64>,
    pub callable: TaskFn,
}

impl TaskDef {
    pub fn on_start<F, Fut>(name: impl Into<String>, callable: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>, String>> + Send + 'static,
    {
        TaskDef {
            name: name.into(),
            trigger: Trigger::OnStart,
            schedule: None,
            repeat: None,
            callable: Arc::new(move || Box::pin(callable())),
        }
    }

    pub fn scheduled<F, Fut>(name: impl Into<String>, interval: Duration, callable: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>, String>> + Send + 'static,
    {
        TaskDef {
            name: name.into(),
            trigger: Trigger::Scheduled,
            schedule: Some(interval),
            repeat: None,
            callable: Arc::new(move || Box::pin(callable())),
        }
    }

    /// Cap a scheduled task to `count` launches.
    pub fn repeat(mut self, count: u64) -> Self {
        self.repeat = Some(count);
        self
    }
}

struct TaskEntry {
    trigger: Trigger,
    schedule: Option<Duration>,
    repeat: Option<u64>,
    callable: TaskFn,
    runs: Arc<Mutex<HashMap<u64, TaskRun>>>,
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// Per-worker registry and scheduler of background tasks.
pub struct TaskRunner {
    cleanup_interval: Duration,
    generator: Arc<Mutex<SnowflakeGenerator>>,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new(instance_id: u64, env: &Env) -> Self {
        TaskRunner {
            cleanup_interval: env.cleanup_interval,
            generator: Arc::new(Mutex::new(SnowflakeGenerator::new(instance_id))),
            tasks: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, def: TaskDef) {
        self.tasks.lock().unwrap().insert(
            def.name.clone(),
            TaskEntry {
                trigger: def.trigger,
                schedule: def.schedule,
                repeat: def.repeat,
                callable: def.callable,
                runs: Arc::new(Mutex::new(HashMap::new())),
            },
        );
    }

    /// Launch `OnStart` tasks, arm schedules, and start the cleanup sweep.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap();

        let tasks = self.tasks.lock().unwrap();
        for (name, entry) in tasks.iter() {
            match entry.trigger {
                Trigger::OnStart => {
                    let run_id = self.next_run_id();
                    handles.push(spawn_run(
                        name.clone(),
                        entry.callable.clone(),
                        entry.runs.clone(),
                        run_id,
                    ));
                }
                Trigger::Scheduled => {
                    let Some(interval) = entry.schedule else {
                        tracing::warn!(task = %name, "scheduled task without an interval; skipping");
                        continue;
                    };
                    let callable = entry.callable.clone();
                    let runs = entry.runs.clone();
                    let generator = self.generator.clone();
                    let repeat = entry.repeat;
                    let name = name.clone();

                    handles.push(tokio::spawn(async move {
                        let mut ticker = tokio::time::interval(interval);
                        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                        // The first tick fires immediately; schedules wait a
                        // full interval before the first launch.
                        ticker.tick().await;

                        let mut launched = 0u64;
                        loop {
                            ticker.tick().await;
                            let run_id = generator.lock().unwrap().generate();
                            let handle =
                                spawn_run(name.clone(), callable.clone(), runs.clone(), run_id);
                            launched += 1;
                            if let Some(cap) = repeat
                                && launched >= cap
                            {
                                let _ = handle.await;
                                break;
                            }
                        }
                    }));
                }
            }
        }
        drop(tasks);

        // Periodic sweep of finished runs.
        let sweep_targets: Vec<Arc<Mutex<HashMap<u64, TaskRun>>>> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.runs.clone())
            .collect();
        let cleanup_interval = self.cleanup_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for runs in &sweep_targets {
                    runs.lock()
                        .unwrap()
                        .retain(|_, run| !run.status.is_finished());
                }
            }
        }));
    }

    /// Launch one run of a registered task immediately.
    pub fn run_now(&self, name: &str) -> Option<u64> {
        let tasks = self.tasks.lock().unwrap();
        let entry = tasks.get(name)?;
        let run_id = self.next_run_id();
        let handle = spawn_run(name.to_string(), entry.callable.clone(), entry.runs.clone(), run_id);
        drop(tasks);

        self.handles.lock().unwrap().push(handle);
        Some(run_id)
    }

    pub fn run_status(&self, name: &str, run_id: u64) -> Option<TaskRun> {
        let tasks = self.tasks.lock().unwrap();
        let entry = tasks.get(name)?;
        let runs = entry.runs.lock().unwrap();
        runs.get(&run_id).cloned()
    }

    /// The status of a task's most recent run.
    pub fn task_status(&self, name: &str) -> Option<RunStatus> {
        let tasks = self.tasks.lock().unwrap();
        let entry = tasks.get(name)?;
        let runs = entry.runs.lock().unwrap();
        runs.values()
            .max_by_key(|run| run.run_id)
            .map(|run| run.status)
    }

    /// Cancel outstanding work and mark unfinished runs as cancelled.
    pub fn shutdown(&self) {
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }

        let tasks = self.tasks.lock().unwrap();
        for entry in tasks.values() {
            let mut runs = entry.runs.lock().unwrap();
            for run in runs.values_mut() {
                if !run.status.is_finished() {
                    run.status = RunStatus::Cancelled;
                    run.end = Some(epoch_seconds());
                    run.elapsed = run.end.unwrap_or(run.start) - run.start;
                }
            }
        }
    }

    fn next_run_id(&self) -> u64 {
        self.generator.lock().unwrap().generate()
    }
}

fn spawn_run(
    name: String,
    callable: TaskFn,
    runs: Arc<Mutex<HashMap<u64, TaskRun>>>,
    run_id: u64,
) -> JoinHandle<()> {
    runs.lock().unwrap().insert(
        run_id,
        TaskRun {
            run_id,
            status: RunStatus::Pending,
            start: epoch_seconds(),
            end: None,
            elapsed: 0.0,
            result: None,
            error: None,
        },
    );

    tokio::spawn(async move {
        let start = epoch_seconds();
        if let Some(run) = runs.lock().unwrap().get_mut(&run_id) {
            run.status = RunStatus::Running;
            run.start = start;
        }

        tracing::debug!(task = %name, run_id, "task run started");
        let outcome = (callable)().await;
        let end = epoch_seconds();

        if let Some(run) = runs.lock().unwrap().get_mut(&run_id) {
            run.end = Some(end);
            run.elapsed = end - start;
            match outcome {
                Ok(result) => {
                    run.status = RunStatus::Complete;
                    run.result = result;
                }
                Err(error) => {
                    tracing::warn!(task = %name, run_id, %error, "task run failed");
                    run.status = RunStatus::Failed;
                    run.error = Some(error);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn runner() -> TaskRunner {
        TaskRunner::new(1, &Env::default())
    }

    #[tokio::test]
    async fn test_run_now_tracks_completion() {
        let tasks = runner();
        tasks.register(TaskDef::on_start("greet", || async {
            Ok(Some("hello".to_string()))
        }));

        let run_id = tasks.run_now("greet").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let run = tasks.run_status("greet", run_id).unwrap();
        assert_eq!(run.status, RunStatus::Complete);
        assert_eq!(run.result.as_deref(), Some("hello"));
        assert!(run.end.is_some());
    }

    #[tokio::test]
    async fn test_failed_run_records_error() {
        let tasks = runner();
        tasks.register(TaskDef::on_start("boom", || async {
            Err::<Option<String>, _>("exploded".to_string())
        }));

        let run_id = tasks.run_now("boom").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let run = tasks.run_status("boom", run_id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("exploded"));
        assert_eq!(tasks.task_status("boom"), Some(RunStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_task_launches_on_interval() {
        static LAUNCHES: AtomicU64 = AtomicU64::new(0);

        let tasks = runner();
        tasks.register(
            TaskDef::scheduled("tick", Duration::from_secs(1), || async {
                LAUNCHES.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .repeat(2),
        );
        tasks.start();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(LAUNCHES.load(Ordering::SeqCst), 2);

        tasks.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_runs() {
        let tasks = runner();
        tasks.register(TaskDef::on_start("slow", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }));

        let run_id = tasks.run_now("slow").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tasks.shutdown();

        let run = tasks.run_status("slow", run_id).unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }
}
