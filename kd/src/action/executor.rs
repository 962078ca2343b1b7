//! ActionExecutor - drives builds and actions as observable runs

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::types::{ActionResult, BuiltTargetInfo};
use crate::engine::{Engine, RepoInfo};
use crate::eval::{CancelToken, Evaluated};
use crate::events::{ActionEvent, ActionRun, RunObserver, read_run_events};
use crate::manifest::{Entry, Manifest, ManifestError};
use crate::rule::{BuildError, ErrorInfo, RuleKind};
use crate::value::{Args, Value};

/// What a run evaluates
enum Job {
    /// A manifest target; its output is linked under `outputs/` on success
    Build { entry: Entry },
    /// A manifest action with per-request argument overrides
    Action { entry: Entry, overrides: Args },
    /// A registered action rule invoked directly by name
    Rule { rule: String, args: Args },
}

#[derive(Default)]
struct RunTable {
    runs: HashMap<String, Arc<ActionRun>>,
    order: VecDeque<String>,
}

/// Starts, tracks and cancels runs over one [`Engine`]
///
/// Every BuildTarget or InvokeAction becomes an [`ActionRun`] driven on its
/// own task. Blocking callers wait for the terminal event; streaming callers
/// observe the run. Finished runs are kept for late observers up to the
/// configured retention, after which their persisted events remain readable.
pub struct ActionExecutor {
    engine: Arc<Engine>,
    table: Mutex<RunTable>,
}

impl ActionExecutor {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        debug!("ActionExecutor::new: called");
        Arc::new(Self {
            engine,
            table: Mutex::new(RunTable::default()),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn repo_info(&self) -> RepoInfo {
        self.engine.repo_info().await
    }

    /// Re-read the target graph and return refreshed metadata
    pub async fn reload(&self) -> Result<RepoInfo, ErrorInfo> {
        debug!("ActionExecutor::reload: called");
        self.engine
            .reload()
            .map_err(|e| ErrorInfo::request(format!("{:#}", e)))?;
        Ok(self.engine.repo_info().await)
    }

    /// Start building `target` in the background
    pub fn start_build(self: &Arc<Self>, target: &str) -> Result<Arc<ActionRun>, ErrorInfo> {
        debug!(%target, "ActionExecutor::start_build: called");
        let manifest = self.engine.manifest();
        let entry = manifest.target(target).map_err(request_error)?.clone();
        let rule = entry.rule.clone();
        Ok(self.spawn_run(target, &rule, manifest, Job::Build { entry }))
    }

    /// Start invoking `action` in the background
    ///
    /// Manifest actions take `args` as overrides of their declared arguments.
    /// A name that is not in the manifest is looked up as a registered action
    /// rule and invoked with `args` alone.
    pub fn start_action(self: &Arc<Self>, action: &str, args: Args) -> Result<Arc<ActionRun>, ErrorInfo> {
        debug!(%action, args = args.len(), "ActionExecutor::start_action: called");
        let manifest = self.engine.manifest();
        match manifest.action(action).cloned() {
            Ok(entry) => {
                let rule = entry.rule.clone();
                let job = Job::Action { entry, overrides: args };
                Ok(self.spawn_run(action, &rule, manifest, job))
            }
            Err(err) => {
                let (name, rule) = self
                    .engine
                    .evaluator()
                    .registry()
                    .resolve(action)
                    .map_err(|_| request_error(err))?;
                if rule.kind() != RuleKind::Action {
                    return Err(ErrorInfo::request(format!("{} is a build rule, not an action", name)));
                }
                let job = Job::Rule {
                    rule: name.clone(),
                    args,
                };
                Ok(self.spawn_run(action, &name, manifest, job))
            }
        }
    }

    /// Build `target` and wait for the result
    pub async fn build_target(self: &Arc<Self>, target: &str) -> Result<BuiltTargetInfo, ErrorInfo> {
        info!(%target, "ActionExecutor::build_target: called");
        let run = self.start_build(target)?;
        match wait_terminal(&run).await? {
            (Some(value), Some(object_id_hash)) => Ok(BuiltTargetInfo {
                run_id: run.id().to_string(),
                target: target.to_string(),
                output_dir: self.engine.repo().object_dir(&object_id_hash),
                object_id_hash,
                value,
            }),
            _ => Err(ErrorInfo::request(format!("target {} produced no value", target))),
        }
    }

    /// Invoke `action` and wait for the result
    pub async fn invoke_action(self: &Arc<Self>, action: &str, args: Args) -> Result<ActionResult, ErrorInfo> {
        info!(%action, "ActionExecutor::invoke_action: called");
        let run = self.start_action(action, args)?;
        let (value, _) = wait_terminal(&run).await?;
        Ok(ActionResult {
            run_id: run.id().to_string(),
            action: action.to_string(),
            value,
        })
    }

    pub fn run(&self, run_id: &str) -> Option<Arc<ActionRun>> {
        self.table.lock().ok()?.runs.get(run_id).cloned()
    }

    /// Observer over a run still held in memory
    pub fn observe(&self, run_id: &str) -> Option<RunObserver> {
        self.run(run_id).map(|run| run.observe())
    }

    /// Persisted events of a run no longer held in memory
    ///
    /// A log without a terminal event belongs to a run that never finished
    /// (the daemon stopped); a `Failed` event is appended to say so. Ids that
    /// are not run UUIDs are unknown, so they never name a path.
    pub fn replay(&self, run_id: &str) -> Option<Vec<ActionEvent>> {
        debug!(%run_id, "ActionExecutor::replay: called");
        if uuid::Uuid::parse_str(run_id).is_err() {
            debug!(%run_id, "ActionExecutor::replay: not a run id");
            return None;
        }
        let entries = match read_run_events(self.engine.repo().runs_dir(), run_id) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(%run_id, error = %e, "ActionExecutor::replay: unreadable run log");
                return None;
            }
        };
        if entries.is_empty() {
            return None;
        }

        let mut events: Vec<ActionEvent> = entries.into_iter().map(|entry| entry.event).collect();
        if !events.last().is_some_and(ActionEvent::is_terminal) {
            events.push(ActionEvent::Failed {
                run_id: run_id.to_string(),
                error: ErrorInfo::request("run did not complete"),
            });
        }
        Some(events)
    }

    /// Cancel a run; false if unknown or already finished
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.run(run_id) {
            Some(run) => run.cancel(),
            None => false,
        }
    }

    /// Cancel every run still in progress
    pub fn cancel_all(&self) -> usize {
        let runs: Vec<Arc<ActionRun>> = match self.table.lock() {
            Ok(table) => table.runs.values().cloned().collect(),
            Err(_) => return 0,
        };
        let cancelled = runs.iter().filter(|run| run.cancel()).count();
        info!(cancelled, "ActionExecutor::cancel_all: done");
        cancelled
    }

    fn spawn_run(self: &Arc<Self>, target: &str, rule: &str, manifest: Arc<Manifest>, job: Job) -> Arc<ActionRun> {
        let run = ActionRun::new(target, Some(Arc::clone(self.engine.bus())));
        info!(run_id = %run.id(), %target, %rule, "ActionExecutor: run started");
        self.register(&run);
        run.publish(ActionEvent::Started {
            run_id: run.id().to_string(),
            target: target.to_string(),
            rule: rule.to_string(),
        });

        let executor = Arc::clone(self);
        let task_run = Arc::clone(&run);
        tokio::spawn(async move {
            let outcome = executor.execute(&task_run, &manifest, job).await;
            let event = match outcome {
                Ok(evaluated) => ActionEvent::Finished {
                    run_id: task_run.id().to_string(),
                    value: evaluated.value,
                    object_id_hash: Some(evaluated.object_id_hash),
                },
                Err(err) => {
                    if !err.is_cancelled() {
                        warn!(run_id = %task_run.id(), error = %err, "ActionExecutor: run failed");
                    }
                    ActionEvent::Failed {
                        run_id: task_run.id().to_string(),
                        error: ErrorInfo::from(&err),
                    }
                }
            };
            if task_run.publish(event) {
                info!(run_id = %task_run.id(), "ActionExecutor: run finished");
            }
            executor.prune();
        });
        run
    }

    async fn execute(&self, run: &Arc<ActionRun>, manifest: &Manifest, job: Job) -> Result<Evaluated, BuildError> {
        let cancel = run.cancel_token();
        match job {
            Job::Build { entry } => {
                let evaluated = self.evaluate_entry(run, manifest, &entry, Args::new(), &cancel).await?;
                if let Err(e) = self.engine.repo().link_output(&entry.name, &evaluated.object_id_hash) {
                    warn!(target = %entry.name, error = %e, "ActionExecutor: failed to link output");
                }
                Ok(evaluated)
            }
            Job::Action { entry, overrides } => self.evaluate_entry(run, manifest, &entry, overrides, &cancel).await,
            Job::Rule { rule, args } => {
                let progress = run.progress(&rule);
                self.engine.evaluator().evaluate(&rule, args, &progress, &cancel).await
            }
        }
    }

    /// Build the targets `entry` references, then evaluate `entry` itself
    async fn evaluate_entry(
        &self,
        run: &Arc<ActionRun>,
        manifest: &Manifest,
        entry: &Entry,
        overrides: Args,
        cancel: &CancelToken,
    ) -> Result<Evaluated, BuildError> {
        let evaluator = self.engine.evaluator();
        let mut built: HashMap<String, Value> = HashMap::new();

        for name in manifest.plan(entry) {
            let dep = manifest.target(&name).map_err(|e| manifest_error(e, &entry.rule))?;
            let args = manifest
                .resolve_args(dep, &built)
                .map_err(|e| manifest_error(e, &dep.rule))?;
            debug!(run_id = %run.id(), target = %name, "ActionExecutor: building dependency");
            let evaluated = evaluator
                .evaluate(&dep.rule, args, &run.progress(&dep.rule), cancel)
                .await
                .map_err(|e| e.nested(&entry.rule))?;
            let value = evaluated
                .value
                .ok_or_else(|| BuildError::execution(format!("target {} produced no value", name)).attribute(&dep.rule))?;
            built.insert(name, value);
        }

        let mut args = manifest
            .resolve_args(entry, &built)
            .map_err(|e| manifest_error(e, &entry.rule))?;
        args.extend(overrides);
        evaluator
            .evaluate(&entry.rule, args, &run.progress(&entry.rule), cancel)
            .await
    }

    fn register(&self, run: &Arc<ActionRun>) {
        if let Ok(mut table) = self.table.lock() {
            table.runs.insert(run.id().to_string(), Arc::clone(run));
            table.order.push_back(run.id().to_string());
        }
    }

    /// Drop the oldest finished runs beyond the retention limit
    fn prune(&self) {
        let retained = self.engine.config().events.retained_runs;
        let Ok(mut table) = self.table.lock() else {
            return;
        };
        let table = &mut *table;

        let finished: Vec<String> = table
            .order
            .iter()
            .filter(|id| table.runs.get(*id).is_some_and(|run| run.is_finished()))
            .cloned()
            .collect();
        let excess = finished.len().saturating_sub(retained);
        for id in finished.into_iter().take(excess) {
            debug!(run_id = %id, "ActionExecutor::prune: releasing run");
            table.runs.remove(&id);
        }
        let runs = &table.runs;
        table.order.retain(|id| runs.contains_key(id));
    }
}

/// Block until `run` terminates; its value and object id hash on success
async fn wait_terminal(run: &Arc<ActionRun>) -> Result<(Option<Value>, Option<String>), ErrorInfo> {
    let mut observer = run.observe();
    let mut last = None;
    while let Some(event) = observer.next().await {
        last = Some(event);
    }
    match last {
        Some(ActionEvent::Finished {
            value, object_id_hash, ..
        }) => Ok((value, object_id_hash)),
        Some(ActionEvent::Failed { error, .. }) => Err(error),
        _ => Err(ErrorInfo::request("run ended without a result")),
    }
}

fn request_error(err: ManifestError) -> ErrorInfo {
    ErrorInfo::request(err.to_string())
}

fn manifest_error(err: ManifestError, rule: &str) -> BuildError {
    BuildError::argument(err.to_string()).attribute(rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::rule::{RuleRegistry, RuleResult, rule_fn};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"
targets:
  base:
    rule: test.const
    args:
      n: 1
  top:
    rule: test.wrap
    args:
      inner: {target: base}
  broken:
    rule: test.fail
actions:
  greet:
    rule: test.greet
    args:
      name: world
"#;

    fn registry(calls: Arc<AtomicUsize>) -> RuleRegistry {
        let mut registry = RuleRegistry::empty();
        registry
            .register(
                "test",
                "const",
                rule_fn(move |ctx| {
                    if ctx.hash_changed() {
                        calls.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(RuleResult::value(ctx.arg("n")?.clone()))
                }),
            )
            .register(
                "test",
                "wrap",
                rule_fn(|ctx| Ok(RuleResult::value(Value::list([ctx.arg("inner")?.clone()])))),
            )
            .register(
                "test",
                "fail",
                rule_fn(|ctx| Ok(RuleResult::failed(ctx.fail("always fails")))),
            )
            .register(
                "test",
                "greet",
                rule_fn(|ctx| {
                    ctx.progress().info(format!("hello {}", ctx.string_arg("name")?));
                    Ok(RuleResult::Done)
                })
                .action(),
            )
            .register(
                "test",
                "sleep",
                rule_fn(|_| {
                    std::thread::sleep(Duration::from_millis(200));
                    Ok(RuleResult::Done)
                })
                .action(),
            );
        registry
    }

    fn executor(temp: &TempDir, calls: Arc<AtomicUsize>, retained_runs: usize) -> Arc<ActionExecutor> {
        fs::write(temp.path().join("kiln-build.yml"), MANIFEST).unwrap();
        let mut config = Config::default();
        config.events.retained_runs = retained_runs;
        let engine = Engine::builder(temp.path())
            .config(config)
            .registry(registry(calls))
            .open()
            .unwrap();
        ActionExecutor::new(engine)
    }

    #[tokio::test]
    async fn test_build_target_builds_dependencies_first() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = executor(&temp, calls.clone(), 8);

        let built = executor.build_target("top").await.unwrap();
        assert_eq!(built.value, Value::list([Value::Number(1)]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(executor.engine().repo().outputs_dir().join("top").exists());

        let again = executor.build_target("top").await.unwrap();
        assert_eq!(again.value, built.value);
        assert_eq!(again.object_id_hash, built.object_id_hash);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_build_target_unknown() {
        let temp = TempDir::new().unwrap();
        let executor = executor(&temp, Arc::new(AtomicUsize::new(0)), 8);
        let err = executor.build_target("nope").await.unwrap_err();
        assert_eq!(err.kind, "RequestError");
        assert!(err.message.contains("nope"));
    }

    #[tokio::test]
    async fn test_build_target_failure_is_reported() {
        let temp = TempDir::new().unwrap();
        let executor = executor(&temp, Arc::new(AtomicUsize::new(0)), 8);
        let err = executor.build_target("broken").await.unwrap_err();
        assert_eq!(err.kind, "RuleExecutionError");
        assert!(err.message.contains("always fails"));
    }

    #[tokio::test]
    async fn test_invoke_action_streams_progress() {
        let temp = TempDir::new().unwrap();
        let executor = executor(&temp, Arc::new(AtomicUsize::new(0)), 8);

        let mut overrides = Args::new();
        overrides.insert("name".to_string(), Value::string("kiln"));
        let result = executor.invoke_action("greet", overrides).await.unwrap();
        assert!(result.value.is_none());

        let run = executor.run(&result.run_id).unwrap();
        let events = run.events();
        assert_eq!(events.first().map(ActionEvent::event_type), Some("Started"));
        assert!(events.iter().any(|e| matches!(
            e,
            ActionEvent::Progress { message, .. } if message == "hello kiln"
        )));
        assert_eq!(events.last().map(ActionEvent::event_type), Some("Finished"));
    }

    #[tokio::test]
    async fn test_invoke_registered_action_rule() {
        let temp = TempDir::new().unwrap();
        let executor = executor(&temp, Arc::new(AtomicUsize::new(0)), 8);

        let mut args = Args::new();
        args.insert("name".to_string(), Value::string("direct"));
        assert!(executor.invoke_action("test.greet", args).await.is_ok());

        let err = executor.invoke_action("test.const", Args::new()).await.unwrap_err();
        assert!(err.message.contains("not an action"));
    }

    #[tokio::test]
    async fn test_cancel_run() {
        let temp = TempDir::new().unwrap();
        let executor = executor(&temp, Arc::new(AtomicUsize::new(0)), 8);

        let run = executor.start_action("test.sleep", Args::new()).unwrap();
        assert!(executor.cancel(run.id()));
        assert!(!executor.cancel(run.id()));

        match run.terminal_event() {
            Some(ActionEvent::Failed { error, .. }) => assert_eq!(error.kind, "Cancelled"),
            other => panic!("unexpected {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(run.events().len(), 2);
    }

    #[tokio::test]
    async fn test_finished_runs_are_pruned() {
        let temp = TempDir::new().unwrap();
        let executor = executor(&temp, Arc::new(AtomicUsize::new(0)), 1);

        let first = executor.invoke_action("greet", Args::new()).await.unwrap();
        let second = executor.invoke_action("greet", Args::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(executor.run(&first.run_id).is_none());
        assert!(executor.run(&second.run_id).is_some());
    }

    #[tokio::test]
    async fn test_replay_persisted_run() {
        let temp = TempDir::new().unwrap();
        let executor = executor(&temp, Arc::new(AtomicUsize::new(0)), 0);

        let result = executor.invoke_action("greet", Args::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(executor.run(&result.run_id).is_none());

        let events = executor.replay(&result.run_id).unwrap();
        assert_eq!(events.first().map(ActionEvent::event_type), Some("Started"));
        assert_eq!(events.last().map(ActionEvent::event_type), Some("Finished"));
        assert!(executor.replay("no-such-run").is_none());
    }

    #[tokio::test]
    async fn test_replay_incomplete_run_synthesizes_failure() {
        let temp = TempDir::new().unwrap();
        let executor = executor(&temp, Arc::new(AtomicUsize::new(0)), 8);

        let orphan = uuid::Uuid::now_v7().to_string();
        let run_dir = executor.engine().repo().runs_dir().join(&orphan);
        fs::create_dir_all(&run_dir).unwrap();
        let started = crate::events::EventLogEntry::new(ActionEvent::Started {
            run_id: orphan.clone(),
            target: "greet".to_string(),
            rule: "test.greet".to_string(),
        });
        fs::write(
            run_dir.join("events.jsonl"),
            format!("{}\n", serde_json::to_string(&started).unwrap()),
        )
        .unwrap();

        let events = executor.replay(&orphan).unwrap();
        assert_eq!(events.len(), 2);
        match &events[1] {
            ActionEvent::Failed { error, .. } => assert_eq!(error.message, "run did not complete"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replay_ignores_paths_outside_runs_dir() {
        let temp = TempDir::new().unwrap();
        let executor = executor(&temp, Arc::new(AtomicUsize::new(0)), 8);

        let runs_dir = executor.engine().repo().runs_dir();
        let outside = runs_dir.parent().unwrap().join("elsewhere");
        fs::create_dir_all(&outside).unwrap();
        let started = crate::events::EventLogEntry::new(ActionEvent::Started {
            run_id: "elsewhere".to_string(),
            target: "greet".to_string(),
            rule: "test.greet".to_string(),
        });
        fs::write(
            outside.join("events.jsonl"),
            format!("{}\n", serde_json::to_string(&started).unwrap()),
        )
        .unwrap();

        assert!(executor.replay("../elsewhere").is_none());
        assert!(executor.replay("../..").is_none());
        assert!(executor.replay("").is_none());
    }
}
