//! Trampoline evaluator
//!
//! A rule body returns a [`RuleResult`]. `EvalAndThen` pushes the caller's
//! continuation onto an explicit stack and starts the nested rule; when a
//! nested rule produces a value the top frame is popped and resumed with it.
//! Chain depth therefore costs heap frames, never native stack.
//!
//! Rule bodies and continuations are synchronous and run on the blocking
//! pool under a semaphore permit, so at most `max_parallelism` of them run
//! at once. The permit is released between steps: a rule suspended on a
//! nested evaluation holds no worker.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use kilnstore::CacheRecord;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::locks::DirectoryLocker;
use crate::cache::{CacheManager, Claim, InFlight, LeaderGuard, Outcome, input_fingerprint, object_id_hash};
use crate::events::ProgressLogger;
use crate::repo::Repo;
use crate::rule::{BuildError, Context, Continuation, LockedBlock, Rule, RuleKind, RuleRegistry, RuleResult};
use crate::value::{Args, Value};

/// Result of one (possibly nested) rule evaluation
#[derive(Debug, Clone)]
pub struct Evaluated {
    /// Canonical rule name
    pub rule: String,
    /// `None` when an action completed with `Done`
    pub value: Option<Value>,
    pub object_id_hash: String,
    pub hash_changed: bool,
}

type SharedOutcome = Result<Evaluated, BuildError>;

/// An invocation that owns its key and is being driven
struct Active {
    rule_name: String,
    rule: Arc<dyn Rule>,
    kind: RuleKind,
    key: String,
    fingerprint: String,
    ctx: Context,
    guard: LeaderGuard<SharedOutcome>,
}

/// An invocation suspended on a nested evaluation
struct Frame {
    active: Active,
    then: Continuation,
}

enum Step {
    Start { rule: String, args: Args },
    Resolve {
        active: Active,
        result: Result<RuleResult, BuildError>,
    },
    Deliver(SharedOutcome),
}

enum Begun {
    Run(Box<Active>),
    Ready(Evaluated),
}

pub struct Evaluator {
    registry: Arc<RuleRegistry>,
    cache: CacheManager,
    repo: Repo,
    inflight: Arc<InFlight<SharedOutcome>>,
    permits: Arc<Semaphore>,
    dir_locks: DirectoryLocker,
}

impl Evaluator {
    pub fn new(registry: Arc<RuleRegistry>, cache: CacheManager, repo: Repo, max_parallelism: usize) -> Self {
        debug!(max_parallelism, "Evaluator::new: called");
        Self {
            registry,
            cache,
            repo,
            inflight: InFlight::new(),
            permits: Arc::new(Semaphore::new(max_parallelism.max(1))),
            dir_locks: DirectoryLocker::new(),
        }
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    /// Evaluate `rule` with `args` to completion
    ///
    /// Nested evaluations run on the same explicit stack. The first failure
    /// aborts every enclosing continuation. After `cancel` fires the current
    /// synchronous step is allowed to finish, its result is discarded and
    /// nothing further is committed.
    pub async fn evaluate(
        &self,
        rule: &str,
        args: Args,
        progress: &ProgressLogger,
        cancel: &CancelToken,
    ) -> Result<Evaluated, BuildError> {
        info!(%rule, "Evaluator::evaluate: called");
        let mut stack: Vec<Frame> = Vec::new();
        let mut step = Step::Start {
            rule: rule.to_string(),
            args,
        };

        loop {
            if cancel.is_cancelled() {
                info!(%rule, depth = stack.len(), "Evaluator::evaluate: cancelled");
                // Dropping the frames abandons their keys without committing
                return Err(BuildError::Cancelled);
            }

            step = match step {
                Step::Start { rule, args } => match self.identify(&rule, &args, &stack) {
                    Err(e) => Step::Deliver(Err(e)),
                    Ok((rule_name, rule, key)) => match self.begin(rule_name, rule, key, args, progress, cancel).await {
                        Ok(Begun::Run(active)) => {
                            let result = self.run_body(&active, cancel).await;
                            Step::Resolve {
                                active: *active,
                                result,
                            }
                        }
                        Ok(Begun::Ready(evaluated)) => Step::Deliver(Ok(evaluated)),
                        Err(e) => Step::Deliver(Err(e)),
                    },
                },

                Step::Resolve { active, result } => match result {
                    Ok(RuleResult::Value(value)) => Step::Deliver(self.complete(active, Some(value), cancel).await),
                    Ok(RuleResult::Done) if active.kind == RuleKind::Action => {
                        Step::Deliver(self.complete(active, None, cancel).await)
                    }
                    Ok(RuleResult::Done) => {
                        let err = active.ctx.fail("build rule returned Done without a value");
                        Step::Deliver(Err(abandon_or_fail(active.guard, err)))
                    }
                    Ok(RuleResult::EvalAndThen { rule, args, then }) => {
                        debug!(from = %active.rule_name, to = %rule, depth = stack.len() + 1, "Evaluator: nested evaluation");
                        stack.push(Frame { active, then });
                        Step::Start { rule, args }
                    }
                    Ok(RuleResult::WithDirectoryLock { directory, then }) => {
                        let result = self.run_locked(directory, then, cancel).await;
                        Step::Resolve { active, result }
                    }
                    Ok(RuleResult::Failed(err)) | Err(err) => {
                        let err = err.attribute(&active.rule_name);
                        active.ctx.progress().error(err.to_string());
                        Step::Deliver(Err(abandon_or_fail(active.guard, err)))
                    }
                },

                Step::Deliver(outcome) => {
                    let Some(Frame { active, then }) = stack.pop() else {
                        return outcome;
                    };
                    match outcome {
                        Ok(nested) => {
                            let value = nested.value.unwrap_or(Value::None);
                            let result = self.run_continuation(then, value, cancel).await;
                            Step::Resolve { active, result }
                        }
                        Err(err) => {
                            // The continuation never sees a failure
                            drop(then);
                            let err = err.nested(&active.rule_name);
                            Step::Deliver(Err(abandon_or_fail(active.guard, err)))
                        }
                    }
                }
            };
        }
    }

    /// Resolve the rule and compute its key, rejecting keys already on the stack
    fn identify(&self, name: &str, args: &Args, stack: &[Frame]) -> Result<(String, Arc<dyn Rule>, String), BuildError> {
        let (rule_name, rule) = self.registry.resolve(name)?;
        let key = object_id_hash(&rule_name, rule.version(), args);

        if let Some(pos) = stack.iter().position(|frame| frame.active.key == key) {
            let mut trail: Vec<String> = stack[pos..].iter().map(|f| f.active.rule_name.clone()).collect();
            trail.push(rule_name);
            warn!(?trail, "Evaluator::identify: dependency cycle");
            return Err(BuildError::Cycle(trail));
        }
        Ok((rule_name, rule, key))
    }

    /// Claim the key, or wait for the evaluation already holding it
    async fn begin(
        &self,
        rule_name: String,
        rule: Arc<dyn Rule>,
        key: String,
        args: Args,
        progress: &ProgressLogger,
        cancel: &CancelToken,
    ) -> Result<Begun, BuildError> {
        let mut args = Some(args);
        loop {
            match self.inflight.claim(&key) {
                Claim::Leader(guard) => {
                    let args = args.take().unwrap_or_default();
                    let mut active = self.prepare(rule_name, rule, key, args, guard, progress).await?;
                    active.ctx = active.ctx.with_cancel(cancel.clone());
                    return Ok(Begun::Run(Box::new(active)));
                }
                Claim::Follower(follower) => {
                    debug!(%rule_name, %key, "Evaluator::begin: waiting on in-flight evaluation");
                    tokio::select! {
                        outcome = follower.wait() => match outcome {
                            Outcome::Finished(result) => return result.map(Begun::Ready),
                            Outcome::Abandoned => continue,
                        },
                        _ = cancel.cancelled() => return Err(BuildError::Cancelled),
                    }
                }
            }
        }
    }

    /// Consult the cache and build the context for a claimed key
    async fn prepare(
        &self,
        rule_name: String,
        rule: Arc<dyn Rule>,
        key: String,
        args: Args,
        guard: LeaderGuard<SharedOutcome>,
        progress: &ProgressLogger,
    ) -> Result<Active, BuildError> {
        let kind = rule.kind();
        let dest = self.repo.object_dir(&key);
        let progress = progress.for_rule(&rule_name);

        let mut previous = None;
        let mut hash_changed = true;
        let mut fingerprint = String::new();
        let mut args = args;

        if kind == RuleKind::Build {
            let record = self.cache.lookup(&key).await;

            let shared = Arc::new(args);
            let fp_args = Arc::clone(&shared);
            let fp_key = key.clone();
            fingerprint = tokio::task::spawn_blocking(move || input_fingerprint(&fp_key, &fp_args))
                .await
                .map_err(|e| BuildError::execution(format!("fingerprinting failed: {}", e)).attribute(&rule_name))?;
            args = Arc::try_unwrap(shared).unwrap_or_else(|shared| (*shared).clone());

            if let Some(record) = record {
                let value = match Value::from_canonical_bytes(&record.value) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(%key, error = %e, "Evaluator::prepare: undecodable cached value, treating as miss");
                        None
                    }
                };
                let outputs_present = dest.is_dir() && record.outputs.iter().all(|p| p.exists());
                hash_changed = value.is_none()
                    || record.input_fingerprint != fingerprint
                    || record.dest_directory != dest
                    || !outputs_present;
                if let (Some(value), Some(built_at)) = (value, DateTime::from_timestamp_millis(record.committed_at)) {
                    previous = Some((value, built_at));
                }

                // The body may clear dest before failing; a leftover record
                // would then vouch for outputs that no longer exist
                if hash_changed && let Err(e) = self.cache.invalidate(&key).await {
                    warn!(%key, error = %e, "Evaluator::prepare: could not invalidate stale record");
                }
            }
        }

        tokio::fs::create_dir_all(&dest)
            .await
            .map_err(|e| BuildError::from(e).attribute(&rule_name))?;

        progress.verbose(format!("evaluating {} (hash changed: {})", rule_name, hash_changed));

        let mut ctx = Context::new(rule_name.clone(), args, dest)
            .with_object_id_hash(key.clone())
            .with_hash_changed(hash_changed)
            .with_shared_root(self.repo.shared_dir())
            .with_progress(progress);
        if let Some((value, built_at)) = previous {
            ctx = ctx.with_previous(value, built_at);
        }

        Ok(Active {
            rule_name,
            rule,
            kind,
            key,
            fingerprint,
            ctx,
            guard,
        })
    }

    async fn run_body(&self, active: &Active, cancel: &CancelToken) -> Result<RuleResult, BuildError> {
        let rule = Arc::clone(&active.rule);
        let ctx = active.ctx.clone();
        self.run_blocking(move || rule.build(&ctx), cancel).await
    }

    async fn run_continuation(
        &self,
        then: Continuation,
        value: Value,
        cancel: &CancelToken,
    ) -> Result<RuleResult, BuildError> {
        self.run_blocking(move || then(value), cancel).await
    }

    async fn run_locked(
        &self,
        directory: PathBuf,
        then: LockedBlock,
        cancel: &CancelToken,
    ) -> Result<RuleResult, BuildError> {
        debug!(?directory, "Evaluator::run_locked: called");
        let lock = self.dir_locks.lock_for(&directory);
        let _held = tokio::select! {
            held = lock.lock_owned() => held,
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
        };
        self.run_blocking(then, cancel).await
    }

    /// Run one synchronous step on the blocking pool under a permit
    async fn run_blocking<F>(&self, step: F, cancel: &CancelToken) -> Result<RuleResult, BuildError>
    where
        F: FnOnce() -> Result<RuleResult, BuildError> + Send + 'static,
    {
        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| BuildError::execution("worker pool closed"))?
            }
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
        };

        match tokio::task::spawn_blocking(step).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(BuildError::execution(format!(
                "rule panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(e) => Err(BuildError::execution(format!("rule task failed: {}", e))),
        }
    }

    /// Commit a build result and publish it to followers
    async fn complete(&self, active: Active, value: Option<Value>, cancel: &CancelToken) -> SharedOutcome {
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        if active.kind == RuleKind::Build
            && let Some(value) = &value
        {
            let dest = active.ctx.dest_directory();
            let outputs: Vec<PathBuf> = value
                .referenced_paths()
                .into_iter()
                .filter(|p| p.starts_with(dest))
                .map(|p| p.to_path_buf())
                .collect();
            let record = CacheRecord::new(
                &active.key,
                &active.rule_name,
                &active.fingerprint,
                dest,
                value.canonical_bytes(),
            )
            .with_outputs(outputs);
            if let Err(e) = self.cache.commit(record).await {
                warn!(key = %active.key, error = %e, "Evaluator::complete: cache commit failed");
            }
        }

        debug!(rule = %active.rule_name, key = %active.key, "Evaluator::complete: done");
        let evaluated = Evaluated {
            rule: active.rule_name,
            value,
            object_id_hash: active.key,
            hash_changed: active.ctx.hash_changed(),
        };
        active.guard.finish(Ok(evaluated.clone()));
        Ok(evaluated)
    }
}

/// Share a failure with followers; cancellation instead releases them to retry
fn abandon_or_fail(guard: LeaderGuard<SharedOutcome>, err: BuildError) -> BuildError {
    if err.is_cancelled() {
        drop(guard);
    } else {
        guard.finish(Err(err.clone()));
    }
    err
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::rule_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn evaluator(registry: RuleRegistry) -> (TempDir, Evaluator) {
        let temp = TempDir::new().unwrap();
        let repo = Repo::open(temp.path(), ".kiln").unwrap();
        let cache = CacheManager::spawn_in_memory().unwrap();
        (temp, Evaluator::new(Arc::new(registry), cache, repo, 2))
    }

    fn args(n: i64) -> Args {
        Args::from([("n".to_string(), Value::Number(n))])
    }

    fn detached() -> ProgressLogger {
        ProgressLogger::detached("test")
    }

    #[tokio::test]
    async fn test_value_and_second_call_unchanged() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = RuleRegistry::empty();
        registry.register(
            "t",
            "double",
            rule_fn(move |ctx| {
                if ctx.hash_changed() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(RuleResult::value(Value::Number(ctx.number_arg("n")? * 2)))
            }),
        );
        let (_temp, eval) = evaluator(registry).await;
        let cancel = CancelToken::new();

        let first = eval.evaluate("t.double", args(21), &detached(), &cancel).await.unwrap();
        assert!(first.hash_changed);
        assert_eq!(first.value, Some(Value::Number(42)));

        let second = eval.evaluate("t.double", args(21), &detached(), &cancel).await.unwrap();
        assert!(!second.hash_changed);
        assert_eq!(second.value, first.value);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nested_failure_skips_continuation() {
        let resumed = Arc::new(AtomicUsize::new(0));
        let flag = resumed.clone();
        let mut registry = RuleRegistry::empty();
        registry.register("t", "broken", rule_fn(|ctx| Err(ctx.fail("no such jar"))));
        registry.register(
            "t",
            "outer",
            rule_fn(move |_| {
                let flag = flag.clone();
                Ok(RuleResult::eval_and_then("t.broken", Args::new(), move |v| {
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok(RuleResult::Value(v))
                }))
            }),
        );
        let (_temp, eval) = evaluator(registry).await;

        let err = eval
            .evaluate("t.outer", Args::new(), &detached(), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NestedEvaluationError");
        assert_eq!(err.root().kind(), "RuleExecutionError");
        assert!(err.to_string().contains("t.broken"));
        assert_eq!(resumed.load(Ordering::SeqCst), 0);
        assert_eq!(eval.cache().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_rule() {
        let (_temp, eval) = evaluator(RuleRegistry::empty()).await;
        let err = eval
            .evaluate("t.none", Args::new(), &detached(), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, BuildError::UnknownRule("t.none".to_string()));
    }

    #[tokio::test]
    async fn test_cycle_detected() {
        let mut registry = RuleRegistry::empty();
        registry.register("t", "self", rule_fn(|ctx| Ok(RuleResult::eval("t.self", ctx.arguments().clone()))));
        let (_temp, eval) = evaluator(registry).await;

        let err = eval
            .evaluate("t.self", args(1), &detached(), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.root(), &BuildError::Cycle(vec!["t.self".to_string(), "t.self".to_string()]));
    }

    #[tokio::test]
    async fn test_done_only_for_actions() {
        let mut registry = RuleRegistry::empty();
        registry.register("t", "build", rule_fn(|_| Ok(RuleResult::Done)));
        registry.register("t", "act", rule_fn(|_| Ok(RuleResult::Done)).action());
        let (_temp, eval) = evaluator(registry).await;
        let cancel = CancelToken::new();

        let err = eval.evaluate("t.build", Args::new(), &detached(), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "RuleExecutionError");

        let done = eval.evaluate("t.act", Args::new(), &detached(), &cancel).await.unwrap();
        assert!(done.value.is_none());
        assert_eq!(eval.cache().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_actions_always_changed() {
        let mut registry = RuleRegistry::empty();
        registry.register(
            "t",
            "act",
            rule_fn(|ctx| Ok(RuleResult::value(ctx.hash_changed()))).action(),
        );
        let (_temp, eval) = evaluator(registry).await;
        let cancel = CancelToken::new();
        for _ in 0..2 {
            let result = eval.evaluate("t.act", Args::new(), &detached(), &cancel).await.unwrap();
            assert_eq!(result.value, Some(Value::Bool(true)));
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_execution_error() {
        let mut registry = RuleRegistry::empty();
        registry.register("t", "panics", rule_fn(|_| panic!("compiler exploded")));
        let (_temp, eval) = evaluator(registry).await;

        let err = eval
            .evaluate("t.panics", Args::new(), &detached(), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "RuleExecutionError");
        assert!(err.to_string().contains("compiler exploded"));
    }

    #[tokio::test]
    async fn test_directory_lock_block_runs() {
        let mut registry = RuleRegistry::empty();
        registry.register(
            "t",
            "locked",
            rule_fn(|ctx| {
                let shared = ctx.shared_directory("maven")?;
                let marker = shared.join("marker");
                Ok(RuleResult::with_directory_lock(shared, move || {
                    std::fs::write(&marker, "x")?;
                    Ok(RuleResult::value(Value::file(marker)))
                }))
            }),
        );
        let (_temp, eval) = evaluator(registry).await;
        let result = eval
            .evaluate("t.locked", Args::new(), &detached(), &CancelToken::new())
            .await
            .unwrap();
        let value = result.value.unwrap();
        assert!(value.as_file().unwrap().exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mut registry = RuleRegistry::empty();
        registry.register("t", "one", rule_fn(|_| Ok(RuleResult::value(Value::Number(1)))));
        let (_temp, eval) = evaluator(registry).await;
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = eval.evaluate("t.one", Args::new(), &detached(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(eval.cache().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_rebuild_forgets_previous_record() {
        let mut registry = RuleRegistry::empty();
        registry.register(
            "t",
            "emit",
            rule_fn(|ctx| {
                let dest = ctx.dest_directory();
                if ctx.hash_changed() {
                    std::fs::remove_dir_all(dest)?;
                    std::fs::create_dir_all(dest)?;
                    let src = std::fs::read_to_string(ctx.file_arg("src")?)?;
                    if src.trim() == "bad" {
                        return Err(ctx.fail("bad source"));
                    }
                    std::fs::write(dest.join("A.class"), src)?;
                }
                Ok(RuleResult::value(Value::string("ok")))
            }),
        );
        let (temp, eval) = evaluator(registry).await;
        let src = temp.path().join("A.java");
        let args = || Args::from([("src".to_string(), Value::file(&src))]);
        let cancel = CancelToken::new();

        std::fs::write(&src, "good").unwrap();
        let first = eval.evaluate("t.emit", args(), &detached(), &cancel).await.unwrap();
        assert!(first.hash_changed);

        std::fs::write(&src, "bad").unwrap();
        assert!(eval.evaluate("t.emit", args(), &detached(), &cancel).await.is_err());
        assert_eq!(eval.cache().count().await.unwrap(), 0);

        std::fs::write(&src, "good").unwrap();
        let third = eval.evaluate("t.emit", args(), &detached(), &cancel).await.unwrap();
        assert!(third.hash_changed);
        let dest = eval.repo().object_dir(&third.object_id_hash);
        assert!(dest.join("A.class").exists());
    }
}
