//! Integration tests for Kiln
//!
//! These tests verify end-to-end behavior of the engine, the daemon and the CLI.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_cmd::Command;
use kiln::action::ActionExecutor;
use kiln::api::DaemonServer;
use kiln::cache::CacheManager;
use kiln::engine::{Engine, VERSION};
use kiln::eval::{CancelToken, Evaluator};
use kiln::events::{ActionEvent, ProgressLogger};
use kiln::ipc::{DaemonClient, RemoteError, create_listener_at};
use kiln::repo::Repo;
use kiln::rule::{RuleRegistry, RuleResult, rule_fn};
use kiln::value::{Args, ClassOrigin, ClassPkg, CpInfo, Value, ValueSet};
use predicates::prelude::*;
use tempfile::TempDir;

fn evaluator(temp: &TempDir, registry: RuleRegistry) -> Evaluator {
    let repo = Repo::open(temp.path(), ".kiln").expect("Failed to open repo");
    let cache = CacheManager::spawn_in_memory().expect("Failed to start cache");
    Evaluator::new(Arc::new(registry), cache, repo, 4)
}

fn n_args(n: i64) -> Args {
    Args::from([("n".to_string(), Value::Number(n))])
}

fn progress() -> ProgressLogger {
    ProgressLogger::detached("integration")
}

/// Registry with a counting `t.double` and a slow counting `t.slow`
fn counting_registry(calls: Arc<AtomicUsize>) -> RuleRegistry {
    let slow_calls = Arc::clone(&calls);
    let mut registry = RuleRegistry::empty();
    registry
        .register(
            "t",
            "double",
            rule_fn(move |ctx| {
                if ctx.hash_changed() {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
                Ok(RuleResult::value(Value::Number(ctx.number_arg("n")? * 2)))
            }),
        )
        .register(
            "t",
            "slow",
            rule_fn(move |ctx| {
                if ctx.hash_changed() {
                    slow_calls.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(300));
                Ok(RuleResult::value(ctx.arg("n")?.clone()))
            }),
        );
    registry
}

// =============================================================================
// Evaluator Tests
// =============================================================================

#[tokio::test]
async fn test_unchanged_inputs_reuse_cached_value() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let calls = Arc::new(AtomicUsize::new(0));
    let eval = evaluator(&temp, counting_registry(calls.clone()));
    let cancel = CancelToken::new();

    let first = eval.evaluate("t.double", n_args(4), &progress(), &cancel).await.unwrap();
    let second = eval.evaluate("t.double", n_args(4), &progress(), &cancel).await.unwrap();

    assert_eq!(first.value, Some(Value::Number(8)));
    assert_eq!(second.value, first.value);
    assert_eq!(second.object_id_hash, first.object_id_hash);
    assert!(first.hash_changed);
    assert!(!second.hash_changed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(eval.cache().count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_argument_change_changes_hash() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let calls = Arc::new(AtomicUsize::new(0));
    let eval = evaluator(&temp, counting_registry(calls.clone()));
    let cancel = CancelToken::new();

    let one = eval.evaluate("t.double", n_args(1), &progress(), &cancel).await.unwrap();
    let two = eval.evaluate("t.double", n_args(2), &progress(), &cancel).await.unwrap();

    assert_ne!(one.object_id_hash, two.object_id_hash);
    assert!(one.hash_changed);
    assert!(two.hash_changed);
    assert_eq!(two.value, Some(Value::Number(4)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_deep_chain_does_not_exhaust_stack() {
    const DEPTH: i64 = 10_000;
    let temp = TempDir::new().expect("Failed to create temp dir");
    let mut registry = RuleRegistry::empty();
    registry.register(
        "t",
        "chain",
        rule_fn(|ctx| {
            let n = ctx.number_arg("n")?;
            if n == 0 {
                return Ok(RuleResult::value(Value::Number(0)));
            }
            Ok(RuleResult::eval_and_then("t.chain", n_args(n - 1), |value| {
                let below = value.as_number().unwrap_or(-1);
                Ok(RuleResult::value(Value::Number(below + 1)))
            }))
        }),
    );
    let eval = evaluator(&temp, registry);

    let evaluated = eval
        .evaluate("t.chain", n_args(DEPTH), &progress(), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(evaluated.value, Some(Value::Number(DEPTH)));
    assert_eq!(eval.cache().count().await.unwrap(), DEPTH as u64 + 1);
}

#[tokio::test]
async fn test_concurrent_requests_for_same_key_execute_once() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let calls = Arc::new(AtomicUsize::new(0));
    let eval = evaluator(&temp, counting_registry(calls.clone()));
    let cancel = CancelToken::new();
    let progress = progress();

    let results = futures::future::join_all((0..4).map(|_| eval.evaluate("t.slow", n_args(7), &progress, &cancel))).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        let evaluated = result.unwrap();
        assert_eq!(evaluated.value, Some(Value::Number(7)));
    }
    assert_eq!(eval.cache().count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_cancelled_evaluation_commits_nothing() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let calls = Arc::new(AtomicUsize::new(0));
    let eval = evaluator(&temp, counting_registry(calls));
    let cancel = CancelToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = eval
        .evaluate("t.slow", n_args(1), &progress(), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(eval.cache().count().await.unwrap(), 0);
}

// =============================================================================
// JVM Rule Tests
// =============================================================================

/// Stand-in compiler: creates `<dest>/Main.class` and logs each invocation
fn fake_compiler(dir: &Path) -> (PathBuf, PathBuf) {
    let script = dir.join("fakec");
    let log = dir.join("fakec.log");
    let body = format!(
        r#"#!/bin/sh
dest=""
while [ $# -gt 0 ]; do
  case "$1" in
    -d) dest="$2"; shift 2 ;;
    -cp) shift 2 ;;
    *) shift ;;
  esac
done
mkdir -p "$dest" && touch "$dest/Main.class"
echo "compiling into $dest"
echo "$dest" >> "{}"
"#,
        log.display()
    );
    fs::write(&script, body).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    (script, log)
}

fn compile_count(log: &Path) -> usize {
    fs::read_to_string(log).map(|s| s.lines().count()).unwrap_or(0)
}

#[tokio::test]
async fn test_compile_targets_through_manifest() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let tools = TempDir::new().expect("Failed to create temp dir");
    let (compiler, log) = fake_compiler(tools.path());

    fs::create_dir_all(temp.path().join("src/lib")).unwrap();
    fs::create_dir_all(temp.path().join("src/app")).unwrap();
    fs::write(temp.path().join("src/lib/Lib.java"), "class Lib {}").unwrap();
    fs::write(temp.path().join("src/app/Main.java"), "class Main {}").unwrap();
    let manifest = format!(
        r#"
imports:
  j: jvm
targets:
  lib:
    rule: j.compile
    args:
      srcs: {{glob: "src/lib/*.java"}}
      deps: {{set: []}}
      compiler: "{compiler}"
  app:
    rule: jvm.compile
    args:
      srcs: {{glob: "src/app/*.java"}}
      deps: {{set: [{{target: lib}}]}}
      compiler: "{compiler}"
"#,
        compiler = compiler.display()
    );
    fs::write(temp.path().join("kiln-build.yml"), manifest).unwrap();

    let engine = Engine::builder(temp.path()).in_memory_cache().open().unwrap();
    let executor = ActionExecutor::new(engine);

    let built = executor.build_target("app").await.unwrap();
    assert_eq!(compile_count(&log), 2);
    let pkg = ClassPkg::from_value(&built.value).unwrap();
    assert_eq!(pkg.deps.len(), 1);
    assert!(built.output_dir.join("Main.class").exists());

    // Unchanged inputs: nothing is recompiled
    let again = executor.build_target("app").await.unwrap();
    assert_eq!(again.object_id_hash, built.object_id_hash);
    assert_eq!(compile_count(&log), 2);

    // Editing a library source recompiles the library
    fs::write(temp.path().join("src/lib/Lib.java"), "class Lib { int x; }").unwrap();
    executor.build_target("lib").await.unwrap();
    assert_eq!(compile_count(&log), 3);
}

#[tokio::test]
async fn test_unresolvable_dependency_is_not_cached() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let (compiler, log) = fake_compiler(temp.path());
    let eval = evaluator(&temp, RuleRegistry::standard());

    let missing = temp.path().join("no-such-classes");
    let dep = ClassPkg::new(
        ClassOrigin::LocalLib { path: missing.clone() },
        CpInfo::Classes {
            class_dirs: vec![missing],
            res_dirs: Vec::new(),
            srcs: None,
        },
        ValueSet::new(),
    )
    .into_value();
    let args = Args::from([
        ("srcs".to_string(), Value::Set(ValueSet::new())),
        ("deps".to_string(), Value::set([dep])),
        ("compiler".to_string(), Value::string(compiler.to_string_lossy())),
    ]);

    let err = eval
        .evaluate("jvm.compile", args, &progress(), &CancelToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NestedEvaluationError");
    assert_eq!(err.root().kind(), "RuleExecutionError");
    assert!(err.to_string().contains("jvm.resolveClassPkgs"));
    assert_eq!(compile_count(&log), 0);
    assert_eq!(eval.cache().count().await.unwrap(), 0);
}

// =============================================================================
// Daemon Tests
// =============================================================================

const DAEMON_MANIFEST: &str = r#"
targets:
  four:
    rule: t.double
    args:
      n: 2
  slow:
    rule: t.slow
    args:
      n: 5
actions:
  hello:
    rule: shell.run
    args:
      command: [echo, hello-from-action]
  after-slow:
    rule: shell.run
    args:
      command: [echo, slow-done]
      after: {target: slow}
  sleeper:
    rule: shell.run
    args:
      command: [sleep, "30"]
"#;

/// Serve an engine over a socket in `temp`; returns the client and server task
async fn start_daemon(temp: &TempDir, calls: Arc<AtomicUsize>) -> (DaemonClient, tokio::task::JoinHandle<eyre::Result<()>>) {
    fs::write(temp.path().join("kiln-build.yml"), DAEMON_MANIFEST).unwrap();
    let mut registry = counting_registry(calls);
    kiln::plugins::register_builtins(&mut registry);
    let engine = Engine::builder(temp.path())
        .registry(registry)
        .in_memory_cache()
        .open()
        .unwrap();

    let socket = engine.repo().socket_path();
    let (listener, socket) = create_listener_at(&socket).unwrap();
    let server = DaemonServer::new(ActionExecutor::new(engine));
    let handle = tokio::spawn(server.run(listener));
    (DaemonClient::with_socket_path(socket), handle)
}

#[tokio::test]
async fn test_daemon_serves_requests_over_socket() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let calls = Arc::new(AtomicUsize::new(0));
    let (client, handle) = start_daemon(&temp, calls.clone()).await;

    assert_eq!(client.ping().await.unwrap(), VERSION);

    let info = client.repo_info().await.unwrap();
    assert_eq!(info.targets, vec!["four".to_string(), "slow".to_string()]);
    assert_eq!(
        info.actions,
        vec!["after-slow".to_string(), "hello".to_string(), "sleeper".to_string()]
    );
    assert!(info.rules.contains(&"shell.run".to_string()));

    let built = client.build_target("four").await.unwrap();
    assert_eq!(built.value, Value::Number(4));
    client.build_target("four").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let result = client.invoke_action("hello", Args::new()).await.unwrap();
    assert_eq!(result.action, "hello");
    assert_eq!(result.value, None);

    let err = client.build_target("nope").await.unwrap_err();
    let remote = err.downcast_ref::<RemoteError>().expect("remote error");
    assert!(remote.0.message.contains("nope"));

    client.shutdown().await.unwrap();
    let stopped = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(stopped.is_ok(), "Server should stop after Shutdown");
}

#[tokio::test]
async fn test_streaming_action_and_replay() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let (client, handle) = start_daemon(&temp, Arc::new(AtomicUsize::new(0))).await;

    let mut stream = client.stream_action("hello", Args::new(), false).await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = stream.next().await.unwrap() {
        events.push(event);
    }

    assert!(matches!(events.first(), Some(ActionEvent::Started { .. })));
    assert!(matches!(events.last(), Some(ActionEvent::Finished { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        ActionEvent::Output { line, stderr: false, .. } if line == "hello-from-action"
    )));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    // A finished run can still be observed; it replays to the same terminal event
    let run_id = events[0].run_id().to_string();
    let mut observed = client.observe_run(&run_id).await.unwrap();
    let mut last = None;
    while let Some(event) = observed.next().await.unwrap() {
        last = Some(event);
    }
    assert_eq!(last.as_ref(), events.last());

    assert!(client.cancel_run(&run_id).await.is_err());

    client.shutdown().await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

/// Observe `run_id` to its end; the last event
async fn last_event(client: &DaemonClient, run_id: &str) -> ActionEvent {
    let mut observed = client.observe_run(run_id).await.unwrap();
    let mut last = None;
    while let Some(event) = observed.next().await.unwrap() {
        last = Some(event);
    }
    last.expect("run produced no events")
}

/// Start `action` over a stream, keep only its first event, then hang up
async fn start_and_disconnect(client: &DaemonClient, action: &str, cancel_on_disconnect: bool) -> String {
    let mut stream = client.stream_action(action, Args::new(), cancel_on_disconnect).await.unwrap();
    let first = stream.next().await.unwrap().expect("run produced no events");
    assert!(matches!(first, ActionEvent::Started { .. }));
    drop(stream);
    first.run_id().to_string()
}

#[tokio::test]
async fn test_disconnect_leaves_unowned_run_running() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let calls = Arc::new(AtomicUsize::new(0));
    let (client, handle) = start_daemon(&temp, calls.clone()).await;

    let run_id = start_and_disconnect(&client, "after-slow", false).await;
    let last = tokio::time::timeout(Duration::from_secs(10), last_event(&client, &run_id))
        .await
        .expect("run should finish");
    assert!(matches!(last, ActionEvent::Finished { .. }), "unexpected {:?}", last);

    // The dependency was committed, so building it again runs nothing
    assert!(client.repo_info().await.unwrap().cached_objects.unwrap_or(0) >= 1);
    client.build_target("slow").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.shutdown().await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn test_disconnect_cancels_owned_run() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let calls = Arc::new(AtomicUsize::new(0));
    let (client, handle) = start_daemon(&temp, calls.clone()).await;

    let run_id = start_and_disconnect(&client, "after-slow", true).await;
    let last = tokio::time::timeout(Duration::from_secs(10), last_event(&client, &run_id))
        .await
        .expect("run should stop");
    match &last {
        ActionEvent::Failed { error, .. } => assert_eq!(error.kind, "Cancelled"),
        other => panic!("unexpected {:?}", other),
    }

    // Nothing was committed; the dependency runs again on the next build
    assert_eq!(client.repo_info().await.unwrap().cached_objects, Some(0));
    let before = calls.load(Ordering::SeqCst);
    client.build_target("slow").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), before + 1);

    client.shutdown().await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn test_disconnect_kills_running_command() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let (client, handle) = start_daemon(&temp, Arc::new(AtomicUsize::new(0))).await;

    let run_id = start_and_disconnect(&client, "sleeper", true).await;
    let last = tokio::time::timeout(Duration::from_secs(10), last_event(&client, &run_id))
        .await
        .expect("sleep should be killed well before it exits");
    match &last {
        ActionEvent::Failed { error, .. } => assert_eq!(error.kind, "Cancelled"),
        other => panic!("unexpected {:?}", other),
    }

    client.shutdown().await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

// =============================================================================
// CLI Tests
// =============================================================================

fn kd(data_home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("kd").unwrap();
    cmd.env("XDG_DATA_HOME", data_home).env("NO_COLOR", "1");
    cmd
}

#[test]
fn test_cli_help() {
    let data = TempDir::new().expect("Failed to create temp dir");
    kd(data.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("daemon"));
}

#[test]
fn test_cli_local_streaming_action() {
    let data = TempDir::new().expect("Failed to create temp dir");
    let project = TempDir::new().expect("Failed to create temp dir");
    fs::write(
        project.path().join("kiln-build.yml"),
        "actions:\n  hello:\n    rule: shell.run\n    args:\n      command: [echo, hi-from-kiln]\n",
    )
    .unwrap();

    kd(data.path())
        .arg("-p")
        .arg(project.path())
        .args(["run", "hello", "--local", "--stream"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hi-from-kiln"))
        .stdout(predicate::str::contains("finished"));
}

#[test]
fn test_cli_unknown_target_fails() {
    let data = TempDir::new().expect("Failed to create temp dir");
    let project = TempDir::new().expect("Failed to create temp dir");

    kd(data.path())
        .arg("-p")
        .arg(project.path())
        .args(["build", "missing", "--local"])
        .assert()
        .failure();
}

#[test]
fn test_cli_status_without_daemon() {
    let data = TempDir::new().expect("Failed to create temp dir");
    let project = TempDir::new().expect("Failed to create temp dir");

    kd(data.path())
        .arg("-p")
        .arg(project.path())
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stopped"));
}
