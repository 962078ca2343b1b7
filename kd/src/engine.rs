//! Process-wide build state
//!
//! One [`Engine`] per project and process. It owns the repository lock, the
//! cache actor, the evaluator, the current target graph and the event bus.
//! Everything is set up in [`EngineBuilder::open`] and released on drop.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use kilnstore::RepoLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheManager;
use crate::config::Config;
use crate::eval::Evaluator;
use crate::events::{EventBus, spawn_event_logger};
use crate::manifest::Manifest;
use crate::repo::Repo;
use crate::rule::RuleRegistry;

/// Version reported to clients
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Metadata about the project, no evaluation involved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub project_dir: PathBuf,
    pub repo_dir: PathBuf,
    /// Manifest file, absent when the project has none
    pub manifest: Option<PathBuf>,
    pub manifest_loaded_at: DateTime<Utc>,
    pub targets: Vec<String>,
    pub actions: Vec<String>,
    pub rules: Vec<String>,
    /// `None` when the cache could not be queried
    pub cached_objects: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub version: String,
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    project_dir: PathBuf,
    config: Config,
    registry: Option<RuleRegistry>,
    in_memory_cache: bool,
}

impl EngineBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use `registry` instead of the built-in rules
    pub fn registry(mut self, registry: RuleRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Keep cache records in memory only (for testing)
    pub fn in_memory_cache(mut self) -> Self {
        self.in_memory_cache = true;
        self
    }

    /// Lock the repository and start the cache actor and event logger
    ///
    /// Must be called from within a tokio runtime. Fails if another process
    /// holds the repository.
    pub fn open(self) -> Result<Arc<Engine>> {
        debug!(project_dir = ?self.project_dir, "EngineBuilder::open: called");
        let config = self.config;
        let repo = Repo::open(&self.project_dir, &config.project.repo_dir)?;
        let lock = RepoLock::acquire(repo.root())?;

        let cache = if self.in_memory_cache {
            CacheManager::spawn_in_memory()?
        } else {
            CacheManager::spawn(repo.cache_path()).context("Failed to open cache")?
        };

        let manifest_path = repo.project_dir().join(&config.project.manifest);
        let manifest = Manifest::load(&manifest_path, repo.project_dir())?;

        let registry = self.registry.unwrap_or_else(RuleRegistry::standard);
        registry.set_imports(manifest.imports().clone());

        let evaluator = Evaluator::new(
            Arc::new(registry),
            cache,
            repo.clone(),
            config.concurrency.max_parallelism,
        );
        let bus = Arc::new(EventBus::new(config.events.channel_capacity));
        let logger = spawn_event_logger(Arc::clone(&bus), repo.runs_dir());

        info!(
            project_dir = %repo.project_dir().display(),
            targets = manifest.target_names().len(),
            actions = manifest.action_names().len(),
            "Engine opened"
        );

        Ok(Arc::new(Engine {
            config,
            repo,
            manifest_path,
            manifest: RwLock::new(Arc::new(manifest)),
            evaluator: Arc::new(evaluator),
            bus,
            logger,
            started_at: Utc::now(),
            _lock: lock,
        }))
    }
}

/// Evaluator, cache and target graph of one project
pub struct Engine {
    config: Config,
    repo: Repo,
    manifest_path: PathBuf,
    manifest: RwLock<Arc<Manifest>>,
    evaluator: Arc<Evaluator>,
    bus: Arc<EventBus>,
    logger: JoinHandle<()>,
    started_at: DateTime<Utc>,
    _lock: RepoLock,
}

impl Engine {
    pub fn builder(project_dir: impl AsRef<Path>) -> EngineBuilder {
        EngineBuilder {
            project_dir: project_dir.as_ref().to_path_buf(),
            config: Config::default(),
            registry: None,
            in_memory_cache: false,
        }
    }

    /// Open with the built-in rules and a persistent cache
    pub fn open(project_dir: impl AsRef<Path>, config: Config) -> Result<Arc<Self>> {
        Self::builder(project_dir).config(config).open()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    pub fn evaluator(&self) -> &Arc<Evaluator> {
        &self.evaluator
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Current target graph
    pub fn manifest(&self) -> Arc<Manifest> {
        match self.manifest.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Re-read the manifest file
    ///
    /// On failure the previous graph stays in place and the error is returned.
    /// Runs already in progress keep the graph they started with.
    pub fn reload(&self) -> Result<()> {
        debug!(path = ?self.manifest_path, "Engine::reload: called");
        let manifest = Manifest::load(&self.manifest_path, self.repo.project_dir()).inspect_err(|e| {
            warn!(error = %e, "Engine::reload: keeping previous manifest");
        })?;
        self.evaluator.registry().set_imports(manifest.imports().clone());

        let mut guard = match self.manifest.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(manifest);
        info!("Engine::reload: manifest reloaded");
        Ok(())
    }

    pub async fn repo_info(&self) -> RepoInfo {
        debug!("Engine::repo_info: called");
        let manifest = self.manifest();
        let cached_objects = match self.evaluator.cache().count().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Engine::repo_info: cache count failed");
                None
            }
        };

        RepoInfo {
            project_dir: self.repo.project_dir().to_path_buf(),
            repo_dir: self.repo.root().to_path_buf(),
            manifest: manifest.path().map(Path::to_path_buf),
            manifest_loaded_at: manifest.loaded_at(),
            targets: manifest.target_names(),
            actions: manifest.action_names(),
            rules: self.evaluator.registry().names(),
            cached_objects,
            started_at: self.started_at,
            version: VERSION.to_string(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        debug!("Engine::drop: stopping event logger");
        self.logger.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"
imports:
  j: jvm
targets:
  lib:
    rule: j.compile
    args:
      srcs: {set: []}
      deps: {set: []}
      compiler: javac
actions:
  hello:
    rule: shell.run
    args:
      command: [echo, hello]
"#;

    #[tokio::test]
    async fn test_open_without_manifest() {
        let temp = TempDir::new().unwrap();
        let engine = Engine::open(temp.path(), Config::default()).unwrap();

        let info = engine.repo_info().await;
        assert!(info.manifest.is_none());
        assert!(info.targets.is_empty());
        assert!(info.rules.contains(&"jvm.compile".to_string()));
        assert_eq!(info.cached_objects, Some(0));
        assert_eq!(info.version, VERSION);
        assert!(engine.repo().root().join("kiln.lock").exists());
    }

    #[tokio::test]
    async fn test_second_engine_on_same_repo_fails() {
        let temp = TempDir::new().unwrap();
        let _engine = Engine::open(temp.path(), Config::default()).unwrap();
        assert!(Engine::open(temp.path(), Config::default()).is_err());
    }

    #[tokio::test]
    async fn test_reload_picks_up_manifest() {
        let temp = TempDir::new().unwrap();
        let engine = Engine::open(temp.path(), Config::default()).unwrap();
        assert!(engine.manifest().target_names().is_empty());

        fs::write(temp.path().join("kiln-build.yml"), MANIFEST).unwrap();
        engine.reload().unwrap();

        let info = engine.repo_info().await;
        assert_eq!(info.targets, vec!["lib".to_string()]);
        assert_eq!(info.actions, vec!["hello".to_string()]);
        let (name, _) = engine.evaluator().registry().resolve("j.compile").unwrap();
        assert_eq!(name, "jvm.compile");
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_previous_graph() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("kiln-build.yml"), MANIFEST).unwrap();
        let engine = Engine::open(temp.path(), Config::default()).unwrap();

        fs::write(temp.path().join("kiln-build.yml"), "targets: [not, a, map]").unwrap();
        assert!(engine.reload().is_err());
        assert_eq!(engine.manifest().target_names(), vec!["lib".to_string()]);
    }
}
