//! Project manifest: named targets and actions
//!
//! ```yaml
//! imports:
//!   j: jvm
//! targets:
//!   lib:
//!     rule: j.compile
//!     args:
//!       srcs: {glob: "src/lib/**/*.java"}
//!       deps: {set: []}
//!       compiler: javac
//!   app:
//!     rule: jvm.compile
//!     args:
//!       srcs: {glob: "src/app/**/*.java"}
//!       deps: {set: [{target: lib}]}
//!       compiler: javac
//! actions:
//!   hello:
//!     rule: shell.run
//!     args:
//!       command: [echo, hello]
//! ```
//!
//! Scalars map to bool, number and string values, sequences to lists. A
//! single-key mapping selects a typed value: `file`, `dir`, `path`, `set`,
//! `list`, `tuple`, `enum` ("Type.variant"), `record` ({type, fields}),
//! `glob` (set of matching files) or `target` (the built value of another
//! target). Relative paths are resolved against the project directory.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::Deserialize;
use serde_yaml::Value as Yaml;
use thiserror::Error;
use tracing::{debug, info};

use crate::value::{Args, Record, Value};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("target reference cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("invalid argument '{arg}' of {owner}: {message}")]
    InvalidArg { owner: String, arg: String, message: String },
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    imports: HashMap<String, String>,
    #[serde(default)]
    targets: BTreeMap<String, EntryFile>,
    #[serde(default)]
    actions: BTreeMap<String, EntryFile>,
}

#[derive(Debug, Deserialize)]
struct EntryFile {
    rule: String,
    #[serde(default)]
    args: BTreeMap<String, Yaml>,
}

/// Argument expression; target references and globs are resolved per build
#[derive(Debug, Clone)]
pub enum ArgExpr {
    Literal(Value),
    Glob(String),
    TargetRef(String),
    List(Vec<ArgExpr>),
    Set(Vec<ArgExpr>),
    Tuple(Vec<ArgExpr>),
    Record {
        type_name: String,
        fields: BTreeMap<String, ArgExpr>,
    },
}

/// A named target or action
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub rule: String,
    pub args: BTreeMap<String, ArgExpr>,
}

impl Entry {
    /// Targets this entry references directly, deduplicated
    pub fn deps(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<&ArgExpr> = self.args.values().collect();
        while let Some(expr) = stack.pop() {
            match expr {
                ArgExpr::TargetRef(name) => {
                    if !out.contains(name) {
                        out.push(name.clone());
                    }
                }
                ArgExpr::List(items) | ArgExpr::Set(items) | ArgExpr::Tuple(items) => stack.extend(items.iter()),
                ArgExpr::Record { fields, .. } => stack.extend(fields.values()),
                ArgExpr::Literal(_) | ArgExpr::Glob(_) => {}
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Manifest {
    path: Option<PathBuf>,
    project_dir: PathBuf,
    imports: HashMap<String, String>,
    targets: BTreeMap<String, Entry>,
    actions: BTreeMap<String, Entry>,
    loaded_at: DateTime<Utc>,
}

impl Manifest {
    /// Manifest with no targets, used when the project has no manifest file
    pub fn empty(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: None,
            project_dir: project_dir.into(),
            imports: HashMap::new(),
            targets: BTreeMap::new(),
            actions: BTreeMap::new(),
            loaded_at: Utc::now(),
        }
    }

    /// Load `path`; a missing file yields an empty manifest
    pub fn load(path: impl AsRef<Path>, project_dir: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let project_dir = project_dir.as_ref();
        debug!(?path, "Manifest::load: called");

        if !path.exists() {
            info!(?path, "Manifest::load: no manifest, starting with an empty target graph");
            return Ok(Self::empty(project_dir));
        }
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let mut manifest =
            Self::parse(&content, project_dir).with_context(|| format!("Failed to load {}", path.display()))?;
        manifest.path = Some(path.to_path_buf());
        info!(
            targets = manifest.targets.len(),
            actions = manifest.actions.len(),
            "Manifest::load: loaded"
        );
        Ok(manifest)
    }

    /// Parse manifest text, validating references
    pub fn parse(content: &str, project_dir: impl AsRef<Path>) -> Result<Self> {
        let project_dir = project_dir.as_ref();
        let file: ManifestFile = serde_yaml::from_str(content).context("Failed to parse manifest YAML")?;

        let convert = |entries: BTreeMap<String, EntryFile>| -> Result<BTreeMap<String, Entry>> {
            entries
                .into_iter()
                .map(|(name, entry)| -> Result<(String, Entry)> {
                    let mut args = BTreeMap::new();
                    for (arg, yaml) in entry.args {
                        let expr = parse_arg(&yaml, project_dir).map_err(|message| ManifestError::InvalidArg {
                            owner: name.clone(),
                            arg: arg.clone(),
                            message,
                        })?;
                        args.insert(arg, expr);
                    }
                    let entry = Entry {
                        name: name.clone(),
                        rule: entry.rule,
                        args,
                    };
                    Ok((name, entry))
                })
                .collect()
        };

        let manifest = Self {
            path: None,
            project_dir: project_dir.to_path_buf(),
            imports: file.imports,
            targets: convert(file.targets)?,
            actions: convert(file.actions)?,
            loaded_at: Utc::now(),
        };
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        for entry in self.targets.values().chain(self.actions.values()) {
            for dep in entry.deps() {
                if !self.targets.contains_key(&dep) {
                    return Err(ManifestError::UnknownTarget(dep));
                }
            }
        }
        validate_dependency_graph(&self.targets)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn imports(&self) -> &HashMap<String, String> {
        &self.imports
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn target(&self, name: &str) -> Result<&Entry, ManifestError> {
        self.targets
            .get(name)
            .ok_or_else(|| ManifestError::UnknownTarget(name.to_string()))
    }

    pub fn action(&self, name: &str) -> Result<&Entry, ManifestError> {
        self.actions
            .get(name)
            .ok_or_else(|| ManifestError::UnknownAction(name.to_string()))
    }

    pub fn target_names(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    pub fn action_names(&self) -> Vec<String> {
        self.actions.keys().cloned().collect()
    }

    /// Targets to build before `entry`, dependencies first
    pub fn plan(&self, entry: &Entry) -> Vec<String> {
        debug!(entry = %entry.name, "Manifest::plan: called");
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        for dep in entry.deps() {
            self.topo_visit(&dep, &mut visited, &mut order);
        }
        order
    }

    /// Iterative post-order walk over target references
    fn topo_visit(&self, root: &str, visited: &mut HashSet<String>, order: &mut Vec<String>) {
        let mut stack: Vec<(String, bool)> = vec![(root.to_string(), false)];
        while let Some((name, expanded)) = stack.pop() {
            if expanded {
                order.push(name);
                continue;
            }
            if !visited.insert(name.clone()) {
                continue;
            }
            let deps = self.targets.get(&name).map(Entry::deps).unwrap_or_default();
            stack.push((name, true));
            for dep in deps.into_iter().rev() {
                if !visited.contains(&dep) {
                    stack.push((dep, false));
                }
            }
        }
    }

    /// Evaluate the argument expressions of `entry`
    ///
    /// `built` holds the values of every target in [`Manifest::plan`].
    pub fn resolve_args(&self, entry: &Entry, built: &HashMap<String, Value>) -> Result<Args, ManifestError> {
        entry
            .args
            .iter()
            .map(|(arg, expr)| {
                resolve(expr, built, &self.project_dir)
                    .map(|value| (arg.clone(), value))
                    .map_err(|message| ManifestError::InvalidArg {
                        owner: entry.name.clone(),
                        arg: arg.clone(),
                        message,
                    })
            })
            .collect()
    }
}

/// Reject cycles among target references, returning the offending path
pub fn validate_dependency_graph(targets: &BTreeMap<String, Entry>) -> Result<(), ManifestError> {
    debug!(count = targets.len(), "validate_dependency_graph: called");
    let mut visited: HashSet<&str> = HashSet::new();

    for root in targets.keys() {
        if visited.contains(root.as_str()) {
            continue;
        }
        // (node, next dep index) with an explicit recursion stack
        let mut path: Vec<(&str, Vec<String>, usize)> = Vec::new();
        let mut on_path: HashSet<&str> = HashSet::new();
        visited.insert(root.as_str());
        on_path.insert(root.as_str());
        path.push((root.as_str(), targets[root].deps(), 0));

        while let Some((node, deps, next)) = path.last_mut() {
            let Some(dep) = deps.get(*next).cloned() else {
                on_path.remove(*node);
                path.pop();
                continue;
            };
            *next += 1;
            let Some((dep_name, dep_entry)) = targets.get_key_value(&dep) else {
                continue;
            };
            if on_path.contains(dep_name.as_str()) {
                let start = path.iter().position(|(n, _, _)| *n == dep_name.as_str()).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|(n, _, _)| n.to_string()).collect();
                cycle.push(dep_name.clone());
                debug!(?cycle, "validate_dependency_graph: cycle detected");
                return Err(ManifestError::Cycle(cycle));
            }
            if visited.insert(dep_name.as_str()) {
                on_path.insert(dep_name.as_str());
                path.push((dep_name.as_str(), dep_entry.deps(), 0));
            }
        }
    }

    debug!("validate_dependency_graph: no cycles found");
    Ok(())
}

fn absolute(path: &str, project_dir: &Path) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    }
}

fn parse_arg(yaml: &Yaml, project_dir: &Path) -> Result<ArgExpr, String> {
    match yaml {
        Yaml::Null => Ok(ArgExpr::Literal(Value::None)),
        Yaml::Bool(b) => Ok(ArgExpr::Literal(Value::Bool(*b))),
        Yaml::Number(n) => n
            .as_i64()
            .map(|n| ArgExpr::Literal(Value::Number(n)))
            .ok_or_else(|| format!("only integers are supported, got {}", n)),
        Yaml::String(s) => Ok(ArgExpr::Literal(Value::String(s.clone()))),
        Yaml::Sequence(items) => Ok(ArgExpr::List(parse_items(items, project_dir)?)),
        Yaml::Mapping(map) => {
            if map.len() != 1 {
                return Err("typed values are single-key mappings such as {file: path}".to_string());
            }
            let Some((Yaml::String(tag), inner)) = map.iter().next() else {
                return Err("typed value key must be a string".to_string());
            };
            parse_tagged(tag, inner, project_dir)
        }
        Yaml::Tagged(tagged) => parse_arg(&tagged.value, project_dir),
    }
}

fn parse_items(items: &[Yaml], project_dir: &Path) -> Result<Vec<ArgExpr>, String> {
    items.iter().map(|item| parse_arg(item, project_dir)).collect()
}

fn expect_str<'a>(tag: &str, yaml: &'a Yaml) -> Result<&'a str, String> {
    yaml.as_str().ok_or_else(|| format!("{{{}: ...}} expects a string", tag))
}

fn expect_seq<'a>(tag: &str, yaml: &'a Yaml) -> Result<&'a [Yaml], String> {
    yaml.as_sequence()
        .map(Vec::as_slice)
        .ok_or_else(|| format!("{{{}: ...}} expects a sequence", tag))
}

fn parse_tagged(tag: &str, inner: &Yaml, project_dir: &Path) -> Result<ArgExpr, String> {
    match tag {
        "file" => Ok(ArgExpr::Literal(Value::file(absolute(expect_str(tag, inner)?, project_dir)))),
        "dir" => Ok(ArgExpr::Literal(Value::dir(absolute(expect_str(tag, inner)?, project_dir)))),
        "path" => Ok(ArgExpr::Literal(Value::path(absolute(expect_str(tag, inner)?, project_dir)))),
        "glob" => Ok(ArgExpr::Glob(expect_str(tag, inner)?.to_string())),
        "target" => Ok(ArgExpr::TargetRef(expect_str(tag, inner)?.to_string())),
        "list" => Ok(ArgExpr::List(parse_items(expect_seq(tag, inner)?, project_dir)?)),
        "set" => Ok(ArgExpr::Set(parse_items(expect_seq(tag, inner)?, project_dir)?)),
        "tuple" => Ok(ArgExpr::Tuple(parse_items(expect_seq(tag, inner)?, project_dir)?)),
        "enum" => {
            let text = expect_str(tag, inner)?;
            let (type_name, variant) = text
                .rsplit_once('.')
                .ok_or_else(|| format!("enum value '{}' must look like Type.variant", text))?;
            Ok(ArgExpr::Literal(Value::enumeration(type_name, variant)))
        }
        "record" => {
            let type_name = inner
                .get("type")
                .and_then(Yaml::as_str)
                .ok_or_else(|| "{record: ...} needs a string 'type'".to_string())?;
            let mut fields = BTreeMap::new();
            if let Some(map) = inner.get("fields").and_then(Yaml::as_mapping) {
                for (name, value) in map {
                    let name = name.as_str().ok_or_else(|| "record field names must be strings".to_string())?;
                    fields.insert(name.to_string(), parse_arg(value, project_dir)?);
                }
            }
            Ok(ArgExpr::Record {
                type_name: type_name.to_string(),
                fields,
            })
        }
        other => Err(format!("unknown value type '{}'", other)),
    }
}

fn resolve(expr: &ArgExpr, built: &HashMap<String, Value>, project_dir: &Path) -> Result<Value, String> {
    match expr {
        ArgExpr::Literal(value) => Ok(value.clone()),
        ArgExpr::TargetRef(name) => built
            .get(name)
            .cloned()
            .ok_or_else(|| format!("target '{}' has not been built", name)),
        ArgExpr::Glob(pattern) => {
            let full = absolute(pattern, project_dir);
            let matches = glob::glob(&full.to_string_lossy()).map_err(|e| format!("bad glob '{}': {}", pattern, e))?;
            let mut files: Vec<PathBuf> = matches.filter_map(|m| m.ok()).filter(|p| p.is_file()).collect();
            files.sort();
            Ok(Value::set(files.into_iter().map(Value::File)))
        }
        ArgExpr::List(items) => Ok(Value::List(resolve_items(items, built, project_dir)?)),
        ArgExpr::Set(items) => Ok(Value::set(resolve_items(items, built, project_dir)?)),
        ArgExpr::Tuple(items) => Ok(Value::Tuple(resolve_items(items, built, project_dir)?)),
        ArgExpr::Record { type_name, fields } => {
            let mut record = Record::new(type_name.clone());
            for (name, field) in fields {
                record.fields.insert(name.clone(), resolve(field, built, project_dir)?);
            }
            Ok(Value::Record(record))
        }
    }
}

fn resolve_items(items: &[ArgExpr], built: &HashMap<String, Value>, project_dir: &Path) -> Result<Vec<Value>, String> {
    items.iter().map(|item| resolve(item, built, project_dir)).collect()
}
