//! ClassPkg record conventions for JVM builds
//!
//! A ClassPkg is a record `jvm.ClassPkg{origin, cpinfo, deps}` where `deps` is
//! a set of ClassPkg records. The Rust types here are shallow views: `deps`
//! stays a [`ValueSet`] so converting a package never walks its whole closure.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::rule::BuildError;

use super::{Record, Value, ValueSet};

pub const CLASS_PKG: &str = "jvm.ClassPkg";
pub const LOCAL_BUILT: &str = "jvm.LocalBuilt";
pub const LOCAL_LIB: &str = "jvm.LocalLib";
pub const MAVEN_DEP: &str = "jvm.MavenDep";
pub const JAR_INFO: &str = "jvm.JarInfo";
pub const CLASSES_INFO: &str = "jvm.ClassesInfo";
pub const CLASS_PATHS: &str = "jvm.ClassPaths";

/// Where a package's classes came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassOrigin {
    /// Produced by a rule of this engine
    LocalBuilt { obj_hash: String, builder_name: String },
    /// Prebuilt library checked into the project
    LocalLib { path: PathBuf },
    /// Artifact resolved from a Maven repository
    MavenDep {
        repo: String,
        group: String,
        artifact: String,
        version: String,
    },
}

/// Classpath contents of a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpInfo {
    Jar {
        jar: PathBuf,
        source_jar: Option<PathBuf>,
    },
    Classes {
        class_dirs: Vec<PathBuf>,
        res_dirs: Vec<PathBuf>,
        srcs: Option<Vec<PathBuf>>,
    },
}

/// A compiled unit plus its dependency packages
#[derive(Debug, Clone)]
pub struct ClassPkg {
    pub origin: ClassOrigin,
    pub cpinfo: CpInfo,
    pub deps: ValueSet,
}

/// One package of a dependency closure, without its deps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassEntry {
    pub origin: ClassOrigin,
    pub cpinfo: CpInfo,
}

/// Resolved classpath
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassPaths {
    pub cps: Vec<PathBuf>,
}

fn field<'a>(record: &'a Record, name: &str) -> Result<&'a Value, BuildError> {
    record
        .get(name)
        .ok_or_else(|| BuildError::argument(format!("{} is missing field '{}'", record.type_name, name)))
}

fn string_field(record: &Record, name: &str) -> Result<String, BuildError> {
    let value = field(record, name)?;
    value.as_str().map(str::to_string).ok_or_else(|| {
        BuildError::argument(format!(
            "{}.{} must be a string, got {}",
            record.type_name,
            name,
            value.kind()
        ))
    })
}

fn path_field(record: &Record, name: &str) -> Result<PathBuf, BuildError> {
    let value = field(record, name)?;
    value.as_path().map(Path::to_path_buf).ok_or_else(|| {
        BuildError::argument(format!(
            "{}.{} must be a path, got {}",
            record.type_name,
            name,
            value.kind()
        ))
    })
}

fn optional_path_field(record: &Record, name: &str) -> Result<Option<PathBuf>, BuildError> {
    match record.get(name) {
        None | Some(Value::None) => Ok(None),
        Some(_) => path_field(record, name).map(Some),
    }
}

fn paths_of(record: &Record, name: &str, value: &Value) -> Result<Vec<PathBuf>, BuildError> {
    let set = value.as_set().ok_or_else(|| {
        BuildError::argument(format!(
            "{}.{} must be a set, got {}",
            record.type_name,
            name,
            value.kind()
        ))
    })?;
    collect_paths(record, name, set.iter())
}

/// Like `paths_of` for a list field, keeping its order
fn ordered_paths_of(record: &Record, name: &str, value: &Value) -> Result<Vec<PathBuf>, BuildError> {
    let items = value.as_list().ok_or_else(|| {
        BuildError::argument(format!(
            "{}.{} must be a list, got {}",
            record.type_name,
            name,
            value.kind()
        ))
    })?;
    collect_paths(record, name, items.iter())
}

fn collect_paths<'a>(
    record: &Record,
    name: &str,
    items: impl Iterator<Item = &'a Value>,
) -> Result<Vec<PathBuf>, BuildError> {
    items
        .map(|item| {
            item.as_path().map(Path::to_path_buf).ok_or_else(|| {
                BuildError::argument(format!(
                    "{}.{} must contain paths, found {}",
                    record.type_name,
                    name,
                    item.kind()
                ))
            })
        })
        .collect()
}

fn expect_record<'a>(value: &'a Value, what: &str) -> Result<&'a Record, BuildError> {
    value
        .as_record()
        .ok_or_else(|| BuildError::argument(format!("expected {} record, got {}", what, value.kind())))
}

impl ClassOrigin {
    pub fn to_value(&self) -> Value {
        let record = match self {
            ClassOrigin::LocalBuilt { obj_hash, builder_name } => Record::new(LOCAL_BUILT)
                .with("objHash", Value::string(obj_hash))
                .with("builderName", Value::string(builder_name)),
            ClassOrigin::LocalLib { path } => Record::new(LOCAL_LIB).with("path", Value::file(path)),
            ClassOrigin::MavenDep {
                repo,
                group,
                artifact,
                version,
            } => Record::new(MAVEN_DEP)
                .with("repo", Value::string(repo))
                .with("group", Value::string(group))
                .with("artifact", Value::string(artifact))
                .with("version", Value::string(version)),
        };
        Value::Record(record)
    }

    pub fn from_value(value: &Value) -> Result<Self, BuildError> {
        let record = expect_record(value, "class origin")?;
        match record.type_name.as_str() {
            LOCAL_BUILT => Ok(ClassOrigin::LocalBuilt {
                obj_hash: string_field(record, "objHash")?,
                builder_name: string_field(record, "builderName")?,
            }),
            LOCAL_LIB => Ok(ClassOrigin::LocalLib {
                path: path_field(record, "path")?,
            }),
            MAVEN_DEP => Ok(ClassOrigin::MavenDep {
                repo: string_field(record, "repo")?,
                group: string_field(record, "group")?,
                artifact: string_field(record, "artifact")?,
                version: string_field(record, "version")?,
            }),
            other => Err(BuildError::argument(format!("unknown class origin type {}", other))),
        }
    }

    /// Short human label
    pub fn label(&self) -> String {
        match self {
            ClassOrigin::LocalBuilt { obj_hash, builder_name } => {
                format!("{}@{}", builder_name, obj_hash.chars().take(12).collect::<String>())
            }
            ClassOrigin::LocalLib { path } => path.display().to_string(),
            ClassOrigin::MavenDep {
                group,
                artifact,
                version,
                ..
            } => format!("{}:{}:{}", group, artifact, version),
        }
    }
}

impl CpInfo {
    pub fn to_value(&self) -> Value {
        let record = match self {
            CpInfo::Jar { jar, source_jar } => Record::new(JAR_INFO).with("jar", Value::file(jar)).with(
                "sourceJar",
                source_jar.as_ref().map(Value::file).unwrap_or(Value::None),
            ),
            CpInfo::Classes {
                class_dirs,
                res_dirs,
                srcs,
            } => Record::new(CLASSES_INFO)
                .with("classDirs", Value::set(class_dirs.iter().map(Value::dir)))
                .with("resDirs", Value::set(res_dirs.iter().map(Value::dir)))
                .with(
                    "srcs",
                    srcs.as_ref()
                        .map(|s| Value::set(s.iter().map(Value::file)))
                        .unwrap_or(Value::None),
                ),
        };
        Value::Record(record)
    }

    pub fn from_value(value: &Value) -> Result<Self, BuildError> {
        let record = expect_record(value, "cpinfo")?;
        match record.type_name.as_str() {
            JAR_INFO => Ok(CpInfo::Jar {
                jar: path_field(record, "jar")?,
                source_jar: optional_path_field(record, "sourceJar")?,
            }),
            CLASSES_INFO => {
                let srcs = match record.get("srcs") {
                    None | Some(Value::None) => None,
                    Some(v) => Some(paths_of(record, "srcs", v)?),
                };
                Ok(CpInfo::Classes {
                    class_dirs: paths_of(record, "classDirs", field(record, "classDirs")?)?,
                    res_dirs: paths_of(record, "resDirs", field(record, "resDirs")?)?,
                    srcs,
                })
            }
            other => Err(BuildError::argument(format!("unknown cpinfo type {}", other))),
        }
    }

    /// Paths this package contributes to a classpath
    pub fn classpath_entries(&self) -> Vec<&Path> {
        match self {
            CpInfo::Jar { jar, .. } => vec![jar.as_path()],
            CpInfo::Classes {
                class_dirs, res_dirs, ..
            } => class_dirs.iter().chain(res_dirs.iter()).map(PathBuf::as_path).collect(),
        }
    }
}

impl ClassPkg {
    pub fn new(origin: ClassOrigin, cpinfo: CpInfo, deps: ValueSet) -> Self {
        Self { origin, cpinfo, deps }
    }

    /// Convert into a `jvm.ClassPkg` record value
    pub fn into_value(self) -> Value {
        Value::Record(
            Record::new(CLASS_PKG)
                .with("origin", self.origin.to_value())
                .with("cpinfo", self.cpinfo.to_value())
                .with("deps", Value::Set(self.deps)),
        )
    }

    /// Parse a `jvm.ClassPkg` record; `deps` members are not parsed
    pub fn from_value(value: &Value) -> Result<Self, BuildError> {
        let (entry, deps) = parse_head(value)?;
        Ok(Self {
            origin: entry.origin,
            cpinfo: entry.cpinfo,
            deps: deps.clone(),
        })
    }

    /// Identity used for cycle detection: origin plus cpinfo
    pub fn identity(&self) -> Vec<u8> {
        identity_of(&self.origin, &self.cpinfo)
    }
}

fn identity_of(origin: &ClassOrigin, cpinfo: &CpInfo) -> Vec<u8> {
    Value::Tuple(vec![origin.to_value(), cpinfo.to_value()]).canonical_bytes()
}

fn parse_head(value: &Value) -> Result<(ClassEntry, &ValueSet), BuildError> {
    let record = expect_record(value, CLASS_PKG)?;
    if record.type_name != CLASS_PKG {
        return Err(BuildError::argument(format!(
            "expected {} record, got {}",
            CLASS_PKG, record.type_name
        )));
    }
    let deps_value = field(record, "deps")?;
    let deps = deps_value
        .as_set()
        .ok_or_else(|| BuildError::argument(format!("{}.deps must be a set, got {}", CLASS_PKG, deps_value.kind())))?;
    let entry = ClassEntry {
        origin: ClassOrigin::from_value(field(record, "origin")?)?,
        cpinfo: CpInfo::from_value(field(record, "cpinfo")?)?,
    };
    Ok((entry, deps))
}

/// Every package reachable from `roots`, each once, in first-visit order
///
/// Fails with [`BuildError::Cycle`] if a package identity reappears among its
/// own transitive deps.
pub fn closure(roots: &ValueSet) -> Result<Vec<ClassEntry>, BuildError> {
    enum Visit<'a> {
        Enter(&'a Value),
        Exit(Vec<u8>),
    }

    let mut order = Vec::new();
    let mut on_path: HashSet<Vec<u8>> = HashSet::new();
    let mut finished: HashSet<Vec<u8>> = HashSet::new();
    let mut trail: Vec<String> = Vec::new();
    let mut stack: Vec<Visit<'_>> = roots.iter().rev().map(Visit::Enter).collect();

    while let Some(visit) = stack.pop() {
        match visit {
            Visit::Enter(value) => {
                let (entry, deps) = parse_head(value)?;
                let id = identity_of(&entry.origin, &entry.cpinfo);
                if on_path.contains(&id) {
                    let mut cycle = trail.clone();
                    cycle.push(entry.origin.label());
                    return Err(BuildError::Cycle(cycle));
                }
                if finished.contains(&id) {
                    continue;
                }
                on_path.insert(id.clone());
                trail.push(entry.origin.label());
                stack.push(Visit::Exit(id));
                stack.extend(deps.iter().rev().map(Visit::Enter));
                order.push(entry);
            }
            Visit::Exit(id) => {
                on_path.remove(&id);
                trail.pop();
                finished.insert(id);
            }
        }
    }
    Ok(order)
}

impl ClassPaths {
    pub fn to_value(&self) -> Value {
        Value::Record(Record::new(CLASS_PATHS).with("cps", Value::list(self.cps.iter().map(Value::path))))
    }

    pub fn from_value(value: &Value) -> Result<Self, BuildError> {
        let record = expect_record(value, CLASS_PATHS)?;
        Ok(Self {
            cps: ordered_paths_of(record, "cps", field(record, "cps")?)?,
        })
    }

    /// `:`-joined classpath string
    pub fn joined(&self) -> String {
        self.cps
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lib(path: &str, deps: Vec<Value>) -> Value {
        ClassPkg::new(
            ClassOrigin::LocalLib { path: PathBuf::from(path) },
            CpInfo::Jar {
                jar: PathBuf::from(path),
                source_jar: None,
            },
            deps.into_iter().collect(),
        )
        .into_value()
    }

    #[test]
    fn test_classpkg_value_conversion() {
        let pkg = ClassPkg::new(
            ClassOrigin::LocalBuilt {
                obj_hash: "abc123".to_string(),
                builder_name: "jvm.compile".to_string(),
            },
            CpInfo::Classes {
                class_dirs: vec![PathBuf::from("/out")],
                res_dirs: vec![],
                srcs: Some(vec![PathBuf::from("a.kt"), PathBuf::from("b.kt")]),
            },
            ValueSet::new(),
        );
        let value = pkg.clone().into_value();
        let record = value.as_record_of(CLASS_PKG).unwrap();
        assert_eq!(
            record.get("cpinfo").unwrap().as_record().unwrap().type_name,
            CLASSES_INFO
        );

        let back = ClassPkg::from_value(&value).unwrap();
        assert_eq!(back.origin, pkg.origin);
        assert_eq!(back.cpinfo, pkg.cpinfo);
        assert!(back.deps.is_empty());
    }

    #[test]
    fn test_wrong_record_type_is_argument_error() {
        let value = Value::Record(Record::new("jvm.Other"));
        let err = ClassPkg::from_value(&value).unwrap_err();
        assert_eq!(err.kind(), "ArgumentError");

        let err = ClassPkg::from_value(&Value::from("nope")).unwrap_err();
        assert!(err.to_string().contains("got string"));
    }

    #[test]
    fn test_closure_visits_each_package_once() {
        let shared = lib("/libs/shared.jar", vec![]);
        let a = lib("/libs/a.jar", vec![shared.clone()]);
        let b = lib("/libs/b.jar", vec![shared.clone()]);
        let roots: ValueSet = vec![a, b].into_iter().collect();

        let entries = closure(&roots).unwrap();
        let jars: Vec<_> = entries.iter().flat_map(|e| e.cpinfo.classpath_entries()).collect();
        assert_eq!(
            jars,
            vec![
                Path::new("/libs/a.jar"),
                Path::new("/libs/shared.jar"),
                Path::new("/libs/b.jar")
            ]
        );
    }

    #[test]
    fn test_closure_rejects_identity_cycle() {
        let inner = lib("/libs/a.jar", vec![]);
        let middle = lib("/libs/b.jar", vec![inner]);
        let outer = lib("/libs/a.jar", vec![middle]);
        let roots: ValueSet = vec![outer].into_iter().collect();

        match closure(&roots) {
            Err(BuildError::Cycle(trail)) => {
                assert_eq!(trail, vec!["/libs/a.jar", "/libs/b.jar", "/libs/a.jar"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_closure_handles_deep_chain() {
        let mut pkg = lib("/libs/0.jar", vec![]);
        for i in 1..5_000 {
            pkg = lib(&format!("/libs/{}.jar", i), vec![pkg]);
        }
        let roots: ValueSet = vec![pkg].into_iter().collect();
        assert_eq!(closure(&roots).unwrap().len(), 5_000);
    }

    #[test]
    fn test_class_paths_joined() {
        let cps = ClassPaths {
            cps: vec![PathBuf::from("/a"), PathBuf::from("/b.jar")],
        };
        let back = ClassPaths::from_value(&cps.to_value()).unwrap();
        assert_eq!(back.cps.len(), 2);
        assert_eq!(cps.joined(), "/a:/b.jar");
    }

    #[test]
    fn test_class_paths_keep_resolution_order() {
        // Deliberately not sorted; the first entry must win on the classpath
        let cps = ClassPaths {
            cps: vec![PathBuf::from("/z/first.jar"), PathBuf::from("/m/second"), PathBuf::from("/a/third.jar")],
        };
        let back = ClassPaths::from_value(&cps.to_value()).unwrap();
        assert_eq!(back.cps, cps.cps);
        assert_eq!(back.joined(), "/z/first.jar:/m/second:/a/third.jar");
    }

    #[test]
    fn test_maven_origin_label() {
        let origin = ClassOrigin::MavenDep {
            repo: "central".to_string(),
            group: "org.jetbrains".to_string(),
            artifact: "annotations".to_string(),
            version: "24.0".to_string(),
        };
        assert_eq!(ClassOrigin::from_value(&origin.to_value()).unwrap(), origin);
        assert_eq!(origin.label(), "org.jetbrains:annotations:24.0");
    }
}
