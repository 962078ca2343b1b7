//! JVM build rules
//!
//! `jvm.resolveClassPkgs` flattens a set of ClassPkgs into a classpath;
//! `jvm.compile` resolves its deps through it, then invokes the compiler.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::process::run_streaming;
use crate::rule::{BuildError, Context, Rule, RuleResult};
use crate::value::classpkg::{self, ClassOrigin, ClassPaths, ClassPkg, CpInfo};
use crate::value::{Args, Value, ValueSet};

pub const RESOLVE_CLASS_PKGS: &str = "jvm.resolveClassPkgs";
pub const COMPILE: &str = "jvm.compile";

/// `jvm.resolveClassPkgs{classPkgs: Set<ClassPkg>}` -> `jvm.ClassPaths`
///
/// Every entry must exist on disk; a missing one means the dependency could
/// not be resolved.
pub struct ResolveClassPkgs;

impl Rule for ResolveClassPkgs {
    fn build(&self, ctx: &Context) -> Result<RuleResult, BuildError> {
        let roots = ctx.set_arg("classPkgs")?;
        debug!(roots = roots.len(), "ResolveClassPkgs::build: called");
        let entries = classpkg::closure(roots).map_err(|e| e.attribute(ctx.rule_name()))?;

        let mut seen: HashSet<&Path> = HashSet::new();
        let mut cps: Vec<PathBuf> = Vec::new();
        for entry in &entries {
            for path in entry.cpinfo.classpath_entries() {
                if !path.exists() {
                    return Err(ctx.fail(format!(
                        "unresolvable dependency {}: {} does not exist",
                        entry.origin.label(),
                        path.display()
                    )));
                }
                if seen.insert(path) {
                    cps.push(path.to_path_buf());
                }
            }
        }

        ctx.progress().verbose(format!(
            "resolved {} classpath entries from {} packages",
            cps.len(),
            entries.len()
        ));
        Ok(RuleResult::value(ClassPaths { cps }.to_value()))
    }
}

/// `jvm.compile{srcs, deps, compiler, options}` -> `jvm.ClassPkg`
///
/// Runs `compiler [-cp <classpath>] -d <dest> <options...> <srcs...>` when
/// the inputs changed, and otherwise reuses the classes already in the
/// destination directory.
pub struct Compile;

impl Rule for Compile {
    fn build(&self, ctx: &Context) -> Result<RuleResult, BuildError> {
        let srcs = source_files(ctx)?;
        let deps: ValueSet = ctx.set_arg("deps")?.clone();
        let compiler = ctx.string_arg("compiler")?.to_string();
        let options = string_list(ctx, "options")?;
        debug!(srcs = srcs.len(), deps = deps.len(), %compiler, "Compile::build: called");

        let resolve_args = Args::from([("classPkgs".to_string(), Value::Set(deps.clone()))]);
        let ctx = ctx.clone();
        Ok(RuleResult::eval_and_then(RESOLVE_CLASS_PKGS, resolve_args, move |resolved| {
            let classpath = ClassPaths::from_value(&resolved).map_err(|e| e.attribute(ctx.rule_name()))?;
            let dest = ctx.dest_directory().to_path_buf();

            if ctx.hash_changed() {
                compile(&ctx, &compiler, &classpath, &options, &srcs)?;
            } else {
                ctx.progress().info("inputs unchanged, reusing compiled classes");
            }

            let origin = ClassOrigin::LocalBuilt {
                obj_hash: ctx.object_id_hash().to_string(),
                builder_name: COMPILE.to_string(),
            };
            let cpinfo = CpInfo::Classes {
                class_dirs: vec![dest],
                res_dirs: Vec::new(),
                srcs: Some(srcs),
            };
            Ok(RuleResult::value(ClassPkg::new(origin, cpinfo, deps).into_value()))
        }))
    }
}

fn source_files(ctx: &Context) -> Result<Vec<PathBuf>, BuildError> {
    ctx.set_arg("srcs")?
        .iter()
        .map(|src| {
            src.as_file()
                .map(Path::to_path_buf)
                .ok_or_else(|| ctx.arg_error(format!("srcs must contain files, found {}", src.kind())))
        })
        .collect()
}

fn string_list(ctx: &Context, name: &str) -> Result<Vec<String>, BuildError> {
    let Some(value) = ctx.optional_arg(name) else {
        return Ok(Vec::new());
    };
    let items = value
        .as_list()
        .ok_or_else(|| ctx.arg_error(format!("argument '{}' must be list, got {}", name, value.kind())))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| ctx.arg_error(format!("argument '{}' must contain strings", name)))
        })
        .collect()
}

fn compile(
    ctx: &Context,
    compiler: &str,
    classpath: &ClassPaths,
    options: &[String],
    srcs: &[PathBuf],
) -> Result<(), BuildError> {
    let dest = ctx.dest_directory();
    // Stale classes from the previous inputs must not survive
    if dest.exists() {
        fs::remove_dir_all(dest).map_err(|e| BuildError::from(e).attribute(ctx.rule_name()))?;
    }
    fs::create_dir_all(dest).map_err(|e| BuildError::from(e).attribute(ctx.rule_name()))?;

    let mut args = Vec::new();
    if !classpath.cps.is_empty() {
        args.push("-cp".to_string());
        args.push(classpath.joined());
    }
    args.push("-d".to_string());
    args.push(dest.to_string_lossy().into_owned());
    args.extend(options.iter().cloned());
    args.extend(srcs.iter().map(|s| s.to_string_lossy().into_owned()));

    ctx.progress().info(format!("compiling {} source files with {}", srcs.len(), compiler));
    run_streaming(compiler, &args, None, ctx.progress(), ctx.cancel_token())?
        .ensure_success(compiler)
        .map_err(|e| e.attribute(ctx.rule_name()))
}
