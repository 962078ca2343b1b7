//! Built-in rule plugins

pub mod jvm;
pub mod process;
pub mod shell;

use crate::rule::RuleRegistry;

/// Register every built-in rule
pub fn register_builtins(registry: &mut RuleRegistry) {
    registry
        .register("jvm", "resolveClassPkgs", jvm::ResolveClassPkgs)
        .register("jvm", "compile", jvm::Compile)
        .register("shell", "run", shell::ShellRun);
}
