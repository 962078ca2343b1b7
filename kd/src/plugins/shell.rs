//! Shell command action

use tracing::debug;

use super::process::run_streaming;
use crate::rule::{BuildError, Context, Rule, RuleKind, RuleResult};

/// `shell.run{command: List<String>, cwd: Directory | None}`
///
/// Streams output lines as events; never cached.
pub struct ShellRun;

impl Rule for ShellRun {
    fn kind(&self) -> RuleKind {
        RuleKind::Action
    }

    fn build(&self, ctx: &Context) -> Result<RuleResult, BuildError> {
        let command: Vec<String> = ctx
            .list_arg("command")?
            .iter()
            .map(|part| {
                part.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ctx.arg_error(format!("command must contain strings, found {}", part.kind())))
            })
            .collect::<Result<_, _>>()?;
        let Some((program, args)) = command.split_first() else {
            return Err(ctx.arg_error("command must not be empty"));
        };
        let cwd = match ctx.optional_arg("cwd") {
            Some(_) => Some(ctx.directory_arg("cwd")?),
            None => None,
        };
        debug!(%program, ?args, ?cwd, "ShellRun::build: called");

        run_streaming(program, args, cwd, ctx.progress(), ctx.cancel_token())?
            .ensure_success(program)
            .map_err(|e| e.attribute(ctx.rule_name()))?;
        Ok(RuleResult::Done)
    }
}
