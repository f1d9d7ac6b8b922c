use std::process::Command;

use anyhow::{anyhow, bail, Context};
use cadence_marshal::{StateMap, StateValue};
use cadence_scheduler::CallableRegistry;
use tracing::info;

/// Register the callables every daemon config can refer to.
pub fn register(callables: &CallableRegistry) {
    callables.register("log", log);
    callables.register("command", command);
}

/// Log a message, given as the first argument or a `message` kwarg.
fn log(args: &[StateValue], kwargs: &StateMap) -> anyhow::Result<StateValue> {
    let message = args
        .first()
        .or_else(|| kwargs.get("message"))
        .and_then(StateValue::as_str)
        .ok_or_else(|| anyhow!("log: expected a string message"))?;
    info!(target: "cadence::jobs", "{message}");
    Ok(StateValue::Null)
}

/// Run `args[0]` with the remaining arguments and return its trimmed stdout.
///
/// A `cwd` kwarg sets the working directory. A non-zero exit is a fault
/// carrying stderr.
fn command(args: &[StateValue], kwargs: &StateMap) -> anyhow::Result<StateValue> {
    let argv = args
        .iter()
        .map(|a| {
            a.as_str()
                .ok_or_else(|| anyhow!("command: arguments must be strings, got {}", a.kind()))
        })
        .collect::<anyhow::Result<Vec<&str>>>()?;
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command: missing program"))?;

    let mut cmd = Command::new(program);
    cmd.args(rest);
    if let Some(dir) = kwargs.get("cwd").and_then(StateValue::as_str) {
        cmd.current_dir(dir);
    }
    let output = cmd
        .output()
        .with_context(|| format!("failed to spawn '{program}'"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("'{program}' exited with {}: {}", output.status, stderr.trim());
    }
    Ok(StateValue::Str(
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
    ))
}
