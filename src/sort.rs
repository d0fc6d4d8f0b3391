//! External sort plumbing
//!
//! Exact percentiles and the threshold sweep both need fully sorted value
//! streams that may not fit in memory; sorting is delegated to the host
//! `sort` utility running as a child process.

use crate::{SomError, SomResult};
use std::path::Path;
use std::process::{Child, Command, Stdio};

/// Extra arguments for the external sort utility, taken from `SORT_ARGS`.
/// The value is validated against a conservative character class before it
/// is split into arguments.
pub fn sort_args_from_env() -> SomResult<Vec<String>> {
    let Ok(env) = std::env::var("SORT_ARGS") else {
        return Ok(Vec::new());
    };
    if !env
        .chars()
        .all(|c| c == ' ' || c == '-' || c == '/' || c.is_ascii_alphanumeric())
    {
        return Err(SomError::InvalidConfig(format!(
            "could not validate SORT_ARGS=\"{}\"",
            env
        )));
    }
    log::info!("Detected SORT_ARGS=\"{}\"", env);
    Ok(env.split_whitespace().map(str::to_string).collect())
}

/// Spawn `sort -k1,1g` over a file, or with a piped stdin when no input path
/// is given. Stdout is always piped back to the caller.
pub fn spawn_sort(extra_args: &[String], input: Option<&Path>) -> SomResult<Child> {
    let mut cmd = Command::new("sort");
    cmd.arg("-k1,1g").args(extra_args);
    match input {
        Some(path) => {
            cmd.arg(path);
            cmd.stdin(Stdio::null());
        }
        None => {
            cmd.stdin(Stdio::piped());
        }
    }
    cmd.stdout(Stdio::piped());
    cmd.spawn()
        .map_err(|e| SomError::Sort(format!("could not run sort: {}", e)))
}
