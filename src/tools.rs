//! Runtime tool path resolution
//!
//! For each external tool (e.g. `docker`) we:
//! 1. Check for an environment variable `{TOOL}_BIN` (e.g. `DOCKER_BIN`)
//! 2. Look the tool up on PATH
//! 3. Fall back to the bare name and let the OS report a missing binary
//!
//! Tests override the env var to point at fakes.

use std::env;

/// Container engine CLI
pub const DOCKER: &str = "docker";

/// Resolve the path to an external tool
pub fn get_tool_path(tool: &str) -> String {
    let env_var = format!("{}_BIN", tool.to_uppercase().replace('-', "_"));
    if let Ok(path) = env::var(&env_var) {
        if !path.is_empty() {
            return path;
        }
    }

    which::which(tool)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| tool.to_string())
}
