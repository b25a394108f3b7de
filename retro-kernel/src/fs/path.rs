//! Absolute-path normalization for the VFS.

use alloc::string::String;
use alloc::vec::Vec;

/// Build the canonical absolute form of `path`, joining relative paths onto
/// `cwd`. `.` collapses, `..` pops one component, duplicate separators
/// vanish. The result always starts with `/` and has no trailing separator.
pub fn normalize(path: &str, cwd: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    let base = if path.starts_with('/') { "" } else { cwd };

    for part in base.split('/').chain(path.split('/')) {
        match part {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            part => stack.push(part),
        }
    }

    let mut out = String::from("/");
    out.push_str(&stack.join("/"));
    out
}
