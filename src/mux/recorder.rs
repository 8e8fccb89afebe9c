//! Stand-in multiplexer binary that records every invocation
//!
//! A small shell script appends each call's argv to `calls.log` and keeps
//! its stdin as `stdin.<n>`, so adapter tests can assert the exact command
//! sequence and the bytes a pane would receive.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

const SCRIPT: &str = r#"#!/bin/sh
dir=$(dirname "$0")
n=$(cat "$dir/calls.log" 2>/dev/null | grep -c '^CALL$')
cat > "$dir/stdin.$n"
{
  echo CALL
  for arg in "$@"; do printf 'ARG:%s\n' "$arg"; done
} >> "$dir/calls.log"
exit 0
"#;

pub struct RecordingBin {
    dir: TempDir,
}

impl RecordingBin {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("mux");
        fs::write(&script, SCRIPT).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir }
    }

    pub fn program(&self) -> String {
        self.script().to_string_lossy().into_owned()
    }

    fn script(&self) -> PathBuf {
        self.dir.path().join("mux")
    }

    fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Argv of every call so far, in order
    pub fn calls(&self) -> Vec<Vec<String>> {
        let log = fs::read_to_string(self.dir().join("calls.log")).unwrap_or_default();
        let mut calls: Vec<Vec<String>> = Vec::new();
        for line in log.lines() {
            if line == "CALL" {
                calls.push(Vec::new());
            } else if let (Some(arg), Some(call)) = (line.strip_prefix("ARG:"), calls.last_mut()) {
                call.push(arg.to_string());
            }
        }
        calls
    }

    /// Bytes the `n`th call (from zero) read on stdin
    pub fn stdin(&self, n: usize) -> Vec<u8> {
        fs::read(self.dir().join(format!("stdin.{}", n))).unwrap_or_default()
    }
}
