//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::fs;
use std::io::Write;
use std::path::PathBuf;

// Pidfile held for the daemon's lifetime.
//
// Runtime files live under TMPDIR (falling back to /tmp); nothing else is
// persisted.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(name: &str) -> std::io::Result<PidFile> {
        let path = std::env::temp_dir().join(format!("{name}.pid"));
        let mut file = fs::File::create(&path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(PidFile { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
