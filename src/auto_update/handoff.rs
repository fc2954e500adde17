// Handoff Script Generator
// A running executable cannot overwrite itself, so the copy-and-relaunch step
// is written out as a script that a separate process runs after we exit.

use std::path::Path;

/// Script language of the handoff script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFlavor {
    PowerShell,
    Posix,
}

impl ScriptFlavor {
    /// Flavor for the platform we are running on
    pub fn native() -> Self {
        if cfg!(target_os = "windows") {
            ScriptFlavor::PowerShell
        } else {
            ScriptFlavor::Posix
        }
    }

    /// File name the script is written under in the temp directory
    pub fn file_name(&self) -> &'static str {
        match self {
            ScriptFlavor::PowerShell => "update.ps1",
            ScriptFlavor::Posix => "update.sh",
        }
    }
}

/// Renders the handoff script; pure text in, text out
#[derive(Debug, Clone, Copy)]
pub struct HandoffScript {
    pub flavor: ScriptFlavor,
    /// Seconds to wait before copying and again before relaunching
    pub delay_secs: u64,
}

impl HandoffScript {
    pub fn new(flavor: ScriptFlavor, delay_secs: u64) -> Self {
        Self { flavor, delay_secs }
    }

    /// Script that waits for this process to exit, copies every file of
    /// `update_source_dir` over `install_dir` and relaunches `app_executable`
    pub fn generate(
        &self,
        install_dir: &Path,
        app_executable: &Path,
        update_source_dir: &Path,
    ) -> String {
        match self.flavor {
            ScriptFlavor::PowerShell => self.powershell(install_dir, app_executable, update_source_dir),
            ScriptFlavor::Posix => self.posix(install_dir, app_executable, update_source_dir),
        }
    }

    fn powershell(&self, install_dir: &Path, app_executable: &Path, source_dir: &Path) -> String {
        format!(
            r#"$ErrorActionPreference = 'Stop'
Echo "Waiting for D2RMM to exit..."
Start-Sleep -Seconds {delay}
Echo "Copying files..."
Copy-Item -Path (Join-Path {source} '*') -Destination {install} -Recurse -Force
Echo "Restarting D2RMM..."
Start-Sleep -Seconds {delay}
Start-Process -FilePath {exe}
"#,
            delay = self.delay_secs,
            source = powershell_quote(source_dir),
            install = powershell_quote(install_dir),
            exe = powershell_quote(app_executable),
        )
    }

    fn posix(&self, install_dir: &Path, app_executable: &Path, source_dir: &Path) -> String {
        format!(
            r#"#!/bin/sh
set -e
echo "Waiting for D2RMM to exit..."
sleep {delay}
echo "Copying files..."
mkdir -p {install}
cp -R {source}/. {install}/
echo "Restarting D2RMM..."
sleep {delay}
nohup {exe} >/dev/null 2>&1 &
"#,
            delay = self.delay_secs,
            source = posix_quote(source_dir),
            install = posix_quote(install_dir),
            exe = posix_quote(app_executable),
        )
    }
}

/// Single-quoted PowerShell literal (no interpolation; `'` doubled)
fn powershell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "''"))
}

/// Single-quoted POSIX shell word (`'` closed, escaped, reopened)
fn posix_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}
