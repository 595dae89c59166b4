//! Cargo as the external build pipeline.
//!
//! `CargoGate` runs `cargo build` with JSON messages and reads the
//! executables out of the `compiler-artifact` messages. Cargo's own progress
//! output goes to the terminal untouched; compiler errors are collected
//! from the JSON stream and become the failure cause.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context;
use relive_core::{CompileGate, CompileResult};
use serde::Deserialize;

/// A single line of cargo's JSON output.
#[derive(Debug, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
enum CargoMessage {
    CompilerArtifact {
        executable: Option<PathBuf>,
    },
    CompilerMessage {
        message: Diagnostic,
    },
    BuildFinished {
        success: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Diagnostic {
    level: String,
    rendered: Option<String>,
}

/// What a build run reported.
#[derive(Debug, Default, PartialEq, Eq)]
struct BuildReport {
    executables: Vec<PathBuf>,
    errors: Vec<String>,
    success: Option<bool>,
}

fn parse_messages(stdout: &str) -> BuildReport {
    let mut report = BuildReport::default();
    for line in stdout.lines().filter(|l| l.starts_with('{')) {
        let message = match serde_json::from_str::<CargoMessage>(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::trace!("skipping cargo message: {}", e);
                continue;
            }
        };
        match message {
            CargoMessage::CompilerArtifact {
                executable: Some(executable),
            } => report.executables.push(executable),
            CargoMessage::CompilerMessage { message } if message.level == "error" => {
                if let Some(rendered) = message.rendered {
                    report.errors.push(rendered);
                }
            }
            CargoMessage::BuildFinished { success } => report.success = Some(success),
            _ => {}
        }
    }
    report
}

/// Builds the project with `cargo build`.
#[derive(Debug, Clone)]
pub struct CargoGate {
    manifest_dir: PathBuf,
    package: Option<String>,
    bin: Option<String>,
    release: bool,
}

impl CargoGate {
    pub fn new(manifest_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest_dir: manifest_dir.into(),
            package: None,
            bin: None,
            release: false,
        }
    }

    pub fn package(mut self, package: Option<String>) -> Self {
        self.package = package;
        self
    }

    pub fn bin(mut self, bin: Option<String>) -> Self {
        self.bin = bin;
        self
    }

    pub fn release(mut self, release: bool) -> Self {
        self.release = release;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new("cargo");
        command
            .arg("build")
            .arg("--message-format=json-diagnostic-rendered-ansi")
            .current_dir(&self.manifest_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(package) = &self.package {
            command.arg("--package").arg(package);
        }
        if let Some(bin) = &self.bin {
            command.arg("--bin").arg(bin);
        }
        if self.release {
            command.arg("--release");
        }
        command
    }

    fn build(&self) -> anyhow::Result<CompileResult> {
        let output = self
            .command()
            .output()
            .context("failed to run cargo")?;
        let report = parse_messages(&String::from_utf8_lossy(&output.stdout));

        if !output.status.success() || report.success == Some(false) {
            let cause = if report.errors.is_empty() {
                format!("cargo build exited with {}", output.status)
            } else {
                report.errors.join("\n")
            };
            return Ok(CompileResult::Failure(cause));
        }
        Ok(CompileResult::Success(report.executables.into_iter().collect()))
    }
}

impl CompileGate for CargoGate {
    fn request_compile(&self) -> CompileResult {
        match self.build() {
            Ok(result) => result,
            Err(e) => CompileResult::Failure(format!("{:#}", e)),
        }
    }
}

/// Name of the binary to run when none was given.
///
/// Uses the package name from the manifest.
pub fn default_entry_point(manifest_dir: &Path, package: Option<&str>) -> anyhow::Result<String> {
    if let Some(package) = package {
        return Ok(package.to_string());
    }
    let manifest_path = manifest_dir.join("Cargo.toml");
    let manifest = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let manifest: toml::Value = toml::from_str(&manifest)
        .with_context(|| format!("failed to parse {}", manifest_path.display()))?;

    manifest
        .get("package")
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str())
        .map(str::to_string)
        .with_context(|| {
            format!(
                "{} has no [package] name; pass --bin or --package",
                manifest_path.display()
            )
        })
}
