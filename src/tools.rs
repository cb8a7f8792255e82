//! # External Tools
//!
//! Questo modulo centralizza la risoluzione e l'esecuzione dei tool esterni
//! (cjpeg, cwebp, img2webp, avifenc, heif-enc, heif-convert, zopflipng, pngquant,
//! ffmpeg, ffprobe).
//!
//! ## Risoluzione:
//! 1. Directory indicata da `MEDIA_RECOMPRESS_TOOLS_DIR` (tool bundled)
//! 2. `PATH` di sistema
//!
//! I risultati sono messi in cache nel singleton `ToolLocator::instance()`.
//!
//! ## Esecuzione:
//! `ToolCommand` è sincrono e viene chiamato dai backend, che girano
//! sempre dentro `spawn_blocking`. Il successo è dato dal codice di ritorno, il log
//! (stderr) viene catturato e riportato nell'errore.

use std::collections::HashMap;
use std::env;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, OnceLock};

use tracing::{debug, warn};

use crate::error::EncodeError;

pub const TOOLS_DIR_ENV: &str = "MEDIA_RECOMPRESS_TOOLS_DIR";

/// Every external tool a default registry may call.
pub const KNOWN_TOOLS: &[&str] = &[
    "cjpeg",
    "cwebp",
    "img2webp",
    "avifenc",
    "heif-enc",
    "heif-convert",
    "zopflipng",
    "pngquant",
    "ffmpeg",
    "ffprobe",
];

/// Lines of tool output kept in error messages.
const LOG_TAIL_LINES: usize = 10;

/// Cached lookup of external executables.
pub struct ToolLocator {
    tools_dir: Option<PathBuf>,
    cache: Mutex<HashMap<String, Option<PathBuf>>>,
}

impl ToolLocator {
    pub fn instance() -> &'static Self {
        static INSTANCE: OnceLock<ToolLocator> = OnceLock::new();
        INSTANCE.get_or_init(|| Self::new(env::var_os(TOOLS_DIR_ENV).map(PathBuf::from)))
    }

    pub fn new(tools_dir: Option<PathBuf>) -> Self {
        if let Some(ref dir) = tools_dir {
            debug!("Bundled tools directory: {}", dir.display());
        }
        Self {
            tools_dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, tool: &str) -> Option<PathBuf> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hit) = cache.get(tool) {
            return hit.clone();
        }

        let resolved = self
            .tools_dir
            .as_deref()
            .map(|dir| dir.join(executable_name(tool)))
            .filter(|path| path.is_file())
            .or_else(|| find_in_path(tool));

        match resolved {
            Some(ref path) => debug!("Resolved tool {} -> {}", tool, path.display()),
            None => debug!("Tool not found: {}", tool),
        }
        cache.insert(tool.to_string(), resolved.clone());
        resolved
    }

    pub fn is_available(&self, tool: &str) -> bool {
        self.resolve(tool).is_some()
    }

    /// One line per known tool, used by `--check-tools`.
    pub fn report(&self, tools: &[&str]) -> String {
        tools
            .iter()
            .map(|tool| match self.resolve(tool) {
                Some(path) => format!("✅ {:<12} {}", tool, path.display()),
                None => format!("❌ {:<12} not found", tool),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn executable_name(tool: &str) -> String {
    if cfg!(windows) {
        format!("{tool}.exe")
    } else {
        tool.to_string()
    }
}

fn find_in_path(tool: &str) -> Option<PathBuf> {
    let name = executable_name(tool);
    env::split_paths(&env::var_os("PATH")?)
        .map(|dir| dir.join(&name))
        .find(|path| path.is_file())
}

/// Captured result of a successful tool run.
#[derive(Debug, Default)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub log: String,
}

/// An external command built from resolved encoder parameters.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    tool: &'static str,
    args: Vec<String>,
}

impl ToolCommand {
    pub fn new(tool: &'static str, args: Vec<String>) -> Self {
        Self { tool, args }
    }

    pub fn tool(&self) -> &'static str {
        self.tool
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn command(&self) -> Result<Command, EncodeError> {
        let path = ToolLocator::instance()
            .resolve(self.tool)
            .ok_or_else(|| EncodeError::ToolUnavailable(self.tool.to_string()))?;
        let mut cmd = Command::new(path);
        cmd.args(&self.args);
        Ok(cmd)
    }

    /// Runs the tool to completion and maps a non-zero exit to `ToolFailed`.
    pub fn run(&self) -> Result<ToolOutput, EncodeError> {
        debug!("Running {} {}", self.tool, self.args.join(" "));
        let output = self.command()?.stdin(Stdio::null()).output()?;
        let log = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            warn!("{} failed with {:?}", self.tool, output.status.code());
            return Err(EncodeError::ToolFailed {
                tool: self.tool.to_string(),
                code: output.status.code(),
                log: log_tail(&log),
            });
        }
        Ok(ToolOutput {
            stdout: output.stdout,
            log,
        })
    }

    /// Runs the tool while feeding every stdout line to `on_line`.
    pub fn run_streaming(&self, mut on_line: impl FnMut(&str)) -> Result<ToolOutput, EncodeError> {
        debug!("Running {} {} (streaming)", self.tool, self.args.join(" "));
        let mut child = self
            .command()?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // stderr is drained on its own thread so a chatty tool cannot block on a full pipe
        let stderr = child.stderr.take();
        let stderr_reader = std::thread::spawn(move || {
            let mut log = String::new();
            if let Some(stderr) = stderr {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    log.push_str(&line);
                    log.push('\n');
                }
            }
            log
        });

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                on_line(&line);
            }
        }

        let status = child.wait()?;
        let log = stderr_reader.join().unwrap_or_default();
        if !status.success() {
            return Err(EncodeError::ToolFailed {
                tool: self.tool.to_string(),
                code: status.code(),
                log: log_tail(&log),
            });
        }
        Ok(ToolOutput {
            stdout: Vec::new(),
            log,
        })
    }
}

fn log_tail(log: &str) -> String {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    lines[start..].join("\n")
}

/// Reads a file produced by a tool, treating an empty result as a failure.
pub fn read_tool_output(tool: &str, path: &Path) -> Result<Vec<u8>, EncodeError> {
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Err(EncodeError::ToolFailed {
            tool: tool.to_string(),
            code: Some(0),
            log: format!("{} produced an empty file", path.display()),
        });
    }
    Ok(bytes)
}
