//! Where a problem's expected outcome comes from: a directive embedded in
//! the file, a literal override, or an external program.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tokio::io::AsyncReadExt;
use walkdir::WalkDir;

use crate::error::{CorelockError, Result};
use crate::executor::Classification;

/// Only this much of a problem file is scanned for the directive.
const DIRECTIVE_SCAN_BYTES: usize = 64 * 1024;

fn directive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)expect(?:ed)?:\s*(unsat|sat|unknown|timeout|error|fail)")
            .expect("directive regex is well-formed")
    })
}

/// First `expect:`/`expected:` directive in the text, if any.
pub fn parse_expect_directive(text: &str) -> Option<Classification> {
    directive_re()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Scan the head of a problem file for its directive.
pub async fn find_expect(path: &Path) -> Result<Option<Classification>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; DIRECTIVE_SCAN_BYTES];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(parse_expect_directive(&String::from_utf8_lossy(&buf)))
}

/// How to decide what a problem expects.
#[derive(Debug, Clone, Default)]
pub enum ExpectSource {
    /// Read the directive out of the problem file.
    #[default]
    Auto,
    /// Every problem expects this outcome.
    Literal(Classification),
    /// Ask an external program; it gets the problem path as its argument
    /// and prints a classification word.
    Program(String),
}

/// Resolve a problem's expectation, falling back to `default` when the
/// source comes up empty.
pub async fn resolve_expect(
    source: &ExpectSource,
    path: &Path,
    default: Option<Classification>,
) -> Result<Classification> {
    let found = match source {
        ExpectSource::Literal(expected) => Some(*expected),
        ExpectSource::Auto => find_expect(path).await?,
        ExpectSource::Program(prog) => {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(format!("{prog} {}", path.display()))
                .output()
                .await?;
            let stdout = String::from_utf8_lossy(&output.stdout);
            stdout
                .trim()
                .parse()
                .ok()
                .or_else(|| parse_expect_directive(&stdout))
        }
    };
    found
        .or(default)
        .ok_or_else(|| CorelockError::ExpectNotFound(path.to_path_buf()))
}

/// All regular files under `dir`, sorted for deterministic batches.
pub fn discover_problems(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            paths.push(entry.into_path());
        }
    }
    paths.sort();
    Ok(paths)
}
