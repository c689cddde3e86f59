//! Read-only git adapter.
//!
//! Every invocation runs `git -c safe.directory=<repo>` as a subprocess with
//! a per-call deadline. Non-zero exits are surfaced as structured failures
//! with captured stderr/stdout; callers decide whether to translate them
//! (e.g. into `evidence_missing`). Nothing here ever mutates a repository.

use crate::core::error::LanekeeperError;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Default per-call deadline for git invocations.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Deadline for external-knowledge loads and `gh` calls.
pub const EXTERNAL_TIMEOUT_MS: u64 = 20_000;

/// Captured output of a completed subprocess.
#[derive(Debug)]
pub struct GitOutput {
    pub ok: bool,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl GitOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

pub(crate) fn wait_with_deadline(
    mut child: std::process::Child,
    program: &str,
    timeout_ms: u64,
) -> Result<GitOutput, LanekeeperError> {
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    // Drain both pipes off-thread so a chatty subprocess cannot deadlock
    // against a full pipe buffer while we poll for exit.
    let stdout_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    });

    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(LanekeeperError::Timeout(format!(
                        "{} exceeded {}ms deadline",
                        program, timeout_ms
                    )));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();
    Ok(GitOutput {
        ok: status.success(),
        stdout,
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
    })
}

/// Run git in `repo` with the per-invocation `safe.directory` override.
pub fn run_git(repo: &Path, args: &[&str], timeout_ms: u64) -> Result<GitOutput, LanekeeperError> {
    let safe_dir = format!("safe.directory={}", repo.display());
    let child = Command::new("git")
        .arg("-c")
        .arg(&safe_dir)
        .args(args)
        .current_dir(repo)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| LanekeeperError::GitFailed(format!("failed to launch git: {}", e)))?;
    wait_with_deadline(child, "git", timeout_ms)
}

fn git_ok(repo: &Path, args: &[&str]) -> Result<GitOutput, LanekeeperError> {
    let out = run_git(repo, args, DEFAULT_TIMEOUT_MS)?;
    if out.ok {
        Ok(out)
    } else {
        Err(LanekeeperError::GitFailed(format!(
            "git {} in {}: {}{}",
            args.join(" "),
            repo.display(),
            out.stderr.trim(),
            out.stdout_text().trim()
        )))
    }
}

/// Resolve `branch` to a usable ref: `origin/<b>` when the remote-tracking
/// ref exists, the local branch when it does, else `None`.
pub fn resolve_ref(repo: &Path, branch: &str) -> Result<Option<String>, LanekeeperError> {
    let remote = format!("refs/remotes/origin/{}", branch);
    let out = run_git(
        repo,
        &["show-ref", "--verify", "--quiet", &remote],
        DEFAULT_TIMEOUT_MS,
    )?;
    if out.ok {
        return Ok(Some(format!("origin/{}", branch)));
    }

    let local = format!("refs/heads/{}", branch);
    let out = run_git(
        repo,
        &["show-ref", "--verify", "--quiet", &local],
        DEFAULT_TIMEOUT_MS,
    )?;
    if out.ok {
        return Ok(Some(branch.to_string()));
    }
    Ok(None)
}

/// `git show <ref>:<path>`, byte-exact content at the ref.
///
/// Failure means the path is unreadable at that ref; callers in the evidence
/// pipeline translate this into their fail-closed error.
pub fn show_file_at_ref(
    repo: &Path,
    reference: &str,
    path: &str,
) -> Result<Vec<u8>, LanekeeperError> {
    let object = format!("{}:{}", reference, path);
    let out = run_git(repo, &["show", &object], DEFAULT_TIMEOUT_MS)?;
    if out.ok {
        Ok(out.stdout)
    } else {
        Err(LanekeeperError::GitFailed(format!(
            "git show {} in {}: {}",
            object,
            repo.display(),
            out.stderr.trim()
        )))
    }
}

/// `git rev-list -1 <ref>`: the head commit sha of a ref.
pub fn rev_list_one(repo: &Path, reference: &str) -> Result<String, LanekeeperError> {
    let out = git_ok(repo, &["rev-list", "-1", reference])?;
    let sha = out.stdout_text().trim().to_string();
    if sha.is_empty() {
        return Err(LanekeeperError::GitFailed(format!(
            "rev-list -1 {} returned nothing",
            reference
        )));
    }
    Ok(sha)
}

/// Names touched by a commit, via `diff-tree <sha>^ <sha>`.
pub fn diff_tree_names(repo: &Path, sha: &str) -> Result<Vec<String>, LanekeeperError> {
    let parent = format!("{}^", sha);
    let out = git_ok(
        repo,
        &["diff-tree", "--no-commit-id", "--name-only", "-r", &parent, sha],
    )?;
    Ok(out
        .stdout_text()
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// `git rev-parse HEAD`.
pub fn rev_parse_head(repo: &Path) -> Result<String, LanekeeperError> {
    let out = git_ok(repo, &["rev-parse", "HEAD"])?;
    Ok(out.stdout_text().trim().to_string())
}

/// All blob paths in the tree at `ref`, via `git ls-tree -r --name-only`.
pub fn ls_tree_names(repo: &Path, reference: &str) -> Result<Vec<String>, LanekeeperError> {
    let out = git_ok(repo, &["ls-tree", "-r", "--name-only", reference])?;
    Ok(out
        .stdout_text()
        .lines()
        .map(|l| l.to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// Structured diagnostics for a candidate work tree.
#[derive(Debug)]
pub struct WorkTreeProbe {
    pub ok: bool,
    pub head: Option<String>,
    /// git refused the directory with its "dubious ownership" complaint.
    pub dubious_ownership: bool,
    pub detail: Option<String>,
}

/// Probe `cwd` for a usable git work tree without mutating anything.
pub fn probe_work_tree(cwd: &Path) -> WorkTreeProbe {
    let out = match run_git(cwd, &["rev-parse", "HEAD"], DEFAULT_TIMEOUT_MS) {
        Ok(out) => out,
        Err(e) => {
            return WorkTreeProbe {
                ok: false,
                head: None,
                dubious_ownership: false,
                detail: Some(format!("{}", e)),
            };
        }
    };
    if out.ok {
        return WorkTreeProbe {
            ok: true,
            head: Some(out.stdout_text().trim().to_string()),
            dubious_ownership: false,
            detail: None,
        };
    }
    let dubious = out.stderr.contains("dubious ownership");
    WorkTreeProbe {
        ok: false,
        head: None,
        dubious_ownership: dubious,
        detail: Some(out.stderr.trim().to_string()),
    }
}
