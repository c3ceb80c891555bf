//! Runs an executable template as a child process, capturing stdout as
//! the file's rendered contents (spec §4.D). Draining both pipes is
//! multiplexed with `nix::poll` so a child that fills its stderr pipe
//! without anyone reading it can't deadlock a stdout read, and vice
//! versa.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, execve, fork, pipe, ForkResult};

use crate::elastic_buffer::ElasticBuffer;

const INITIAL_CAPACITY: usize = 16 * 1024;
const HEADROOM: usize = 2 * 1024;
/// spec §4.D: "a 10s timeout... not a deadline". `DaemonConfig`'s
/// `exec_poll_timeout_secs` overrides this per mount.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub exit_status: i32,
}

/// `execute_template(handle, out_buffer, out_size)` (spec §4.D). `argv[0]`
/// is the absolute template path, `argv[1]` the absolute lower-tree path;
/// `envp` is the process environment captured at daemon startup. Returns
/// a negative errno on driver failure (fork/pipe/waitpid); otherwise the
/// child's raw exit status is embedded in `ExecResult` even when non-zero:
/// a non-zero exit is the operation's result, not a driver error (spec
/// §7: "fork failure becomes -errno; exec failure inside the child
/// becomes a non-zero exit status, surfaced as the operation's result
/// unchanged").
pub fn execute_template(template_path: &Path, lower_path: &Path, envp: &[CString]) -> Result<ExecResult, i32> {
    execute_template_with_timeout(template_path, lower_path, envp, DEFAULT_POLL_TIMEOUT)
}

/// As [`execute_template`], but with the drain loop's per-iteration `poll`
/// wait overridden (spec §4.D; `DaemonConfig::exec_poll_timeout_secs`).
pub fn execute_template_with_timeout(
    template_path: &Path,
    lower_path: &Path,
    envp: &[CString],
    poll_timeout: Duration,
) -> Result<ExecResult, i32> {
    let (out_read, out_write) = pipe().map_err(errno_of)?;
    let (err_read, err_write) = pipe().map_err(errno_of)?;

    let argv0 = path_cstring(template_path)?;
    let argv1 = path_cstring(lower_path)?;

    match unsafe { fork() }.map_err(errno_of)? {
        ForkResult::Child => {
            drop(out_read);
            drop(err_read);
            let _ = dup2(out_write.as_raw_fd(), libc::STDOUT_FILENO);
            let _ = dup2(err_write.as_raw_fd(), libc::STDERR_FILENO);
            drop(out_write);
            drop(err_write);
            let argv = [argv0.clone(), argv1.clone()];
            let _ = execve(&argv0, &argv, envp);
            unsafe { libc::_exit(127) }
        }
        ForkResult::Parent { child } => {
            drop(out_write);
            drop(err_write);
            let drain_result = drain(&out_read, &err_read, poll_timeout);
            drop(out_read);
            drop(err_read);
            let (stdout, stderr) = drain_result?;

            let status = match waitpid(child, None).map_err(errno_of)? {
                WaitStatus::Exited(_, code) => code,
                WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
                _ => -1,
            };

            log_stderr_block(template_path, &stderr);

            Ok(ExecResult {
                stdout,
                exit_status: status,
            })
        }
    }
}

fn path_cstring(path: &Path) -> Result<CString, i32> {
    CString::new(path.as_os_str().to_string_lossy().as_bytes()).map_err(|_| -libc::EINVAL)
}

/// Snapshots the process environment at startup (spec §6: "Environment:
/// inherited process environment as captured at program start").
pub fn captured_environment() -> Vec<CString> {
    use std::os::unix::ffi::OsStringExt;
    std::env::vars_os()
        .filter_map(|(mut k, v)| {
            k.push("=");
            k.push(v);
            CString::new(k.into_vec()).ok()
        })
        .collect()
}

fn drain(out_read: &OwnedFd, err_read: &OwnedFd, poll_timeout: Duration) -> Result<(Vec<u8>, Vec<u8>), i32> {
    let mut out_buf = ElasticBuffer::new(INITIAL_CAPACITY, HEADROOM);
    let mut err_buf = ElasticBuffer::new(INITIAL_CAPACITY, HEADROOM);
    let mut out_done = false;
    let mut err_done = false;

    while !out_done || !err_done {
        let mut fds = Vec::with_capacity(2);
        if !out_done {
            fds.push(PollFd::new(out_read.as_fd(), PollFlags::POLLIN));
        }
        if !err_done {
            fds.push(PollFd::new(err_read.as_fd(), PollFlags::POLLIN));
        }

        let timeout = PollTimeout::try_from(poll_timeout).unwrap_or(PollTimeout::MAX);
        poll(&mut fds, timeout).map_err(errno_of)?;

        let mut idx = 0;
        if !out_done {
            let revents = fds[idx].revents().unwrap_or(PollFlags::empty());
            idx += 1;
            if revents.intersects(PollFlags::POLLIN) {
                let n = out_buf.fill_from_fd(out_read.as_raw_fd()).map_err(errno_of)?;
                if n == 0 {
                    out_done = true;
                }
            } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                out_done = true;
            }
        }
        if !err_done {
            let revents = fds[idx].revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLIN) {
                let n = err_buf.fill_from_fd(err_read.as_raw_fd()).map_err(errno_of)?;
                if n == 0 {
                    err_done = true;
                }
            } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                err_done = true;
            }
        }
    }

    Ok((out_buf.into_vec(), err_buf.into_vec()))
}

/// Logs non-empty stderr output as a numbered warning block, one log
/// record per line numbered from 1, labeled with the template path (spec
/// §4.D, §6).
pub fn log_stderr_block(template_path: &Path, stderr: &[u8]) {
    if stderr.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(stderr);
    log::warn!("template {:?} wrote to stderr:", template_path);
    for (i, line) in text.lines().enumerate() {
        log::warn!("{}: {}", i + 1, line);
    }
}

fn errno_of(e: nix::Error) -> i32 {
    -(e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        write!(f, "{body}").unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn captures_stdout_and_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "ok.sh", "echo hello\nexit 0\n");
        let env = captured_environment();
        let result = execute_template(&script, &script, &env).unwrap();
        assert_eq!(result.stdout, b"hello\n");
        assert_eq!(result.exit_status, 0);
    }

    #[test]
    fn nonzero_exit_is_reported_not_treated_as_driver_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "fail.sh", "echo partial\nexit 3\n");
        let env = captured_environment();
        let result = execute_template(&script, &script, &env).unwrap();
        assert_eq!(result.stdout, b"partial\n");
        assert_eq!(result.exit_status, 3);
    }

    #[test]
    fn receives_both_argv_entries() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "argv.sh", "printf '%s|%s' \"$0\" \"$1\"\n");
        let lower = dir.path().join("lower-marker");
        let env = captured_environment();
        let result = execute_template(&script, &lower, &env).unwrap();
        let out = String::from_utf8(result.stdout).unwrap();
        assert!(out.ends_with(&format!("|{}", lower.display())));
    }

    #[test]
    fn zero_byte_output_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "empty.sh", "exit 0\n");
        let env = captured_environment();
        let result = execute_template(&script, &script, &env).unwrap();
        assert!(result.stdout.is_empty());
        assert_eq!(result.exit_status, 0);
    }
}
