//! Process seam and FUSE supervision.
//!
//! Everything that touches external processes (remote execution through the
//! caller-supplied ssh/scp command prefixes, the FUSE child itself) goes
//! through [`ProcessFactory`], so session logic is testable with a scripted
//! fake.

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use cdcsync_core::{ContentHash, Error, Result};

use crate::session::{SessionShared, SessionState};

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last few lines of stderr, for user-visible failure messages
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        lines[lines.len().saturating_sub(3)..].join("\n")
    }
}

/// A spawned long-running process
pub trait ChildHandle: Send {
    /// Poll for exit without blocking
    ///
    /// # Errors
    /// Propagates wait failures
    fn try_wait(&mut self) -> Result<Option<i32>>;

    /// Force-terminate
    ///
    /// # Errors
    /// Propagates kill failures
    fn kill(&mut self) -> Result<()>;

    fn pid(&self) -> Option<u32>;
}

/// Seam for spawning processes: the real implementation shells out, tests
/// substitute a scripted fake.
pub trait ProcessFactory: Send + Sync + 'static {
    /// Run a command to completion with a timeout
    ///
    /// # Errors
    /// Returns `DeadlineExceeded` when the timeout fires
    fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Spawn a long-running command
    ///
    /// # Errors
    /// Propagates spawn failures
    fn spawn(&self, command: &str) -> Result<Box<dyn ChildHandle>>;
}

/// Real factory: runs commands through `sh -c`
pub struct SystemProcessFactory;

struct SystemChild {
    child: std::process::Child,
}

impl ChildHandle for SystemChild {
    fn try_wait(&mut self) -> Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.code().unwrap_or(-1)))
    }

    fn kill(&mut self) -> Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already exited
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }
}

impl ProcessFactory for SystemProcessFactory {
    fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!("run: {command}");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain pipes on side threads so a chatty child cannot deadlock.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_thread = std::thread::spawn(move || read_pipe(stdout_pipe));
        let stderr_thread = std::thread::spawn(move || read_pipe(stderr_pipe));

        let deadline = Instant::now() + timeout;
        let exit_code = loop {
            if let Some(status) = child.try_wait()? {
                break status.code().unwrap_or(-1);
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::deadline_exceeded(format!(
                    "command timed out after {timeout:?}"
                )));
            }
            std::thread::sleep(Duration::from_millis(20));
        };

        Ok(CommandOutput {
            stdout: stdout_thread.join().unwrap_or_default(),
            stderr: stderr_thread.join().unwrap_or_default(),
            exit_code,
        })
    }

    fn spawn(&self, command: &str) -> Result<Box<dyn ChildHandle>> {
        debug!("spawn: {command}");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(SystemChild { child }))
    }
}

fn read_pipe(pipe: Option<impl std::io::Read>) -> String {
    use std::io::Read;
    let mut out = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut out);
    }
    out
}

/// Quote one token so it survives both the local shell and the remote one.
///
/// A leading `~user/` with a valid POSIX login name stays outside the quotes
/// so the remote shell still expands it; everything else that contains shell
/// metacharacters is single-quoted.
#[must_use]
pub fn quote_posix(token: &str) -> String {
    fn is_plain(s: &str) -> bool {
        !s.is_empty()
            && s.bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'/' | b':'))
    }
    fn quote(s: &str) -> String {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
    fn valid_login(name: &str) -> bool {
        let mut bytes = name.bytes();
        matches!(bytes.next(), Some(b) if b.is_ascii_lowercase() || b == b'_')
            && bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'-'))
    }

    if is_plain(token) {
        return token.to_string();
    }
    if let Some(rest) = token.strip_prefix('~') {
        let (user, path) = rest.split_once('/').map_or((rest, None), |(u, p)| (u, Some(p)));
        if user.is_empty() || valid_login(user) {
            return match path {
                Some(path) if is_plain(path) => token.to_string(),
                Some(path) => format!("~{user}/{}", quote(path)),
                None => token.to_string(),
            };
        }
    }
    quote(token)
}

/// Remote location of the deployed FUSE binary, gated by its content hash:
/// a new binary lands in a new directory, an unchanged one is found in place.
#[must_use]
pub fn remote_fuse_path(binary_hash: &ContentHash) -> String {
    format!(".cache/cdcsync/fuse/{}/cdcsync-fuse", &binary_hash.to_hex()[..12])
}

/// Ship the FUSE binary to the instance unless this exact build is already
/// there. Returns the remote path.
///
/// # Errors
/// Returns `Unavailable` with the remote stderr tail when a remote command
/// fails
pub fn deploy_fuse(
    factory: &dyn ProcessFactory,
    ssh_cmd: &str,
    scp_cmd: &str,
    user_host: &str,
    fuse_binary: &Path,
    timeout: Duration,
) -> Result<String> {
    let hash = ContentHash::from_file(fuse_binary)?;
    let remote_path = remote_fuse_path(&hash);

    let check = factory.run(&format!("{ssh_cmd} test -x {remote_path}"), timeout)?;
    if check.success() {
        debug!("fuse binary already deployed at {remote_path}");
        return Ok(remote_path);
    }

    info!("deploying fuse binary to {user_host}");
    let remote_dir = remote_path.rsplit_once('/').map_or(".", |(dir, _)| dir);
    let mkdir = factory.run(&format!("{ssh_cmd} mkdir -p {remote_dir}"), timeout)?;
    if !mkdir.success() {
        return Err(Error::unavailable(format!(
            "mkdir on {user_host} failed: {}",
            mkdir.stderr_tail()
        )));
    }

    let copy = factory.run(
        &format!(
            "{scp_cmd} {} {}:{remote_path}",
            quote_posix(&fuse_binary.to_string_lossy()),
            user_host,
        ),
        timeout,
    )?;
    if !copy.success() {
        return Err(Error::unavailable(format!(
            "deploy to {user_host} failed: {}",
            copy.stderr_tail()
        )));
    }

    let chmod = factory.run(&format!("{ssh_cmd} chmod +x {remote_path}"), timeout)?;
    if !chmod.success() {
        return Err(Error::unavailable(format!(
            "chmod on {user_host} failed: {}",
            chmod.stderr_tail()
        )));
    }
    Ok(remote_path)
}

/// Timing knobs the supervisor runs under
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub restart_cooldown: Duration,
}

/// Supervises the remote FUSE process for one session: launches it, watches
/// the heartbeat clock, restarts once per cooldown on failure, and tears it
/// down cooperatively when the shutdown flag is set.
pub struct FuseSupervisor {
    pub factory: Arc<dyn ProcessFactory>,
    /// Full launch command (ssh prefix + reverse forward + remote binary)
    pub launch_cmd: String,
    /// Command that asks the remote side to unmount cleanly
    pub unmount_cmd: String,
    pub shared: Arc<SessionShared>,
    pub shutdown: Arc<AtomicBool>,
    pub config: SupervisorConfig,
}

impl FuseSupervisor {
    /// Thread body. Returns when the session stops.
    pub fn run(self) {
        let mut last_restart: Option<Instant> = None;

        'lifecycle: loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let mut child = match self.factory.spawn(&self.launch_cmd) {
                Ok(child) => child,
                Err(err) => {
                    warn!("{}: fuse launch failed: {err}", self.shared.key);
                    self.shared.set_state(SessionState::Stopping);
                    break;
                }
            };
            *self.shared.fuse_pid.lock().unwrap() = child.pid();
            let launched = Instant::now();

            loop {
                if self.shutdown.load(Ordering::Relaxed) {
                    self.teardown(child.as_mut());
                    break 'lifecycle;
                }

                match child.try_wait() {
                    Ok(Some(code)) => {
                        warn!("{}: fuse exited with code {code}", self.shared.key);
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!("{}: wait failed: {err}", self.shared.key);
                        break;
                    }
                }

                match self.shared.heartbeat.age() {
                    None => {
                        if launched.elapsed() > self.config.start_timeout {
                            warn!("{}: no heartbeat within start timeout", self.shared.key);
                            let _ = child.kill();
                            break;
                        }
                    }
                    Some(age) if age > self.config.heartbeat_timeout => {
                        warn!("{}: heartbeat lost ({age:?})", self.shared.key);
                        let _ = child.kill();
                        break;
                    }
                    Some(_) => {
                        if self.shared.state() == SessionState::Starting {
                            info!("{}: healthy, running", self.shared.key);
                            self.shared.set_state(SessionState::Running);
                        } else if self.shared.state() == SessionState::Degraded {
                            self.shared.set_state(SessionState::Running);
                        }
                    }
                }

                std::thread::sleep(Duration::from_millis(200));
            }

            // The child is gone or unhealthy. One automatic restart per
            // cooldown; beyond that the operator must start the session again.
            *self.shared.fuse_pid.lock().unwrap() = None;
            self.shared.set_state(SessionState::Degraded);
            let can_restart =
                last_restart.is_none_or(|t| t.elapsed() >= self.config.restart_cooldown);
            if !can_restart || self.shutdown.load(Ordering::Relaxed) {
                warn!("{}: giving up, stopping", self.shared.key);
                self.shared.set_state(SessionState::Stopping);
                break;
            }
            info!("{}: restarting fuse", self.shared.key);
            last_restart = Some(Instant::now());
        }
    }

    /// Cooperative stop: ask for a clean unmount, then force-kill after the
    /// stop timeout.
    fn teardown(&self, child: &mut dyn ChildHandle) {
        self.shared.set_state(SessionState::Stopping);
        if let Err(err) = self
            .factory
            .run(&self.unmount_cmd, self.config.stop_timeout)
        {
            debug!("{}: unmount request failed: {err}", self.shared.key);
        }

        let deadline = Instant::now() + self.config.stop_timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(100))
                }
                _ => {
                    let _ = child.kill();
                    break;
                }
            }
        }
        *self.shared.fuse_pid.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain_token_untouched() {
        assert_eq!(quote_posix("/home/dev/project"), "/home/dev/project");
        assert_eq!(quote_posix("file-1.2.txt"), "file-1.2.txt");
    }

    #[test]
    fn test_quote_spaces_and_quotes() {
        assert_eq!(quote_posix("my dir/file"), "'my dir/file'");
        assert_eq!(quote_posix("it's"), r"'it'\''s'");
        assert_eq!(quote_posix(r"back\slash"), r"'back\slash'");
    }

    #[test]
    fn test_tilde_user_preserved() {
        assert_eq!(quote_posix("~deploy/assets"), "~deploy/assets");
        assert_eq!(quote_posix("~deploy/has space"), "~deploy/'has space'");
        assert_eq!(quote_posix("~/projects"), "~/projects");
        // Not a valid login name: quote the whole token
        assert_eq!(quote_posix("~Not A User/x"), "'~Not A User/x'");
    }

    #[test]
    fn test_stderr_tail() {
        let out = CommandOutput {
            stdout: String::new(),
            stderr: "one\ntwo\nthree\nfour\nfive".to_string(),
            exit_code: 1,
        };
        assert_eq!(out.stderr_tail(), "three\nfour\nfive");
    }

    #[test]
    fn test_system_factory_runs_and_times_out() {
        let factory = SystemProcessFactory;
        let ok = factory
            .run("echo out; echo err >&2", Duration::from_secs(5))
            .unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout.trim(), "out");
        assert_eq!(ok.stderr.trim(), "err");

        let err = factory
            .run("sleep 5", Duration::from_millis(100))
            .unwrap_err();
        assert_eq!(err.kind(), cdcsync_core::ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn test_system_factory_spawn_and_kill() {
        let factory = SystemProcessFactory;
        let mut child = factory.spawn("sleep 30").unwrap();
        assert!(child.pid().is_some());
        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        // Give the OS a moment to reap.
        std::thread::sleep(Duration::from_millis(100));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_remote_fuse_path_changes_with_binary() {
        let a = remote_fuse_path(&ContentHash::from_bytes(b"build one"));
        let b = remote_fuse_path(&ContentHash::from_bytes(b"build two"));
        assert_ne!(a, b);
        assert!(a.ends_with("/cdcsync-fuse"));
    }
}
