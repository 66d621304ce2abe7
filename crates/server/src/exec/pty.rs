//! Pseudo-terminal executor.
//!
//! Runs the exec command in a local PTY and streams that PTY to the peer. In
//! `Kubectl` mode the local command is `kubectl exec -i -t ...`, so the shell
//! itself runs inside the target container; in `Local` mode the shell runs on
//! this host, which is handy for development without a cluster.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::TerminalSize;
use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;

use super::{ExecError, ExecProcess, ExecTarget, PtyPeer, RemoteExecutor};
use crate::config::{ExecBackend, ExecConfig};

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Output chunks buffered between the PTY reader thread and the socket.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Exit codes meaning "the command could not be executed".
const EXIT_NOT_EXECUTABLE: u32 = 126;
const EXIT_NOT_FOUND: u32 = 127;

/// How the exec command reaches the workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecMode {
    /// `kubectl exec` into the target container.
    Kubectl {
        program: PathBuf,
        kubeconfig: Option<PathBuf>,
        context: Option<String>,
    },
    /// Run the shell on this host, ignoring the target.
    Local,
}

/// Executor that runs every command in a fresh PTY.
#[derive(Debug, Clone)]
pub struct PtyExecutor {
    mode: ExecMode,
    start_probe: Duration,
}

impl PtyExecutor {
    /// Creates an executor.
    ///
    /// `start_probe` is how long a freshly spawned command is watched for an
    /// immediate "not found" exit before it counts as started.
    pub fn new(mode: ExecMode, start_probe: Duration) -> Self {
        Self { mode, start_probe }
    }

    /// Creates an executor from the `[exec]` configuration section.
    pub fn from_config(config: &ExecConfig) -> Self {
        let mode = match config.mode {
            ExecBackend::Kubectl => ExecMode::Kubectl {
                program: config.kubectl.clone(),
                kubeconfig: config.kubeconfig.clone(),
                context: config.context.clone(),
            },
            ExecBackend::Local => ExecMode::Local,
        };
        Self::new(mode, Duration::from_millis(config.start_probe_ms))
    }

    /// Builds the full argument vector for running `command` in `target`.
    pub fn argv(&self, target: &ExecTarget, command: &[String]) -> Vec<String> {
        match &self.mode {
            ExecMode::Kubectl {
                program,
                kubeconfig,
                context,
            } => {
                let mut argv = vec![program.to_string_lossy().into_owned()];
                if let Some(kubeconfig) = kubeconfig {
                    argv.push("--kubeconfig".to_string());
                    argv.push(kubeconfig.to_string_lossy().into_owned());
                }
                if let Some(context) = context {
                    argv.push("--context".to_string());
                    argv.push(context.clone());
                }
                argv.extend(
                    [
                        "exec",
                        "-i",
                        "-t",
                        "-n",
                        &target.namespace,
                        &target.pod,
                        "-c",
                        &target.container,
                        "--",
                    ]
                    .iter()
                    .map(|s| s.to_string()),
                );
                argv.extend(command.iter().cloned());
                argv
            }
            ExecMode::Local => command.to_vec(),
        }
    }

    async fn spawn(
        &self,
        target: &ExecTarget,
        command: &[String],
        size: TerminalSize,
    ) -> Result<Box<dyn ExecProcess>, ExecError> {
        let command_line = command.join(" ");
        let argv = self.argv(target, command);
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecError::start(command_line, "empty command"));
        };

        if self.mode == ExecMode::Local {
            which::which(program).map_err(|e| ExecError::start(&command_line, e))?;
        }

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| ExecError::start(&command_line, e))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map(ReapOnDrop::new)
            .map_err(|e| ExecError::start(&command_line, e))?;
        // Only the child may hold the slave, so EOF on the master means it exited.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ExecError::start(&command_line, e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ExecError::start(&command_line, e))?;

        if !self.start_probe.is_zero() {
            tokio::time::sleep(self.start_probe).await;
            let exited = child
                .try_wait()
                .map_err(|e| ExecError::start(&command_line, e))?;
            if let Some(code) = exited.filter(|code| is_not_runnable(*code)) {
                return Err(ExecError::start(
                    &command_line,
                    format!("exited with code {code}"),
                ));
            }
        }

        tracing::debug!(
            command = %command_line,
            workload = %target,
            pid = ?child.process_id(),
            "Spawned exec command"
        );

        Ok(Box::new(PtyProcess {
            command: command_line,
            master: pair.master,
            child,
            reader,
            writer,
        }))
    }
}

impl RemoteExecutor for PtyExecutor {
    fn start<'a>(
        &'a self,
        target: &'a ExecTarget,
        command: &'a [String],
        size: TerminalSize,
    ) -> BoxFuture<'a, Result<Box<dyn ExecProcess>, ExecError>> {
        Box::pin(self.spawn(target, command, size))
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A command running in a PTY.
struct PtyProcess {
    command: String,
    master: Box<dyn MasterPty + Send>,
    child: ReapOnDrop,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

/// Owns the child until it has been waited on.
///
/// Dropped while still holding it, the child is killed and reaped on the
/// blocking pool so it never lingers as a zombie.
struct ReapOnDrop {
    child: Option<Box<dyn Child + Send + Sync>>,
    exit_code: Option<u32>,
}

impl ReapOnDrop {
    fn new(child: Box<dyn Child + Send + Sync>) -> Self {
        Self {
            child: Some(child),
            exit_code: None,
        }
    }

    fn process_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.process_id())
    }

    /// Polls for an exit code without blocking.
    fn try_wait(&mut self) -> std::io::Result<Option<u32>> {
        if let Some(child) = self.child.as_mut() {
            if let Some(status) = child.try_wait()? {
                self.exit_code = Some(status.exit_code());
                self.child = None;
            }
        }
        Ok(self.exit_code)
    }

    /// Waits for the child to exit.
    async fn wait(&mut self, command: &str) -> Result<u32, ExecError> {
        let Some(mut child) = self.child.take() else {
            return self
                .exit_code
                .ok_or_else(|| ExecError::Stream(format!("`{command}` was already reaped")));
        };
        // The blocking task owns the child now and reaps it even if this
        // future is dropped.
        let status = tokio::task::spawn_blocking(move || child.wait())
            .await
            .map_err(|e| ExecError::Stream(format!("wait task failed: {e}")))?
            .map_err(|e| ExecError::Stream(format!("failed to wait for `{command}`: {e}")))?;
        let code = status.exit_code();
        self.exit_code = Some(code);
        Ok(code)
    }
}

impl Drop for ReapOnDrop {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.process_id();
        let reap = move || {
            // kill() may sleep while the child handles SIGHUP.
            if let Err(e) = child.kill() {
                tracing::debug!(?pid, error = %e, "Failed to kill exec command");
            }
            match child.wait() {
                Ok(status) => tracing::debug!(?pid, code = status.exit_code(), "Reaped exec command"),
                Err(e) => tracing::warn!(?pid, error = %e, "Failed to reap exec command"),
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(reap);
            }
            Err(_) => {
                std::thread::spawn(reap);
            }
        }
    }
}

impl ExecProcess for PtyProcess {
    fn stream(
        self: Box<Self>,
        peer: Arc<dyn PtyPeer>,
    ) -> BoxFuture<'static, Result<u32, ExecError>> {
        Box::pin(async move {
            let PtyProcess {
                command,
                master,
                mut child,
                reader,
                writer,
            } = *self;

            let input_seen = Arc::new(AtomicBool::new(false));

            // PTY -> peer. The reader blocks, so it gets its own thread.
            let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);
            tokio::task::spawn_blocking(move || pump_output(reader, output_tx));

            // peer -> PTY
            let input = AbortOnDropHandle::new(tokio::spawn(pump_input(
                Arc::clone(&peer),
                writer,
                command.clone(),
                Arc::clone(&input_seen),
            )));

            // resize requests -> PTY
            let resize = AbortOnDropHandle::new(tokio::spawn(pump_resize(
                Arc::clone(&peer),
                master,
            )));

            while let Some(chunk) = output_rx.recv().await {
                peer.write(&chunk).await?;
            }

            input.abort();
            resize.abort();

            let code = child.wait(&command).await?;
            tracing::debug!(command = %command, code, "Exec command exited");

            // kubectl can take longer than the start probe to report a missing
            // shell. Until the user has typed anything, those codes still mean
            // the command never ran.
            if is_not_runnable(code) && !input_seen.load(Ordering::Acquire) {
                return Err(ExecError::start(
                    command,
                    format!("exited with code {code} before any input"),
                ));
            }
            Ok(code)
        })
    }
}

fn is_not_runnable(code: u32) -> bool {
    code == EXIT_NOT_EXECUTABLE || code == EXIT_NOT_FOUND
}

fn pump_output(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Vec<u8>>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            // Linux reports EIO on the master once the child side is gone.
            Err(e) => {
                tracing::trace!(error = %e, "PTY read ended");
                break;
            }
        }
    }
}

async fn pump_input(
    peer: Arc<dyn PtyPeer>,
    writer: Box<dyn Write + Send>,
    command: String,
    input_seen: Arc<AtomicBool>,
) {
    let writer = Arc::new(Mutex::new(writer));
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match peer.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                input_seen.store(true, Ordering::Release);
                n
            }
            Err(e) => {
                tracing::debug!(command = %command, error = %e, "Reading terminal input failed");
                break;
            }
        };

        let chunk = buffer[..n].to_vec();
        let writer = Arc::clone(&writer);
        let written = tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            writer.write_all(&chunk)?;
            writer.flush()
        })
        .await;

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(command = %command, error = %e, "Writing to PTY failed");
                break;
            }
            Err(e) => {
                tracing::error!(command = %command, error = %e, "PTY write task panicked");
                break;
            }
        }
    }
}

async fn pump_resize(peer: Arc<dyn PtyPeer>, master: Box<dyn MasterPty + Send>) {
    while let Some(size) = peer.next_resize().await {
        if let Err(e) = master.resize(pty_size(size)) {
            tracing::warn!(cols = size.cols, rows = size.rows, error = %e, "Failed to resize PTY");
        } else {
            tracing::debug!(cols = size.cols, rows = size.rows, "Resized PTY");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TransportError;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::time::timeout;

    /// Peer fed from a script of input chunks that records all output.
    struct ScriptedPeer {
        input: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
        output: StdMutex<Vec<u8>>,
    }

    impl ScriptedPeer {
        fn new() -> (Arc<Self>, mpsc::Sender<Vec<u8>>) {
            let (tx, rx) = mpsc::channel(8);
            let peer = Arc::new(Self {
                input: AsyncMutex::new(rx),
                output: StdMutex::new(Vec::new()),
            });
            (peer, tx)
        }

        fn output(&self) -> String {
            String::from_utf8_lossy(&self.output.lock().unwrap()).into_owned()
        }
    }

    impl PtyPeer for ScriptedPeer {
        fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize, TransportError>> {
            Box::pin(async move {
                match self.input.lock().await.recv().await {
                    Some(chunk) => {
                        let n = chunk.len().min(buf.len());
                        buf[..n].copy_from_slice(&chunk[..n]);
                        Ok(n)
                    }
                    None => Ok(0),
                }
            })
        }

        fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<usize, TransportError>> {
            Box::pin(async move {
                self.output.lock().unwrap().extend_from_slice(data);
                Ok(data.len())
            })
        }

        fn toast<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }

        fn next_resize(&self) -> BoxFuture<'_, Option<TerminalSize>> {
            Box::pin(async { None })
        }

        fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn local() -> PtyExecutor {
        PtyExecutor::new(ExecMode::Local, Duration::from_millis(50))
    }

    fn target() -> ExecTarget {
        ExecTarget::new("default", "web-1", "app")
    }

    #[test]
    fn test_kubectl_argv() {
        let executor = PtyExecutor::new(
            ExecMode::Kubectl {
                program: PathBuf::from("kubectl"),
                kubeconfig: Some(PathBuf::from("/home/dev/.kube/config")),
                context: Some("staging".to_string()),
            },
            Duration::ZERO,
        );

        let argv = executor.argv(&target(), &["bash".to_string()]);
        assert_eq!(
            argv,
            vec![
                "kubectl",
                "--kubeconfig",
                "/home/dev/.kube/config",
                "--context",
                "staging",
                "exec",
                "-i",
                "-t",
                "-n",
                "default",
                "web-1",
                "-c",
                "app",
                "--",
                "bash",
            ]
        );
    }

    #[test]
    fn test_local_argv_is_the_command() {
        let argv = local().argv(&target(), &["sh".to_string()]);
        assert_eq!(argv, vec!["sh"]);
    }

    #[tokio::test]
    async fn test_missing_shell_fails_to_start() {
        let result = local()
            .start(
                &target(),
                &["definitely-not-a-shell-7f3a".to_string()],
                TerminalSize::default(),
            )
            .await;

        match result {
            Err(e) => assert!(e.is_start_failure(), "unexpected error: {e}"),
            Ok(_) => panic!("missing shell should not start"),
        }
    }

    #[tokio::test]
    async fn test_shell_streams_until_exit() {
        let process = local()
            .start(&target(), &["/bin/sh".to_string()], TerminalSize::default())
            .await
            .unwrap();
        let (peer, input) = ScriptedPeer::new();

        input
            .send(b"echo pty_stream_marker; exit 3\n".to_vec())
            .await
            .unwrap();

        let code = timeout(Duration::from_secs(10), process.stream(peer.clone()))
            .await
            .expect("shell did not exit")
            .unwrap();

        assert_eq!(code, 3);
        assert!(peer.output().contains("pty_stream_marker"));
    }

    #[tokio::test]
    async fn test_late_not_found_exit_is_a_start_failure() {
        let process = local()
            .start(
                &target(),
                &[
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "sleep 0.3; exit 127".to_string(),
                ],
                TerminalSize::default(),
            )
            .await
            .expect("the probe window closes before the command exits");
        let (peer, _input) = ScriptedPeer::new();

        let result = timeout(Duration::from_secs(10), process.stream(peer))
            .await
            .expect("command did not exit");

        match result {
            Err(e) => assert!(e.is_start_failure(), "unexpected error: {e}"),
            Ok(code) => panic!("expected a start failure, got exit code {code}"),
        }
    }

    #[tokio::test]
    async fn test_not_found_exit_after_input_is_an_exit() {
        let process = local()
            .start(&target(), &["/bin/sh".to_string()], TerminalSize::default())
            .await
            .unwrap();
        let (peer, input) = ScriptedPeer::new();

        input.send(b"exit 127\n".to_vec()).await.unwrap();

        let code = timeout(Duration::from_secs(10), process.stream(peer))
            .await
            .expect("shell did not exit")
            .unwrap();
        assert_eq!(code, 127);
    }

    #[tokio::test]
    async fn test_dropping_stream_kills_command() {
        let process = local()
            .start(&target(), &["/bin/sh".to_string()], TerminalSize::default())
            .await
            .unwrap();
        let (peer, _input) = ScriptedPeer::new();

        let streaming = tokio::spawn(process.stream(peer));
        tokio::time::sleep(Duration::from_millis(100)).await;
        streaming.abort();

        let joined = timeout(Duration::from_secs(5), streaming).await.unwrap();
        assert!(joined.unwrap_err().is_cancelled());
    }

    /// Extracts the pid printed by `echo child_pid=$$`.
    fn printed_pid(output: &str) -> Option<u32> {
        output.split("child_pid=").skip(1).find_map(|rest| {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        })
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_stream_reaps_child() {
        let mut pids = Vec::new();

        for _ in 0..3 {
            let process = local()
                .start(&target(), &["/bin/sh".to_string()], TerminalSize::default())
                .await
                .unwrap();
            let (peer, input) = ScriptedPeer::new();
            input.send(b"echo child_pid=$$\n".to_vec()).await.unwrap();

            let streaming = tokio::spawn(process.stream(peer.clone()));
            let pid = timeout(Duration::from_secs(5), async {
                loop {
                    if let Some(pid) = printed_pid(&peer.output()) {
                        return pid;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("shell never printed its pid");

            streaming.abort();
            let _ = streaming.await;
            pids.push(pid);
        }

        // A zombie keeps its /proc entry until its parent waits on it.
        timeout(Duration::from_secs(5), async {
            while pids
                .iter()
                .any(|pid| std::path::Path::new(&format!("/proc/{pid}")).exists())
            {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("killed shells were left as zombies");
    }
}
