//! Runs user shell directives (`!cmd`) one at a time.
//!
//! Combined stdout and stderr are streamed into a `CommandOutputBlock` as
//! they arrive.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kode_core::{ConversationStore, Error};

/// Exit code reported for commands terminated by a signal.
pub const SIGNAL_EXIT_CODE: i32 = 130;

struct RunningCommand {
    id: u64,
    command: String,
    kill: CancellationToken,
}

struct RunnerState {
    next_id: u64,
    current: Option<RunningCommand>,
}

pub struct ShellCommandRunner {
    store: Arc<ConversationStore>,
    working_dir: Option<PathBuf>,
    state: Mutex<RunnerState>,
}

impl ShellCommandRunner {
    pub fn new(store: Arc<ConversationStore>) -> Self {
        Self {
            store,
            working_dir: None,
            state: Mutex::new(RunnerState {
                next_id: 0,
                current: None,
            }),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Kill the running command, if any. The running flag clears and its
    /// block is closed with [`SIGNAL_EXIT_CODE`] immediately; the aborted run
    /// writes nothing more to the store.
    pub fn abort(&self) {
        let mut state = self.lock();
        if let Some(running) = state.current.take() {
            info!(id = running.id, "Aborting shell command");
            running.kill.cancel();
            self.store.complete_command_output(&running.command, SIGNAL_EXIT_CODE);
        }
    }

    /// Run `f` against the store only while run `id` still owns the runner.
    fn publish(&self, id: u64, f: impl FnOnce(&ConversationStore)) {
        let state = self.lock();
        if state.current.as_ref().map(|r| r.id) == Some(id) {
            f(&self.store);
        }
    }

    /// Run `command` through the platform shell and return its exit code.
    ///
    /// Fails with [`Error::Busy`] if another command is still running. A
    /// failure to spawn is reported in the output block with exit code 1.
    pub async fn execute(&self, command: &str) -> Result<i32, Error> {
        let (id, kill) = {
            let mut state = self.lock();
            if state.current.is_some() {
                return Err(Error::Busy);
            }
            state.next_id += 1;
            let kill = CancellationToken::new();
            state.current = Some(RunningCommand {
                id: state.next_id,
                command: command.to_string(),
                kill: kill.clone(),
            });
            self.store.add_command_output_message(command);
            (state.next_id, kill)
        };

        info!(id, command, "Running shell command");
        let exit_code = self.run(id, command, &kill).await;
        debug!(id, exit_code, "Shell command finished");

        let mut state = self.lock();
        if state.current.as_ref().map(|r| r.id) == Some(id) {
            self.store.complete_command_output(command, exit_code);
            state.current = None;
        }
        Ok(exit_code)
    }

    async fn run(&self, id: u64, command: &str, kill: &CancellationToken) -> i32 {
        let mut cmd = shell_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut output = String::new();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command, error = %e, "Failed to spawn shell command");
                output.push_str(&format!("Error: {}\n", e));
                self.publish(id, |store| {
                    store.update_command_output(command, &output);
                });
                return 1;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx.clone()));
        }
        drop(tx);

        let mut bytes = Vec::new();
        loop {
            tokio::select! {
                _ = kill.cancelled() => break,
                chunk = rx.recv() => match chunk {
                    Some(chunk) => {
                        bytes.extend_from_slice(&chunk);
                        output = String::from_utf8_lossy(&bytes).into_owned();
                        self.publish(id, |store| {
                            store.update_command_output(command, &output);
                        });
                    }
                    None => break,
                },
            }
        }

        // The child may outlive its pipes, so the kill is watched until exit.
        let status = tokio::select! {
            biased;
            status = child.wait() => status,
            _ = kill.cancelled() => {
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "Failed to kill shell command");
                }
                child.wait().await
            }
        };

        match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!(error = %e, "Failed to wait for shell command");
                output.push_str(&format!("Error: {}\n", e));
                self.publish(id, |store| {
                    store.update_command_output(command, &output);
                });
                1
            }
        }
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

async fn pump<R>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal().is_some() {
            return SIGNAL_EXIT_CODE;
        }
    }
    status.code().unwrap_or(0)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use kode_core::{Block, CommandOutputBlock};
    use std::time::Duration;

    fn last_output(store: &ConversationStore) -> CommandOutputBlock {
        let messages = store.messages();
        messages
            .iter()
            .rev()
            .flat_map(|m| m.blocks.iter())
            .find_map(|b| match b {
                Block::CommandOutput(out) => Some(out.clone()),
                _ => None,
            })
            .unwrap()
    }

    async fn wait_until_running(runner: &ShellCommandRunner) {
        for _ in 0..200 {
            if runner.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("command never started");
    }

    #[tokio::test]
    async fn test_execute_captures_output() {
        let store = Arc::new(ConversationStore::new());
        let runner = ShellCommandRunner::new(store.clone());

        let code = runner.execute("echo hello").await.unwrap();
        assert_eq!(code, 0);

        let block = last_output(&store);
        assert_eq!(block.command, "echo hello");
        assert_eq!(block.output, "hello\n");
        assert!(!block.is_running);
        assert_eq!(block.exit_code, Some(0));
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_combined() {
        let store = Arc::new(ConversationStore::new());
        let runner = ShellCommandRunner::new(store.clone());

        runner.execute("echo out; echo err 1>&2").await.unwrap();
        let output = last_output(&store).output;
        assert!(output.contains("out\n"));
        assert!(output.contains("err\n"));
    }

    #[tokio::test]
    async fn test_exit_code_propagated() {
        let store = Arc::new(ConversationStore::new());
        let runner = ShellCommandRunner::new(store.clone());
        assert_eq!(runner.execute("exit 3").await.unwrap(), 3);
        assert_eq!(runner.execute("nonexistent_command_xyz_123").await.unwrap(), 127);
    }

    #[tokio::test]
    async fn test_signal_terminated_is_130() {
        let store = Arc::new(ConversationStore::new());
        let runner = ShellCommandRunner::new(store);
        assert_eq!(runner.execute("kill -9 $$").await.unwrap(), SIGNAL_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_spawn_error_reported_as_exit_1() {
        let store = Arc::new(ConversationStore::new());
        let runner =
            ShellCommandRunner::new(store.clone()).with_working_dir("/definitely/not/a/dir/xyz");

        let code = runner.execute("echo hi").await.unwrap();
        assert_eq!(code, 1);
        let block = last_output(&store);
        assert!(block.output.starts_with("Error:"));
        assert_eq!(block.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_second_execute_rejected_and_abort_clears() {
        let store = Arc::new(ConversationStore::new());
        let runner = Arc::new(ShellCommandRunner::new(store.clone()));

        let background = runner.clone();
        let handle = tokio::spawn(async move { background.execute("sleep 30").await });
        wait_until_running(&runner).await;

        assert!(matches!(runner.execute("echo again").await, Err(Error::Busy)));

        runner.abort();
        assert!(!runner.is_running());

        let code = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(code, SIGNAL_EXIT_CODE);
        assert_eq!(last_output(&store).exit_code, Some(SIGNAL_EXIT_CODE));
    }

    fn command_blocks(store: &ConversationStore) -> Vec<CommandOutputBlock> {
        store
            .messages()
            .iter()
            .flat_map(|m| m.blocks.iter())
            .filter_map(|b| match b {
                Block::CommandOutput(out) => Some(out.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_abort_kills_command_with_closed_output() {
        let store = Arc::new(ConversationStore::new());
        let runner = Arc::new(ShellCommandRunner::new(store.clone()));

        let background = runner.clone();
        let handle = tokio::spawn(async move {
            background.execute("exec >/dev/null 2>&1; sleep 30").await
        });
        wait_until_running(&runner).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        runner.abort();
        let code = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(code, SIGNAL_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_aborted_run_leaves_next_block_alone() {
        let store = Arc::new(ConversationStore::new());
        let runner = Arc::new(ShellCommandRunner::new(store.clone()));

        let first = runner.clone();
        let first = tokio::spawn(async move { first.execute("sleep 30").await });
        wait_until_running(&runner).await;
        runner.abort();

        let second = runner.clone();
        let second = tokio::spawn(async move { second.execute("sleep 30").await });
        wait_until_running(&runner).await;

        let code = tokio::time::timeout(Duration::from_secs(5), first)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(code, SIGNAL_EXIT_CODE);

        let blocks = command_blocks(&store);
        assert_eq!(blocks.len(), 2);
        assert!(!blocks[0].is_running);
        assert_eq!(blocks[0].exit_code, Some(SIGNAL_EXIT_CODE));
        assert!(blocks[1].is_running);
        assert_eq!(blocks[1].exit_code, None);

        runner.abort();
        tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(command_blocks(&store)[1].exit_code, Some(SIGNAL_EXIT_CODE));
    }
}
