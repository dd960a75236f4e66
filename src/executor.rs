use crate::error::{Error, Result};
use openssh::{KnownHosts, Session};
use std::process::Stdio;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

/// Captured result of one kubectl invocation. A non-zero exit is not an
/// error here; callers decide what a failed command means.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

enum Transport {
    /// kubectl as a local subprocess.
    Local,
    /// kubectl on a remote host, over one multiplexed SSH session. The
    /// session is established on first use and shared by every command.
    Tunnel {
        host: String,
        session: OnceCell<Session>,
    },
}

/// Runs cluster CLI commands against a context. The transport is chosen once
/// at startup from the configuration.
pub struct Kubectl {
    transport: Transport,
}

impl Kubectl {
    pub fn local() -> Self {
        Self {
            transport: Transport::Local,
        }
    }

    pub fn tunneled(host: &str) -> Self {
        Self {
            transport: Transport::Tunnel {
                host: host.to_string(),
                session: OnceCell::new(),
            },
        }
    }

    /// Execute `kubectl --context <context> <args>`, feeding `input` to its
    /// stdin when present.
    pub async fn execute<I, S>(
        &self,
        context: &str,
        args: I,
        input: Option<&str>,
    ) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        match &self.transport {
            Transport::Local => run_local(context, &args, input).await,
            Transport::Tunnel { host, session } => {
                let session = session
                    .get_or_try_init(|| async {
                        debug!("Opening SSH session to {}", host);
                        Session::connect(host, KnownHosts::Add).await
                    })
                    .await
                    .map_err(|e| Error::RemoteCommand(format!("ssh {host}: {e}")))?;
                run_tunneled(session, host, context, &args, input).await
            }
        }
    }
}

async fn run_local(context: &str, args: &[String], input: Option<&str>) -> Result<CommandOutput> {
    debug!("Running kubectl --context {} {:?}", context, args);
    let mut command = Command::new("kubectl");
    command
        .arg("--context")
        .arg(context)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    spawn_and_capture(command, input).await
}

/// Spawn the prepared command and drive the stdin write concurrently with
/// output collection; writing first and reading second can deadlock once a
/// pipe buffer fills up.
async fn spawn_and_capture(
    mut command: Command,
    input: Option<&str>,
) -> Result<CommandOutput> {
    let mut child = command
        .spawn()
        .map_err(|e| Error::RemoteCommand(e.to_string()))?;
    let stdin = child.stdin.take();

    let write = write_input(stdin, input);
    let (write_result, output_result) = tokio::join!(write, child.wait_with_output());
    write_result?;
    let output = output_result?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        success: output.status.success(),
    })
}

async fn run_tunneled(
    session: &Session,
    host: &str,
    context: &str,
    args: &[String],
    input: Option<&str>,
) -> Result<CommandOutput> {
    debug!(
        "Running kubectl --context {} {:?} on {}",
        context, args, host
    );
    let mut command = session.command("kubectl");
    command.arg("--context").arg(context);
    for arg in args {
        command.arg(arg);
    }
    command
        .stdin(if input.is_some() {
            openssh::Stdio::piped()
        } else {
            openssh::Stdio::null()
        })
        .stdout(openssh::Stdio::piped())
        .stderr(openssh::Stdio::piped());

    let mut child = command
        .spawn()
        .await
        .map_err(|e| Error::RemoteCommand(format!("ssh {host}: {e}")))?;
    let stdin = child.stdin().take();

    let write = write_input(stdin, input);
    let (write_result, output_result) = tokio::join!(write, child.wait_with_output());
    write_result?;
    let output =
        output_result.map_err(|e| Error::RemoteCommand(format!("ssh {host}: {e}")))?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        success: output.status.success(),
    })
}

/// Write `input` and signal end-of-input. A broken pipe is tolerated; the
/// command may legitimately exit without draining its stdin.
async fn write_input<W>(stdin: Option<W>, input: Option<&str>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (Some(mut stdin), Some(data)) = (stdin, input) else {
        return Ok(());
    };
    match stdin.write_all(data.as_bytes()).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    match stdin.shutdown().await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(program: &str, args: &[&str], input: Option<&str>) -> Command {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_status() {
        let out = spawn_and_capture(capture("sh", &["-c", "echo hi; echo oops >&2"], None), None)
            .await
            .expect("spawn");
        assert!(out.success);
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.stderr, "oops\n");
    }

    #[tokio::test]
    async fn feeds_input_through_stdin() {
        let input = "line one\nline two\n";
        let out = spawn_and_capture(capture("cat", &[], Some(input)), Some(input))
            .await
            .expect("spawn");
        assert!(out.success);
        assert_eq!(out.stdout, input);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_raised() {
        let out = spawn_and_capture(capture("sh", &["-c", "exit 3"], None), None)
            .await
            .expect("spawn");
        assert!(!out.success);
    }

    #[tokio::test]
    async fn missing_program_is_a_remote_command_error() {
        let err = spawn_and_capture(capture("definitely-not-a-binary", &[], None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteCommand(_)));
    }

    #[tokio::test]
    async fn survives_commands_that_ignore_stdin() {
        let input = "x".repeat(1024 * 1024);
        let out = spawn_and_capture(capture("true", &[], Some(&input)), Some(&input))
            .await
            .expect("no deadlock, no broken-pipe error");
        assert!(out.stdout.is_empty());
    }
}
