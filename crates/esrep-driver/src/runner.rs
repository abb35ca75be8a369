use crate::{CancelToken, DriverError};
use esrep_types::SshSection;
use std::io::{ErrorKind, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, Stdio};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.rc == 0
    }

    /// stderr, or stdout when the helper wrote nothing to stderr.
    pub fn error_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_owned()
        } else {
            stderr.to_owned()
        }
    }
}

/// Remote end of an SSH invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub options: SshSection,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, options: SshSection) -> Self {
        Self {
            host: host.into(),
            options,
        }
    }

    /// `ssh -o BatchMode=yes ... user@host`
    pub fn prefix(&self) -> Vec<String> {
        let mut argv = vec![self.options.program.clone()];
        for option in [
            "BatchMode=yes".to_owned(),
            format!("ConnectTimeout={}", self.options.connect_timeout),
            "StrictHostKeyChecking=no".to_owned(),
        ]
        .into_iter()
        .chain(self.options.extra_options.iter().cloned())
        {
            argv.push("-o".to_owned());
            argv.push(option);
        }
        argv.push(format!("{}@{}", self.options.user, self.host));
        argv
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Target {
    #[default]
    Local,
    Ssh(SshTarget),
}

impl Target {
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Local => None,
            Self::Ssh(ssh) => Some(&ssh.host),
        }
    }
}

/// Runs helper commands on one target.
///
/// Children are placed in their own process group so a terminal Ctrl+C only
/// reaches esrep, which then stops at the next yield point instead of leaving
/// a half-finished `zfs receive` behind.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    target: Target,
    cancel: CancelToken,
}

impl CommandRunner {
    pub fn new(target: Target, cancel: CancelToken) -> Self {
        Self { target, cancel }
    }

    pub fn local(cancel: CancelToken) -> Self {
        Self::new(Target::Local, cancel)
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Full argv as it will be spawned, including the SSH prefix.
    pub fn command_line(&self, argv: &[String]) -> Vec<String> {
        match &self.target {
            Target::Local => argv.to_vec(),
            Target::Ssh(ssh) => {
                let mut line = ssh.prefix();
                // the remote side hands the words to a shell
                line.extend(argv.iter().map(|arg| shell_quote(arg)));
                line
            }
        }
    }

    pub fn execute(
        &self,
        argv: &[String],
        stderr_to_stdout: bool,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, DriverError> {
        self.cancel.check()?;

        let line = self.command_line(argv);
        let Some((program, args)) = line.split_first() else {
            return Err(DriverError::Output("empty command line".to_owned()));
        };
        debug!("running: {}", line.join(" "));

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command.spawn().map_err(|source| DriverError::Spawn {
            program: program.clone(),
            source,
        })?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            match pipe.write_all(input) {
                // the helper may exit before reading its input; its status tells why
                Err(e) if e.kind() != ErrorKind::BrokenPipe => return Err(e.into()),
                _ => {}
            }
        }
        let output = child.wait_with_output()?;

        let rc = output
            .status
            .code()
            .or_else(|| output.status.signal().map(|signal| 128 + signal))
            .unwrap_or(-1);
        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if stderr_to_stdout {
            stdout.push_str(&stderr);
            stderr.clear();
        }
        debug!("exit code {rc}");

        Ok(CommandOutput { rc, stdout, stderr })
    }

    /// Run and return trimmed stdout, failing on a non-zero exit.
    pub fn run(&self, argv: &[String], stdin: Option<&[u8]>) -> Result<String, DriverError> {
        Self::checked(self.execute(argv, false, stdin)?)
    }

    /// Like `run`, with stderr folded into the returned output.
    pub fn run_merged(&self, argv: &[String]) -> Result<String, DriverError> {
        Self::checked(self.execute(argv, true, None)?)
    }

    fn checked(output: CommandOutput) -> Result<String, DriverError> {
        if output.success() {
            Ok(output.stdout.trim().to_owned())
        } else {
            Err(DriverError::command(output.rc, output.error_message()))
        }
    }
}

/// Single-quote a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/-_.,:=@%+".contains(c));
    if plain {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| (*w).to_owned()).collect()
    }

    #[test]
    fn ssh_prefix_uses_batch_mode() {
        let target = SshTarget::new("node02", SshSection::default());
        assert_eq!(
            target.prefix(),
            argv(&[
                "ssh",
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                "-o",
                "StrictHostKeyChecking=no",
                "root@node02"
            ])
        );
    }

    #[test]
    fn remote_words_are_quoted() {
        let runner = CommandRunner::new(
            Target::Ssh(SshTarget::new("node02", SshSection::default())),
            CancelToken::new(),
        );
        let line = runner.command_line(&argv(&["esrep.sh", "_zfs_snap", "zones/a@x", "it's"]));
        assert_eq!(line[line.len() - 4..], argv(&["esrep.sh", "_zfs_snap", "zones/a@x", r"'it'\''s'"]));
    }

    #[test]
    fn quoting_rules() {
        assert_eq!(shell_quote("zones/a@rs-1-5"), "zones/a@rs-1-5");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
    }

    #[test]
    fn run_returns_trimmed_stdout() {
        let runner = CommandRunner::local(CancelToken::new());
        let out = runner.run(&argv(&["sh", "-c", "echo '  hi  '"]), None).unwrap();
        assert_eq!(out, "hi");
    }

    #[test]
    fn run_failure_carries_stderr_then_stdout() {
        let runner = CommandRunner::local(CancelToken::new());
        let err = runner
            .run(&argv(&["sh", "-c", "echo out; echo err >&2; exit 4"]), None)
            .unwrap_err();
        match err {
            DriverError::Command { rc, msg } => {
                assert_eq!(rc, 4);
                assert_eq!(msg, "err");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = runner
            .run(&argv(&["sh", "-c", "echo only-out; exit 2"]), None)
            .unwrap_err();
        assert_eq!(err.message(), Some("only-out"));
    }

    #[test]
    fn stdin_is_forwarded() {
        let runner = CommandRunner::local(CancelToken::new());
        let out = runner.run(&argv(&["cat"]), Some(b"{\"uuid\": 1}")).unwrap();
        assert_eq!(out, "{\"uuid\": 1}");
    }

    #[test]
    fn early_exit_reports_status_instead_of_broken_pipe() {
        let runner = CommandRunner::local(CancelToken::new());
        let input = vec![b'x'; 1 << 20];
        let err = runner
            .run(&argv(&["sh", "-c", "echo err >&2; exit 3"]), Some(input.as_slice()))
            .unwrap_err();
        match err {
            DriverError::Command { rc, msg } => {
                assert_eq!(rc, 3);
                assert_eq!(msg, "err");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn merged_output_contains_stderr() {
        let runner = CommandRunner::local(CancelToken::new());
        let out = runner
            .run_merged(&argv(&["sh", "-c", "echo a; echo b >&2"]))
            .unwrap();
        assert_eq!(out, "a\nb");
    }

    #[test]
    fn cancelled_token_stops_before_spawning() {
        let cancel = CancelToken::new();
        cancel.raise(crate::Signal::Terminate);
        let runner = CommandRunner::local(cancel);
        let err = runner.run(&argv(&["true"]), None).unwrap_err();
        assert!(matches!(err, DriverError::Cancelled(crate::Signal::Terminate)));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let runner = CommandRunner::local(CancelToken::new());
        let err = runner
            .run(&argv(&["/nonexistent/esrep-helper"]), None)
            .unwrap_err();
        assert!(matches!(err, DriverError::Spawn { .. }));
    }
}
