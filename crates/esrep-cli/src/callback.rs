use esrep_core::{Fields, SyncCallback};
use std::io::{ErrorKind, Write};
use std::process::{Command, Stdio};
use tracing::debug;

/// Sync callback that runs an external program with the cycle's response
/// JSON on stdin. Specified as `program[:arg...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCallback {
    program: String,
    args: Vec<String>,
}

impl CommandCallback {
    pub fn parse(spec: &str) -> Option<Self> {
        let mut parts = spec.split(':');
        let program = parts.next().filter(|p| !p.is_empty())?;
        Some(Self {
            program: program.to_owned(),
            args: parts.map(str::to_owned).collect(),
        })
    }
}

impl SyncCallback for CommandCallback {
    fn call(&mut self, response: &Fields) -> Result<(), String> {
        let payload = serde_json::to_vec(response)
            .map_err(|e| format!("cannot serialize sync response: {e}"))?;
        debug!("running sync callback {} {:?}", self.program, self.args);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("cannot run {}: {e}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&payload) {
                // the program may exit without reading its input
                Err(e) if e.kind() != ErrorKind::BrokenPipe => {
                    return Err(format!("cannot write to {}: {e}", self.program));
                }
                _ => {}
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| format!("cannot wait for {}: {e}", self.program))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(match output.status.code() {
            Some(code) => format!("{} exited with {code}: {}", self.program, stderr.trim()),
            None => format!("{} was killed by a signal", self.program),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields() -> Fields {
        esrep_core::action::into_fields(json!({"sync": 3, "snapshot_name": "@rs-1-100"}))
    }

    #[test]
    fn parse_splits_program_and_args() {
        let cb = CommandCallback::parse("/usr/bin/notify:-q:replica").unwrap();
        assert_eq!(cb.program, "/usr/bin/notify");
        assert_eq!(cb.args, vec!["-q", "replica"]);
        assert!(CommandCallback::parse("").is_none());
        assert!(CommandCallback::parse(":x").is_none());
    }

    #[test]
    fn response_is_written_to_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.json");
        let mut cb = CommandCallback::parse(&format!("sh:-c:cat > {}", out.display())).unwrap();
        cb.call(&fields()).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written["sync"], 3);
        assert_eq!(written["snapshot_name"], "@rs-1-100");
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let mut cb = CommandCallback::parse("sh:-c:echo nope >&2; exit 3").unwrap();
        let err = cb.call(&fields()).unwrap_err();
        assert_eq!(err, "sh exited with 3: nope");
    }

    #[test]
    fn missing_program_is_an_error() {
        let mut cb = CommandCallback::parse("/nonexistent/callback").unwrap();
        let err = cb.call(&fields()).unwrap_err();
        assert!(err.starts_with("cannot run /nonexistent/callback"), "{err}");
    }
}
