//! Response envelope shared by every engine action.

use crate::concurrency::FileLock;
use crate::{CoreError, ERR_UNKNOWN, OK};
use esrep_driver::{CancelToken, Signal};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Action-specific response keys.
pub type Fields = Map<String, Value>;

pub type Step<'a, E> = Box<dyn FnOnce(&mut E) -> Result<Fields, CoreError> + 'a>;
pub type Compensation<'a, E> = Box<dyn FnOnce(&mut E, &mut Fields) -> Result<(), CoreError> + 'a>;

/// Seconds since the Unix epoch (UTC).
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// JSON object into response fields; anything else yields no fields.
pub fn into_fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub rc: i32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(flatten)]
    pub fields: Fields,
    pub time_started: i64,
    pub time_ended: i64,
    pub time_elapsed: i64,
}

impl Response {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Exit status of the process; the OS truncates to 8 bits.
    pub fn exit_code(&self) -> u8 {
        (self.rc & 0xff) as u8
    }
}

/// An action body, optionally paired with a compensating step that runs
/// best-effort when the body fails and may add keys to the error response.
pub enum Action<'a, E> {
    Plain(Step<'a, E>),
    Compensated {
        run: Step<'a, E>,
        compensate: Compensation<'a, E>,
    },
}

impl<'a, E> Action<'a, E> {
    pub fn plain(run: impl FnOnce(&mut E) -> Result<Fields, CoreError> + 'a) -> Self {
        Self::Plain(Box::new(run))
    }

    pub fn compensated(
        run: impl FnOnce(&mut E) -> Result<Fields, CoreError> + 'a,
        compensate: impl FnOnce(&mut E, &mut Fields) -> Result<(), CoreError> + 'a,
    ) -> Self {
        Self::Compensated {
            run: Box::new(run),
            compensate: Box::new(compensate),
        }
    }

    fn into_parts(self) -> (Step<'a, E>, Option<Compensation<'a, E>>) {
        match self {
            Self::Plain(run) => (run, None),
            Self::Compensated { run, compensate } => (run, Some(compensate)),
        }
    }
}

/// Engine state the wrapper needs.
pub trait ActionContext {
    fn cancel_token(&self) -> &CancelToken;

    /// Message attached to a successful response.
    fn take_msg(&mut self) -> Option<String>;
}

/// Lock file held for the duration of an action, compensation included.
#[derive(Debug, Clone)]
pub struct LockPolicy {
    pub path: PathBuf,
    pub timeout: Option<Duration>,
    pub interval: Duration,
}

impl LockPolicy {
    fn acquire(&self) -> Result<FileLock, CoreError> {
        let mut lock = FileLock::new(&self.path);
        lock.acquire(self.timeout, self.interval)?;
        Ok(lock)
    }
}

fn failure_message(name: &str, err: &CoreError) -> String {
    match err {
        CoreError::Cancelled(Signal::Terminate) => {
            format!("Terminated by signal {} in {name}()", Signal::Terminate)
        }
        CoreError::Cancelled(Signal::Interrupt) => {
            format!("Interrupted by signal {} in {name}()", Signal::Interrupt)
        }
        other => other.to_string(),
    }
}

/// Run `action` as the public action `name` and build its response.
///
/// Failures never escape: they become `rc`/`msg` in the response after the
/// compensating step (if any) has run. Errors of the compensating step are
/// logged only.
pub fn perform<E: ActionContext>(
    engine: &mut E,
    name: &str,
    lock: Option<LockPolicy>,
    action: Action<'_, E>,
) -> Response {
    let time_started = unix_now();
    let (run, compensate) = action.into_parts();
    info!("running {name}");

    let mut held = None;
    let result = match lock.as_ref().map(LockPolicy::acquire).transpose() {
        Ok(guard) => {
            held = guard;
            engine
                .cancel_token()
                .check()
                .map_err(CoreError::from)
                .and_then(|()| run(engine))
        }
        Err(e) => Err(e),
    };

    let mut response = match result {
        Ok(fields) => Response {
            rc: OK,
            success: true,
            msg: engine.take_msg().filter(|m| !m.is_empty()),
            fields,
            time_started,
            time_ended: 0,
            time_elapsed: 0,
        },
        Err(err) => {
            let rc = err.rc();
            let msg = failure_message(name, &err);
            warn!("{name} failed (rc={rc}): {msg}");

            let mut fields = Fields::new();
            if let Some(compensate) = compensate {
                info!("running cleanup for {name}");
                if let Err(e) = compensate(engine, &mut fields) {
                    warn!("cleanup for {name} failed: {e}");
                }
            }
            Response {
                rc: if rc == OK { ERR_UNKNOWN } else { rc },
                success: false,
                msg: Some(msg),
                fields,
                time_started,
                time_ended: 0,
                time_elapsed: 0,
            }
        }
    };
    drop(held);

    response.time_ended = unix_now();
    response.time_elapsed = response.time_ended - response.time_started;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Probe {
        cancel: CancelToken,
        msg: Option<String>,
        cleaned: bool,
    }

    impl ActionContext for Probe {
        fn cancel_token(&self) -> &CancelToken {
            &self.cancel
        }

        fn take_msg(&mut self) -> Option<String> {
            self.msg.take()
        }
    }

    #[test]
    fn success_envelope() {
        let mut probe = Probe::default();
        let response = perform(
            &mut probe,
            "noop",
            None,
            Action::plain(|p: &mut Probe| {
                p.msg = Some("frozen".into());
                Ok(into_fields(json!({"answer": 42})))
            }),
        );
        assert_eq!(response.rc, 0);
        assert!(response.success);
        assert_eq!(response.msg.as_deref(), Some("frozen"));
        assert_eq!(response.get("answer"), Some(&json!(42)));
        assert!(response.time_ended >= response.time_started);

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["answer"], 42);
        assert_eq!(value["success"], true);
        assert!(value.get("time_elapsed").is_some());
    }

    #[test]
    fn failure_runs_compensation() {
        let mut probe = Probe::default();
        let response = perform(
            &mut probe,
            "broken",
            None,
            Action::compensated(
                |_: &mut Probe| Err(CoreError::DiskCheck("bad disk".into())),
                |p: &mut Probe, fields: &mut Fields| {
                    p.cleaned = true;
                    fields.insert("sync".into(), json!(0));
                    Ok(())
                },
            ),
        );
        assert_eq!(response.rc, 5);
        assert!(!response.success);
        assert_eq!(response.msg.as_deref(), Some("bad disk"));
        assert_eq!(response.get("sync"), Some(&json!(0)));
        assert!(probe.cleaned);
    }

    #[test]
    fn compensation_errors_are_swallowed() {
        let mut probe = Probe::default();
        let response = perform(
            &mut probe,
            "broken",
            None,
            Action::compensated(
                |_: &mut Probe| Err(CoreError::Command { rc: 12, msg: "zfs".into() }),
                |_: &mut Probe, _: &mut Fields| Err(CoreError::Unknown("cleanup".into())),
            ),
        );
        assert_eq!(response.rc, 12);
        assert_eq!(response.msg.as_deref(), Some("zfs"));
    }

    #[test]
    fn sigterm_names_the_action() {
        let mut probe = Probe::default();
        let response = perform(
            &mut probe,
            "sync",
            None,
            Action::plain(|_: &mut Probe| Err(CoreError::Cancelled(Signal::Terminate))),
        );
        assert_eq!(response.rc, 215);
        assert_eq!(
            response.msg.as_deref(),
            Some("Terminated by signal #15 in sync()")
        );
    }

    #[test]
    fn lock_is_held_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("esrep-vm.lock");
        let policy = LockPolicy {
            path: path.clone(),
            timeout: Some(Duration::from_secs(1)),
            interval: Duration::from_millis(10),
        };
        let mut probe = Probe::default();
        let seen = path.clone();
        let response = perform(
            &mut probe,
            "locked",
            Some(policy),
            Action::plain(move |_: &mut Probe| {
                assert!(seen.exists());
                Ok(Fields::new())
            }),
        );
        assert!(response.success);
        assert!(!path.exists());
    }

    #[test]
    fn lock_timeout_is_an_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("esrep-vm.lock");
        std::fs::write(&path, "1").unwrap();
        let policy = LockPolicy {
            path,
            timeout: Some(Duration::ZERO),
            interval: Duration::from_millis(10),
        };
        let mut probe = Probe::default();
        let response = perform(
            &mut probe,
            "locked",
            Some(policy),
            Action::plain(|_: &mut Probe| Ok(Fields::new())),
        );
        assert_eq!(response.rc, 99);
        assert_eq!(
            response.msg.as_deref(),
            Some("Could not acquire lock within 0 seconds")
        );
    }
}
