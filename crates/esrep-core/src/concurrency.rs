use crate::CoreError;
use esrep_driver::{CancelToken, Signal};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lock held by the existence of a file.
///
/// The file is created with `O_CREAT|O_EXCL` and removed on release. A lock
/// left behind by a crashed process is never taken over; the owner PID is
/// written into the file so an operator can tell whether it is stale.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Whether this handle holds the lock.
    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    fn create(&mut self) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&self.path)?;
        writeln!(file, "{}", std::process::id())?;
        self.file = Some(file);
        Ok(())
    }

    /// Retry every `interval` until the file can be created; give up once
    /// `timeout` has elapsed (`None` waits forever).
    pub fn acquire(
        &mut self,
        timeout: Option<Duration>,
        interval: Duration,
    ) -> Result<(), CoreError> {
        let started = Instant::now();

        while !self.is_locked() {
            if !self.exists() {
                match self.create() {
                    Ok(()) => break,
                    Err(e) => debug!("failed to create lock file {}: {e}", self.path.display()),
                }
            }

            if let Some(timeout) = timeout {
                if started.elapsed() > timeout {
                    return Err(CoreError::LockTimeout(timeout.as_secs()));
                }
            }
            std::thread::sleep(interval);
        }

        debug!("acquired lock {}", self.path.display());
        Ok(())
    }

    pub fn release(&mut self) -> Result<(), CoreError> {
        if !self.exists() {
            return Err(CoreError::Lock("Not locked".to_owned()));
        }
        match self.file.take() {
            Some(file) => {
                drop(file);
                std::fs::remove_file(&self.path)?;
                debug!("released lock {}", self.path.display());
                Ok(())
            }
            None => Err(CoreError::Lock("Lock was never acquired".to_owned())),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.is_locked() {
            if let Err(e) = self.release() {
                warn!("failed to release lock {}: {e}", self.path.display());
            }
        }
    }
}

static TERMINATE: OnceLock<CancelToken> = OnceLock::new();

extern "C" fn on_sigterm(_signum: libc::c_int) {
    if let Some(token) = TERMINATE.get() {
        token.raise(Signal::Terminate);
    }
}

/// Route SIGINT and SIGTERM into `token`. Call once per process.
pub fn install_signal_handlers(token: &CancelToken) -> Result<(), CoreError> {
    let interrupt = token.clone();
    ctrlc::set_handler(move || interrupt.raise(Signal::Interrupt))
        .map_err(|e| CoreError::Unknown(format!("cannot install SIGINT handler: {e}")))?;

    if TERMINATE.set(token.clone()).is_err() {
        return Err(CoreError::Unknown(
            "SIGTERM handler already installed".to_owned(),
        ));
    }
    install_sigterm();
    Ok(())
}

#[allow(unsafe_code)]
fn install_sigterm() {
    let handler = on_sigterm as extern "C" fn(libc::c_int);
    // SAFETY: the handler only performs atomic operations on a token that is
    // stored in a static before registration and never dropped.
    unsafe {
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}
