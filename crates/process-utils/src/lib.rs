//! Small process-related helpers shared across the workspace.
//!
//! - windowless command construction
//! - graceful terminate-then-kill of child processes
//! - named FIFO creation and opening for wiring streams into external tools

#[cfg(feature = "tokio")]
use std::ffi::OsStr;
use std::io;
use std::path::Path;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
///
/// The child is killed when its handle is dropped, so a forgotten handle never
/// outlives its owner.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// Stop a child process: graceful signal first, forced kill after `grace`.
///
/// On unix the graceful signal is `SIGTERM`; elsewhere there is no graceful
/// signal and the child is killed right away. Returns the exit status when it
/// could be reaped. Calling this on a child that already exited is fine.
#[cfg(feature = "tokio")]
pub async fn terminate(
    child: &mut tokio::process::Child,
    grace: std::time::Duration,
) -> io::Result<Option<std::process::ExitStatus>> {
    if let Some(status) = child.try_wait()? {
        return Ok(Some(status));
    }

    if send_terminate(child) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status.map(Some),
            Err(_) => {
                tracing::warn!(
                    pid = ?child.id(),
                    grace_ms = grace.as_millis() as u64,
                    "Process ignored graceful stop, killing"
                );
            }
        }
    }

    match child.kill().await {
        Ok(()) => {}
        // Raced with a natural exit.
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
        Err(e) => return Err(e),
    }
    child.wait().await.map(Some)
}

/// Send the graceful stop signal. Returns false when none was delivered.
#[cfg(all(feature = "tokio", unix))]
fn send_terminate(child: &tokio::process::Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to a
    // child we have not reaped yet, so it cannot have been recycled.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(all(feature = "tokio", not(unix)))]
fn send_terminate(_child: &tokio::process::Child) -> bool {
    false
}

/// Create a named FIFO at `path` readable and writable by the owner only.
#[cfg(unix)]
pub fn create_fifo(path: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn create_fifo(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "named pipes are only supported on unix",
    ))
}

/// Open the write side of a FIFO, waiting for a reader to appear.
///
/// A non-blocking open fails with `ENXIO` until some process opens the read
/// side, so this retries until `timeout` elapses.
#[cfg(all(feature = "tokio", unix))]
pub async fn open_fifo_writer(
    path: &Path,
    timeout: std::time::Duration,
) -> io::Result<tokio::net::unix::pipe::Sender> {
    const RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(20);

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::net::unix::pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(sender),
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no reader opened {}", path.display()),
                    ));
                }
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(all(feature = "tokio", not(unix)))]
pub async fn open_fifo_writer(
    path: &Path,
    _timeout: std::time::Duration,
) -> io::Result<tokio::fs::File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("named pipes are only supported on unix: {}", path.display()),
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    #[test]
    fn test_create_fifo() {
        use std::os::unix::fs::FileTypeExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input_0");
        create_fifo(&path).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_fifo());

        // Creating twice fails with AlreadyExists.
        let err = create_fifo(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let mut child = tokio_command("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();

        let started = Instant::now();
        let status = terminate(&mut child, Duration::from_secs(1)).await.unwrap();

        assert!(status.is_some());
        assert!(!status.unwrap().success());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_terminate_kills_after_grace() {
        // The shell ignores SIGTERM, so only the forced kill stops it.
        let mut child = tokio_command("sh")
            .args(["-c", "trap '' TERM; while true; do sleep 0.1; done"])
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let status = terminate(&mut child, Duration::from_millis(300))
            .await
            .unwrap();

        assert!(status.is_some());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_terminate_already_exited() {
        let mut child = tokio_command("true").spawn().unwrap();
        child.wait().await.unwrap();

        let status = terminate(&mut child, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(status.unwrap().success());
    }

    #[tokio::test]
    async fn test_open_fifo_writer_waits_for_reader() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input_0");
        create_fifo(&path).unwrap();

        let reader_path = path.clone();
        // A blocking open of the read side waits for the writer, like ffmpeg.
        let reader = tokio::task::spawn_blocking(move || {
            use std::io::Read;

            std::thread::sleep(Duration::from_millis(100));
            let mut rx = std::fs::File::open(&reader_path).unwrap();
            let mut buf = Vec::new();
            rx.read_to_end(&mut buf).unwrap();
            buf
        });

        let mut tx = open_fifo_writer(&path, Duration::from_secs(5)).await.unwrap();
        tx.write_all(b"payload").await.unwrap();
        drop(tx);

        assert_eq!(reader.await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_open_fifo_writer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input_0");
        create_fifo(&path).unwrap();

        let err = open_fifo_writer(&path, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
