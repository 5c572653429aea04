//! Screen capture through the X11 `xwd` tool
//!
//! The tool is run as a child process and its standard output is decoded as it
//! arrives; the dump is never written to disk. The OS pipe between the two
//! provides the backpressure: `xwd` blocks while the decoder is behind, and the
//! decoder blocks until more data is available.
//!
//! Any command that writes a single XWD image to standard output can stand in
//! for `xwd` (see [`CaptureOptions::with_command`]).

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use image::RgbaImage;

use crate::xwd::{self, XwdError};

/// How often the exit status of the tool is polled once its output is consumed
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Which command to run, and for how long.
#[derive(Clone, Debug)]
pub struct CaptureOptions {
    program: OsString,
    args: Vec<OsString>,
    display: Option<String>,
    timeout: Option<Duration>,
}

impl Default for CaptureOptions {
    /// `xwd -root -display :0`, without a timeout
    fn default() -> Self {
        Self {
            program: "xwd".into(),
            args: vec!["-root".into()],
            display: Some(":0".to_string()),
            timeout: None,
        }
    }
}

impl CaptureOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `program` with `args` instead of `xwd -root`.
    ///
    /// This also clears the display, since other programs do not take `-display`.
    pub fn with_command<I, S>(mut self, program: impl AsRef<OsStr>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.program = program.as_ref().to_owned();
        self.args = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        self.display = None;
        self
    }

    /// The X display to dump, passed as `-display <name>`.
    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    /// Kill the tool if the capture has not finished after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(display) = &self.display {
            command.arg("-display").arg(display);
        }
        command
    }
}

/// Errors which can occur while capturing the screen
#[derive(Debug)]
pub enum CaptureError {
    /// The tool could not be started
    Spawn(io::Error),
    /// Reading the tool's output or waiting for it to exit failed
    Io(io::Error),
    /// The tool's output was not a supported XWD image
    Decode(XwdError),
    /// The tool exited unsuccessfully
    Exit { status: ExitStatus, stderr: String },
    /// The tool was killed after running longer than the timeout
    TimedOut(Duration),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(err) => write!(f, "Could not start capture tool: {err}"),
            Self::Io(err) => write!(f, "Error communicating with capture tool: {err}"),
            Self::Decode(err) => write!(f, "Could not decode screen dump: {err}"),
            Self::Exit { status, stderr } if stderr.is_empty() => {
                write!(f, "Capture tool failed ({status})")
            }
            Self::Exit { status, stderr } => write!(f, "Capture tool failed ({status}): {stderr}"),
            Self::TimedOut(timeout) => write!(f, "Capture tool did not finish within {timeout:?}"),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(err) | Self::Io(err) => Some(err),
            Self::Decode(err) => Some(err),
            _ => None,
        }
    }
}

/// Capture the screen and decode it to an RGBA image.
pub fn capture(options: &CaptureOptions) -> Result<RgbaImage, CaptureError> {
    let img = run(options, |stdout| xwd::decode(stdout).map_err(CaptureError::Decode))?;
    log::debug!("Captured {}x{} image", img.width(), img.height());
    Ok(img)
}

/// Capture the screen and copy the undecoded XWD dump to `writer`.
///
/// Returns the number of bytes written.
pub fn dump<W: Write>(options: &CaptureOptions, writer: &mut W) -> Result<u64, CaptureError> {
    run(options, |stdout| {
        io::copy(stdout, writer).map_err(CaptureError::Io)
    })
}

/// Kills the child when the timeout expires before it is told to stop
struct Watchdog {
    done: mpsc::Sender<()>,
    fired: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl Watchdog {
    fn start(child: Arc<Mutex<Child>>, timeout: Duration) -> Watchdog {
        let (done, done_rx) = mpsc::channel();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(timeout) {
                let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
                // A child that was already reaped finished in time
                if let Ok(Some(_)) = child.try_wait() {
                    return;
                }
                flag.store(true, Ordering::SeqCst);
                if let Err(e) = child.kill() {
                    log::warn!("Could not kill capture tool: {e}");
                }
            }
        });
        Watchdog {
            done,
            fired,
            handle,
        }
    }

    /// Stop the watchdog, returning whether it killed the child.
    fn stop(self) -> bool {
        // The receiver is gone once the watchdog has fired
        let _ = self.done.send(());
        let _ = self.handle.join();
        self.fired.load(Ordering::SeqCst)
    }
}

/// Run the capture tool, handing its standard output to `consume`.
fn run<T, F>(options: &CaptureOptions, consume: F) -> Result<T, CaptureError>
where
    F: FnOnce(&mut BufReader<ChildStdout>) -> Result<T, CaptureError>,
{
    let mut command = options.command();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    log::debug!("Running {command:?}");

    let mut child = command.spawn().map_err(CaptureError::Spawn)?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Drained on its own thread so the tool cannot stall on a full stderr pipe
    let stderr_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).trim().to_string()
    });

    let child = Arc::new(Mutex::new(child));
    let watchdog = options
        .timeout
        .map(|timeout| Watchdog::start(Arc::clone(&child), timeout));

    let outcome = match stdout {
        Some(stdout) => {
            let mut reader = BufReader::new(stdout);
            let outcome = consume(&mut reader);
            // Keep reading so the tool is not killed by a closed pipe when
            // decoding stops early
            let _ = io::copy(&mut reader, &mut io::sink());
            outcome
        }
        None => Err(CaptureError::Io(io::Error::other("standard output not captured"))),
    };

    let status = loop {
        let polled = child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_wait();
        match polled {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => break Err(CaptureError::Io(e)),
        }
    };
    let timed_out = watchdog.is_some_and(Watchdog::stop);
    let stderr = stderr_reader.join().unwrap_or_default();

    if !stderr.is_empty() {
        log::warn!("Capture tool reported: {stderr}");
    }
    if timed_out {
        if let Some(timeout) = options.timeout {
            return Err(CaptureError::TimedOut(timeout));
        }
    }
    let status = status?;
    if !status.success() {
        return Err(CaptureError::Exit { status, stderr });
    }
    outcome
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs::File;

    const FIXTURE: &str = "tests/images/xwd/gradient-32bpp.xwd";

    #[test]
    fn default_command_dumps_root_window() {
        let command = CaptureOptions::new().with_display(":1").command();
        assert_eq!(command.get_program(), "xwd");
        let args: Vec<_> = command.get_args().collect();
        assert_eq!(args, ["-root", "-display", ":1"]);
    }

    #[test]
    fn capture_from_substitute_command() {
        let options = CaptureOptions::new()
            .with_command("cat", [FIXTURE])
            .with_timeout(Duration::from_secs(30));
        let img = capture(&options).unwrap();

        let expected = xwd::decode(BufReader::new(File::open(FIXTURE).unwrap())).unwrap();
        assert_eq!(img, expected);
    }

    #[test]
    fn dump_copies_raw_output() {
        let options = CaptureOptions::new().with_command("cat", [FIXTURE]);
        let mut out = Vec::new();
        let written = dump(&options, &mut out).unwrap();

        assert_eq!(written, out.len() as u64);
        assert_eq!(out, std::fs::read(FIXTURE).unwrap());
    }

    #[test]
    fn failing_tool_reports_exit_status() {
        let options =
            CaptureOptions::new().with_command("sh", ["-c", "echo 'cannot open display' >&2; exit 3"]);
        match capture(&options) {
            Err(CaptureError::Exit { status, stderr }) => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "cannot open display");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn garbage_output_is_a_decode_error() {
        let options = CaptureOptions::new().with_command("echo", ["not an image"]);
        assert!(matches!(
            capture(&options),
            Err(CaptureError::Decode(XwdError::MalformedHeader(_)))
        ));
    }

    #[test]
    fn slow_tool_is_killed() {
        let options = CaptureOptions::new()
            .with_command("sleep", ["10"])
            .with_timeout(Duration::from_millis(100));
        assert!(matches!(
            capture(&options),
            Err(CaptureError::TimedOut(_))
        ));
    }

    #[test]
    fn watchdog_ignores_child_that_already_exited() {
        let mut child = Command::new("true").spawn().unwrap();
        assert!(child.wait().unwrap().success());

        let watchdog = Watchdog::start(Arc::new(Mutex::new(child)), Duration::ZERO);
        thread::sleep(Duration::from_millis(50));
        assert!(!watchdog.stop());
    }

    #[test]
    fn watchdog_kills_running_child() {
        let child = Arc::new(Mutex::new(Command::new("sleep").arg("10").spawn().unwrap()));

        let watchdog = Watchdog::start(Arc::clone(&child), Duration::ZERO);
        thread::sleep(Duration::from_millis(50));
        assert!(watchdog.stop());

        let status = child.lock().unwrap().wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn missing_tool() {
        let options = CaptureOptions::new().with_command("/nonexistent/xwd", ["-root"]);
        assert!(matches!(capture(&options), Err(CaptureError::Spawn(_))));
    }
}
