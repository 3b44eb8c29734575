//! Long-running external filter process.
//!
//! A [`ConverterProcess`] runs one filter executable as a line-oriented
//! coprocess. Payloads sent on the input queue are written verbatim to the
//! process's stdin; every line it prints on stdout becomes one item on the
//! output queue. Stderr is forwarded to the log.
//!
//! Three threads serve a running process:
//! - stdout reader: publishes complete lines, closes the output queue on EOF
//! - stderr drain: logs each line
//! - stdin writer: forwards queued input, then kills and reaps the process
//!
//! Closing the input queue is the only way to stop the process. Failures are
//! logged and surface to the caller only as an output queue that closes early.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{ConverterConfig, DEFAULT_QUEUE_CAPACITY};

/// Buffer size of the stdout reader.
const STDOUT_BUFFER_SIZE: usize = 64 * 1024;

/// Lifecycle of the external process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    /// Not launched yet
    NotStarted,
    /// Launched and not yet reaped
    Running,
    /// Failed to launch, or exited and reaped
    Exited,
}

/// Handle to one running filter executable.
///
/// # Example
///
/// ```ignore
/// use convcache::ConverterProcess;
///
/// let mut process = ConverterProcess::new("upper", "/usr/local/bin/upper");
/// process.send(b"hello\n".to_vec());
/// assert_eq!(process.recv(), Some(b"HELLO".to_vec()));
///
/// process.close_input();
/// while process.recv().is_some() {}
/// ```
pub struct ConverterProcess {
    name: String,
    executable: PathBuf,
    capacity: usize,
    state: Arc<Mutex<ProcessState>>,
    input: Option<Sender<Vec<u8>>>,
    output: Receiver<Vec<u8>>,
    workers: Vec<JoinHandle<()>>,
}

impl ConverterProcess {
    /// Launch `executable` with the default queue capacity.
    pub fn new(name: &str, executable: impl AsRef<Path>) -> Self {
        Self::with_capacity(name, executable, DEFAULT_QUEUE_CAPACITY)
    }

    /// Launch `executable` with bounded queues of `capacity` items.
    ///
    /// Launch failures are logged; the returned handle then has a closed
    /// output queue.
    pub fn with_capacity(name: &str, executable: impl AsRef<Path>, capacity: usize) -> Self {
        // Placeholder queue, replaced by `start`.
        let (_, output) = bounded(0);
        let mut process = Self {
            name: name.to_string(),
            executable: executable.as_ref().to_path_buf(),
            capacity,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            input: None,
            output,
            workers: Vec::new(),
        };
        process.start();
        process
    }

    /// Launch the converter described by `config`.
    pub fn from_config(config: &ConverterConfig) -> Self {
        Self::with_capacity(&config.name, &config.executable, config.queue_capacity)
    }

    /// Launch the process and its I/O threads. Only valid once.
    fn start(&mut self) {
        {
            let state = self.state.lock();
            if *state != ProcessState::NotStarted {
                return;
            }
        }

        let (input_tx, input_rx) = bounded::<Vec<u8>>(self.capacity);
        let (output_tx, output_rx) = bounded::<Vec<u8>>(self.capacity);
        self.input = Some(input_tx);
        self.output = output_rx;

        let spawned = Command::new(&self.executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                log::error!("Filter ({}): Failed to start process: {}", self.name, e);
                *self.state.lock() = ProcessState::Exited;
                // Dropping both ends closes the output queue and rejects input.
                return;
            }
        };

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                log::error!("Filter ({}): Failed to capture std pipes", self.name);
                let _ = child.kill();
                let _ = child.wait();
                *self.state.lock() = ProcessState::Exited;
                return;
            }
        };
        *self.state.lock() = ProcessState::Running;
        log::debug!(
            "Filter ({}): Started {:?} (pid {})",
            self.name,
            self.executable,
            child.id()
        );

        let name = self.name.clone();
        self.workers
            .push(thread::spawn(move || read_stdout(&name, stdout, output_tx)));

        let name = self.name.clone();
        self.workers
            .push(thread::spawn(move || drain_stderr(&name, stderr)));

        let name = self.name.clone();
        let state = Arc::clone(&self.state);
        self.workers.push(thread::spawn(move || {
            write_stdin(&name, child, stdin, input_rx);
            *state.lock() = ProcessState::Exited;
        }));
    }

    /// Name given to this converter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the filter executable.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// Whether the process has been launched and not yet reaped.
    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Queue a payload for the process's stdin.
    ///
    /// Blocks while the queue is full. Returns `false` once the input is
    /// closed or the process no longer accepts input.
    pub fn send(&self, payload: Vec<u8>) -> bool {
        match &self.input {
            Some(input) => input.send(payload).is_ok(),
            None => false,
        }
    }

    /// Close the input queue, asking the process to shut down.
    pub fn close_input(&mut self) {
        self.input = None;
    }

    /// Next output line, or `None` once the output queue is closed.
    pub fn recv(&self) -> Option<Vec<u8>> {
        self.output.recv().ok()
    }

    /// Next output line, waiting at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Vec<u8>, RecvTimeoutError> {
        self.output.recv_timeout(timeout)
    }

    /// Receiver side of the output queue, for iteration or `select!`.
    pub fn output(&self) -> Receiver<Vec<u8>> {
        self.output.clone()
    }

    /// Feed every payload, hand each output line to `on_line`, then shut the
    /// process down.
    ///
    /// The input is closed once as many lines as payloads have come back, or
    /// earlier if the output queue closes on its own. Lines arrive while
    /// payloads are still being sent. An `on_line` error stops delivery but
    /// the output keeps being drained; the first error is returned.
    ///
    /// Returns the number of output lines received.
    pub fn convert_all<I, F>(mut self, payloads: I, mut on_line: F) -> io::Result<usize>
    where
        I: IntoIterator<Item = Vec<u8>>,
        F: FnMut(&[u8]) -> io::Result<()> + Send,
    {
        let output = self.output.clone();
        let (progress_tx, progress_rx) = unbounded::<usize>();

        let result = thread::scope(|scope| {
            let collector = scope.spawn(move || {
                let mut received = 0usize;
                let mut failure = None;
                for line in output.iter() {
                    if failure.is_none() {
                        if let Err(e) = on_line(&line) {
                            failure = Some(e);
                        }
                    }
                    received += 1;
                    let _ = progress_tx.send(received);
                }
                match failure {
                    Some(e) => Err(e),
                    None => Ok(received),
                }
            });

            let mut sent = 0usize;
            for payload in payloads {
                if !self.send(payload) {
                    log::warn!("Filter ({}): Stopped accepting input", self.name);
                    break;
                }
                sent += 1;
            }

            // A closed progress queue means the output queue closed first.
            let mut received = 0usize;
            while received < sent {
                match progress_rx.recv() {
                    Ok(count) => received = count,
                    Err(_) => break,
                }
            }
            log::debug!(
                "Filter ({}): {} payloads sent, {} lines received",
                self.name,
                sent,
                received
            );
            self.close_input();

            collector
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("output collector panicked")))
        });

        self.wait();
        result
    }

    /// Close the input and wait for the I/O threads to finish.
    ///
    /// Unread output is discarded so the stdout reader cannot block.
    pub fn wait(mut self) {
        self.close_input();
        let output = self.output.clone();
        let drainer = thread::spawn(move || for _ in output.iter() {});
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Filter ({}): I/O thread panicked", self.name);
            }
        }
        let _ = drainer.join();
    }
}

impl Drop for ConverterProcess {
    fn drop(&mut self) {
        self.close_input();
    }
}

/// Publish each stdout line until EOF, a read error or a departed consumer.
fn read_stdout<R: Read>(name: &str, stdout: R, output: Sender<Vec<u8>>) {
    let mut reader = BufReader::with_capacity(STDOUT_BUFFER_SIZE, stdout);
    loop {
        match read_line(&mut reader) {
            Ok(Some(line)) => {
                if output.send(line).is_err() {
                    log::debug!("Filter ({}): Output consumer gone", name);
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("Filter ({}): Failed to read stdout: {}", name, e);
                break;
            }
        }
    }
    // Dropping `output` closes the queue.
}

/// Log each stderr line. Errors end the drain silently.
fn drain_stderr<R: Read>(name: &str, stderr: R) {
    let mut reader = BufReader::new(stderr);
    while let Ok(Some(line)) = read_line(&mut reader) {
        log::info!(
            "Filter ({}) stderr: {}",
            name,
            String::from_utf8_lossy(&line)
        );
    }
}

/// Forward queued input to stdin, then stop the process.
fn write_stdin(name: &str, mut child: Child, mut stdin: ChildStdin, input: Receiver<Vec<u8>>) {
    for payload in input.iter() {
        if let Err(e) = stdin.write_all(&payload) {
            log::warn!("Filter ({}): Failed to write to stdin: {}", name, e);
            drop(stdin);
            reap(name, &mut child);
            // Keep draining so blocked producers are released.
            for _ in input.iter() {}
            return;
        }
    }

    drop(stdin);
    if let Err(e) = child.kill() {
        log::debug!("Filter ({}): Kill failed: {}", name, e);
    }
    reap(name, &mut child);
}

fn reap(name: &str, child: &mut Child) {
    match child.wait() {
        Ok(status) => log::debug!("Filter ({}): Exited with {}", name, status),
        Err(e) => log::warn!("Filter ({}): Failed to wait for exit: {}", name, e),
    }
}

/// Read one line, reassembling partial reads until `\n` or EOF.
///
/// The terminator (`\n` or `\r\n`) is stripped. Returns `None` at EOF
/// when no bytes are pending.
pub fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line)? == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
    Ok(Some(line))
}
