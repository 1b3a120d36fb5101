use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use crate::container::Discontinued;
use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// Engine processes currently running, keyed by pid (each leads its own group).
#[derive(Default)]
struct Children {
    running: Mutex<BTreeMap<u32, String>>,
}

impl Children {
    fn insert(&self, pid: u32, label: String) {
        if let Ok(mut m) = self.running.lock() {
            m.insert(pid, label);
        }
    }

    fn remove(&self, pid: u32) {
        if let Ok(mut m) = self.running.lock() {
            m.remove(&pid);
        }
    }

    fn signal_all(&self) {
        let running: Vec<(u32, String)> = match self.running.lock() {
            Ok(m) => m.iter().map(|(k, v)| (*k, v.clone())).collect(),
            Err(_) => return,
        };
        for (pid, label) in running {
            tracing::debug!(pid, "terminating {label}");
            terminate_group(pid, false);
        }
    }
}

/// Per-invocation execution context handed to every module build.
#[derive(Clone)]
pub struct ExecCtx {
    pub interactive: bool,
    pub current_module: Option<String>,
    /// Images refused at container setup.
    pub discontinued: Arc<Discontinued>,
    cancel: Arc<AtomicBool>,
    children: Arc<Children>,
}

impl Default for ExecCtx {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ExecCtx {
    pub fn new(interactive: bool) -> Self {
        Self {
            interactive,
            current_module: None,
            discontinued: Arc::new(Discontinued::default()),
            cancel: Arc::new(AtomicBool::new(false)),
            children: Arc::new(Children::default()),
        }
    }

    pub fn with_discontinued(mut self, list: Discontinued) -> Self {
        self.discontinued = Arc::new(list);
        self
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Marks the run as cancelled and signals every running engine process.
    /// Safe to call from a signal handler thread.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.children.signal_all();
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancelled() {
            return Err(Error::new(ErrorKind::Cancelled, "build interrupted"));
        }
        Ok(())
    }

    pub fn set_module(&mut self, id: impl Into<String>) {
        self.current_module = Some(id.into());
    }

    pub fn module_id(&self) -> &str {
        self.current_module.as_deref().unwrap_or("-")
    }

    pub fn log(&self, msg: &str) {
        tracing::info!(module = self.module_id(), "{msg}");
    }

    fn spawn(&self, cmd: &mut Command) -> Result<(std::process::Child, u32)> {
        self.check_cancelled()?;
        let label = program_label(cmd);
        tracing::debug!(module = self.module_id(), "exec: {cmd:?}");
        own_process_group(cmd);
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to start {label}: {e}")))?;
        let pid = child.id();
        self.children.insert(pid, label);
        Ok((child, pid))
    }

    /// Runs `cmd`, forwarding each output line to the log as it arrives.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        let label = program_label(&cmd);
        let (mut child, pid) = self.spawn(&mut cmd)?;

        let (tx, rx) = mpsc::channel::<(Stream, String)>();
        let readers: Vec<_> = [
            child.stdout.take().map(|s| forward_lines(s, Stream::Stdout, tx.clone())),
            child.stderr.take().map(|s| forward_lines(s, Stream::Stderr, tx.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();
        drop(tx);

        for (stream, line) in rx {
            match stream {
                Stream::Stdout => tracing::info!(module = self.module_id(), "{line}"),
                Stream::Stderr => {
                    tracing::info!(module = self.module_id(), stream = stream.as_str(), "{line}")
                }
            }
            if self.cancelled() {
                terminate_group(pid, true);
                break;
            }
        }
        for r in readers {
            let _ = r.join();
        }

        let status = child.wait();
        self.children.remove(pid);
        let status = status.map_err(|e| Error::msg(format!("failed to wait for {label}: {e}")))?;
        self.check_cancelled()?;
        if !status.success() {
            return Err(Error::msg(format!("command failed: {label}: {status}")));
        }
        Ok(())
    }

    /// Runs `cmd` to completion and returns its stdout; stderr is folded into the error.
    pub fn run_capture(&self, mut cmd: Command) -> Result<String> {
        let label = program_label(&cmd);
        let (child, pid) = self.spawn(&mut cmd)?;
        let out = child.wait_with_output();
        self.children.remove(pid);
        let out = out.map_err(|e| Error::msg(format!("failed to wait for {label}: {e}")))?;
        self.check_cancelled()?;
        if !out.status.success() {
            return Err(Error::msg(format!(
                "command failed: {label}: {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

fn program_label(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    if let Some(sub) = cmd.get_args().next() {
        parts.push(sub.to_string_lossy().into_owned());
    }
    parts.join(" ")
}

// Progress bars redraw with '\r'; treat it as a line break so they don't pile up.
fn forward_lines<R: Read + Send + 'static>(
    reader: R,
    stream: Stream,
    tx: mpsc::Sender<(Stream, String)>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut r = BufReader::new(reader);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match r.read_until(b'\n', &mut raw) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            for piece in raw.split(|b| *b == b'\r' || *b == b'\n') {
                let line = String::from_utf8_lossy(piece);
                let line = line.trim_end();
                if !line.is_empty() && tx.send((stream, line.to_string())).is_err() {
                    return;
                }
            }
        }
    })
}

fn own_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

fn terminate_group(pid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        let Ok(pgid) = i32::try_from(pid) else {
            return;
        };
        // Negative pid addresses the whole group.
        let _ = unsafe { libc::kill(-pgid, sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, force);
    }
}
