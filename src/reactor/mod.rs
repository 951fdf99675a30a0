//! Operation registry and ring driver.
//!
//! The reactor owns the `io_uring` instance, assigns identifiers to
//! submitted operations, keeps their records alive until completion and
//! dispatches results to the registered callbacks. It runs on exactly one
//! thread; foreign threads reach it only through [`Dispatcher::dispatch`],
//! which is drained between completion waits.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use io_uring::{squeue, types, IoUring};
use nix::sys::socket::AddressFamily;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::fd::{Fd, File, Socket};
use crate::net::{self, RawSockAddr, TcpListener, UnixListener};

pub mod ops;

use ops::{
    AcceptOp, AcceptResponse, Armed, CloseOp, CloseResponse, ConnectOp, ConnectResponse, Flow,
    OpenFileOp, OpenFileResponse, Operation, ReadFileOp, ReadFileResponse, ReadLineResponse,
    ReceiveOp, ReceiveResponse, SendOp, SendResponse, StatFileOp, StatFileResponse, TimerOp,
    TimerResponse, WriteFileOp, WriteFileResponse,
};

/// Default submission queue depth.
pub const DEFAULT_RING_DEPTH: u32 = 256;

/// Upper bound on a single completion wait; dispatched callbacks run at
/// least this often even when no I/O completes.
pub const WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Cooperative stop flag shared between the run loop, completion handlers
/// and any foreign thread holding a clone.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> StopSignal {
        StopSignal::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Passed to every completion callback: the reactor (for follow-up
/// submissions), the stop signal and the signed kernel result.
pub struct EventContext<'a> {
    pub reactor: &'a mut Reactor,
    pub stop: &'a StopSignal,
    pub result: i32,
}

impl EventContext<'_> {
    /// The result as a byte count; negative results read as zero.
    pub fn result_as_size(&self) -> usize {
        if self.result > 0 {
            self.result as usize
        } else {
            0
        }
    }
}

type DispatchFn = Box<dyn FnOnce(&mut Reactor) + Send>;

/// Clonable handle for enqueueing work onto the reactor thread from any
/// thread. Callbacks run FIFO at the next drain, at most [`WAIT_TIMEOUT`]
/// after enqueue.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<Mutex<Vec<DispatchFn>>>,
}

impl Dispatcher {
    pub fn dispatch(&self, callback: impl FnOnce(&mut Reactor) + Send + 'static) {
        self.queue
            .lock()
            .expect("dispatch queue poisoned")
            .push(Box::new(callback));
    }
}

/// Scoped batching of ring submissions.
///
/// Operations initiated with a live guard only count against it instead of
/// submitting; when the guard leaves scope (on every path) the accumulated
/// entries are submitted with a single syscall.
pub struct SubmitGuard {
    ring: Rc<RefCell<IoUring>>,
    pending: usize,
}

impl SubmitGuard {
    pub(crate) fn note_pending(&mut self) {
        self.pending += 1;
    }

    /// Entries queued behind this guard so far.
    pub fn pending(&self) -> usize {
        self.pending
    }
}

impl Drop for SubmitGuard {
    fn drop(&mut self) {
        if self.pending > 0 {
            if let Err(err) = self.ring.borrow().submit() {
                tracing::error!(error = %err, pending = self.pending, "batched submit failed");
            }
        }
    }
}

/// Single-threaded completion-based reactor.
pub struct Reactor {
    ring: Rc<RefCell<IoUring>>,
    next_id: u64,
    ops: HashMap<u64, Box<dyn Operation>>,
    dispatched: Arc<Mutex<Vec<DispatchFn>>>,
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        Self::with_depth(DEFAULT_RING_DEPTH)
    }

    pub fn with_depth(depth: u32) -> Result<Reactor> {
        let ring = IoUring::builder()
            .build(depth)
            .map_err(|e| Error::io("io_uring_queue_init", e))?;
        tracing::debug!(depth, "reactor ring created");

        Ok(Reactor {
            ring: Rc::new(RefCell::new(ring)),
            // Identifier 0 is reserved and never assigned.
            next_id: 1,
            ops: HashMap::new(),
            dispatched: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// New batch guard for this reactor's ring. See [`SubmitGuard`].
    pub fn submit_guard(&self) -> SubmitGuard {
        SubmitGuard {
            ring: Rc::clone(&self.ring),
            pending: 0,
        }
    }

    /// Handle for cross-thread dispatch; see [`Dispatcher`].
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            queue: Arc::clone(&self.dispatched),
        }
    }

    /// Enqueue a callback to run on the reactor thread at the next drain.
    pub fn dispatch(&self, callback: impl FnOnce(&mut Reactor) + Send + 'static) {
        self.dispatched
            .lock()
            .expect("dispatch queue poisoned")
            .push(Box::new(callback));
    }

    /// Run until `stop` is requested. Each iteration waits at most
    /// [`WAIT_TIMEOUT`] for a completion, handles it, then drains the
    /// dispatch queue.
    pub fn run(&mut self, stop: &StopSignal) -> Result<()> {
        while !self.run_once(WAIT_TIMEOUT, stop)? {}
        Ok(())
    }

    /// One loop iteration with a caller-supplied wait bound. Returns whether
    /// the stop signal is set.
    pub fn run_once(&mut self, timeout: Duration, stop: &StopSignal) -> Result<bool> {
        if stop.is_stopped() {
            return Ok(true);
        }

        let timespec = types::Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let args = types::SubmitArgs::new().timespec(&timespec);

        let wait = self.ring.borrow().submitter().submit_with_args(1, &args);
        match wait {
            Ok(_) => {}
            Err(err) if err.raw_os_error() == Some(libc::ETIME) => {
                self.execute_dispatched();
                return Ok(stop.is_stopped());
            }
            Err(err) => return Err(Error::io("io_uring_enter", err)),
        }

        let completion = {
            let mut ring = self.ring.borrow_mut();
            let mut cq = ring.completion();
            let entry = cq.next();
            cq.sync();
            entry
        };

        if let Some(cqe) = completion {
            self.complete(cqe.user_data(), cqe.result(), stop)?;
        }

        self.execute_dispatched();
        Ok(stop.is_stopped())
    }

    fn complete(&mut self, user_data: u64, result: i32, stop: &StopSignal) -> Result<()> {
        let mut op = self
            .ops
            .remove(&user_data)
            .ok_or(Error::UnknownCompletion { user_data })?;
        tracing::trace!(id = user_data, op = op.name(), result, "completion");

        let armed = {
            let mut ctx = EventContext {
                reactor: self,
                stop,
                result,
            };
            op.handle(&mut ctx)
        };

        match armed {
            Armed::Retain => {
                let entry = op.prepare().user_data(user_data);
                self.push(entry, None)?;
                self.ops.insert(user_data, op);
            }
            Armed::Remove => {}
        }
        Ok(())
    }

    fn execute_dispatched(&mut self) {
        // The lock is released before any callback runs; callbacks may
        // dispatch again.
        let drained = {
            let mut queue = self.dispatched.lock().expect("dispatch queue poisoned");
            std::mem::take(&mut *queue)
        };
        for callback in drained {
            callback(self);
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register the record, stamp its entry with a fresh identifier and
    /// push it to the ring. The record is rolled back if the push fails.
    fn submit_op(
        &mut self,
        mut op: Box<dyn Operation>,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<u64> {
        let id = self.allocate_id();
        let entry = op.prepare().user_data(id);
        tracing::trace!(id, op = op.name(), batched = submit.is_some(), "submitting");
        self.ops.insert(id, op);
        if let Err(err) = self.push(entry, submit) {
            self.ops.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    fn push(&mut self, entry: squeue::Entry, submit: Option<&mut SubmitGuard>) -> Result<()> {
        {
            let mut ring = self.ring.borrow_mut();
            let mut sq = ring.submission();
            if unsafe { sq.push(&entry) }.is_err() {
                return Err(Error::RingExhausted);
            }
            sq.sync();
        }
        match submit {
            Some(guard) => guard.note_pending(),
            None => {
                self.ring
                    .borrow()
                    .submit()
                    .map_err(|e| Error::io("io_uring_submit", e))?;
            }
        }
        Ok(())
    }

    /// Asynchronously close any descriptor.
    #[tracing::instrument(level = "trace", skip(self, fd, callback, submit))]
    pub fn close<F>(
        &mut self,
        fd: impl Into<Fd>,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &CloseResponse) + 'static,
    {
        self.submit_op(
            Box::new(CloseOp {
                fd: fd.into(),
                callback: Box::new(callback),
            }),
            submit,
        )
        .map(drop)
    }

    /// Arm a timer. The callback receives the elapsed seconds on each fire
    /// and decides whether the timer repeats.
    #[tracing::instrument(level = "trace", skip(self, callback, submit))]
    pub fn timer<F>(
        &mut self,
        duration: Duration,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &TimerResponse) -> Flow + 'static,
    {
        self.submit_op(
            Box::new(TimerOp {
                start: Instant::now(),
                duration,
                timespec: types::Timespec::new(),
                callback: Box::new(callback),
            }),
            submit,
        )
        .map(drop)
    }

    /// Accept connections on a TCP listener; repeats while the callback
    /// returns [`Flow::Continue`] and clients keep arriving.
    #[tracing::instrument(level = "trace", skip(self, listener, callback, submit), fields(server = %listener.socket()))]
    pub fn accept<F>(
        &mut self,
        listener: &TcpListener,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &AcceptResponse) -> Flow + 'static,
    {
        self.submit_op(
            Box::new(AcceptOp {
                server: listener.socket(),
                staging: RawSockAddr::staging_inet(),
                addr_len: 0,
                callback: Box::new(callback),
            }),
            submit,
        )
        .map(drop)
    }

    /// Accept connections on a Unix-domain listener.
    #[tracing::instrument(level = "trace", skip(self, listener, callback, submit), fields(server = %listener.socket()))]
    pub fn accept_unix<F>(
        &mut self,
        listener: &UnixListener,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &AcceptResponse) -> Flow + 'static,
    {
        self.submit_op(
            Box::new(AcceptOp {
                server: listener.socket(),
                staging: RawSockAddr::staging_unix(),
                addr_len: 0,
                callback: Box::new(callback),
            }),
            submit,
        )
        .map(drop)
    }

    /// Connect to `addr:port`. The socket is created synchronously; connect
    /// failures arrive through `response.error`.
    #[tracing::instrument(level = "trace", skip(self, callback, submit))]
    pub fn connect<F>(
        &mut self,
        addr: Ipv4Addr,
        port: u16,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &ConnectResponse) + 'static,
    {
        let client = net::client_socket(AddressFamily::Inet)?;
        self.submit_op(
            Box::new(ConnectOp {
                client,
                server_addr: RawSockAddr::inet(SocketAddrV4::new(addr, port)),
                callback: Box::new(callback),
            }),
            submit,
        )
        .map(drop)
    }

    /// Connect to a Unix-domain socket at `path`.
    #[tracing::instrument(level = "trace", skip(self, path, callback, submit), fields(path = %path.as_ref().display()))]
    pub fn connect_unix<F>(
        &mut self,
        path: impl AsRef<Path>,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &ConnectResponse) + 'static,
    {
        let server_addr = RawSockAddr::unix(path.as_ref())?;
        let client = net::client_socket(AddressFamily::Unix)?;
        self.submit_op(
            Box::new(ConnectOp {
                client,
                server_addr,
                callback: Box::new(callback),
            }),
            submit,
        )
        .map(drop)
    }

    /// Send the buffer's window on a connected socket. The record keeps the
    /// buffer alive until the completion arrives.
    #[tracing::instrument(level = "trace", skip(self, data, callback, submit))]
    pub fn send<F>(
        &mut self,
        client: Socket,
        data: Buffer,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &SendResponse) + 'static,
    {
        self.submit_op(
            Box::new(SendOp {
                client,
                data,
                callback: Box::new(callback),
            }),
            submit,
        )
        .map(drop)
    }

    /// Receive into the buffer; repeats while the callback returns
    /// [`Flow::Continue`] and data keeps arriving. A zero-sized completion
    /// disarms the operation after the callback has seen it.
    #[tracing::instrument(level = "trace", skip(self, buffer, callback, submit))]
    pub fn receive<F>(
        &mut self,
        client: Socket,
        buffer: Buffer,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &ReceiveResponse<'_>) -> Flow + 'static,
    {
        self.submit_op(
            Box::new(ReceiveOp {
                client,
                buffer,
                callback: Box::new(callback),
            }),
            submit,
        )
        .map(drop)
    }

    /// Open a file read-only (flags and mode both zero).
    pub fn open_file<F>(
        &mut self,
        path: impl AsRef<Path>,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &OpenFileResponse) + 'static,
    {
        self.open_file_with(path, 0, 0, callback, submit)
    }

    /// Open a file with explicit `O_*` flags and creation mode.
    #[tracing::instrument(level = "trace", skip(self, path, callback, submit), fields(path = %path.as_ref().display()))]
    pub fn open_file_with<F>(
        &mut self,
        path: impl AsRef<Path>,
        flags: i32,
        mode: libc::mode_t,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &OpenFileResponse) + 'static,
    {
        let path = owned_path(path.as_ref(), "openat")?;
        self.submit_op(
            Box::new(OpenFileOp {
                path,
                flags,
                mode,
                callback: Box::new(callback),
            }),
            submit,
        )
        .map(drop)
    }

    /// Read from `offset`; while the callback returns [`Flow::Continue`]
    /// the offset advances by the bytes read and the next chunk is
    /// requested. A zero-sized completion (end of file) disarms.
    #[tracing::instrument(level = "trace", skip(self, buffer, callback, submit))]
    pub fn read_file<F>(
        &mut self,
        file: File,
        buffer: Buffer,
        offset: u64,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &ReadFileResponse<'_>) -> Flow + 'static,
    {
        self.submit_op(
            Box::new(ReadFileOp {
                file,
                buffer,
                offset,
                callback: Box::new(callback),
            }),
            submit,
        )
        .map(drop)
    }

    /// Write the buffer's window to the file.
    #[tracing::instrument(level = "trace", skip(self, data, callback, submit))]
    pub fn write_file<F>(
        &mut self,
        file: File,
        data: Buffer,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &WriteFileResponse) + 'static,
    {
        self.submit_op(
            Box::new(WriteFileOp {
                file,
                data,
                callback: Box::new(callback),
            }),
            submit,
        )
        .map(drop)
    }

    /// Stat a path; the callback receives the statx record, or `None` with
    /// the error in `ctx.result`.
    #[tracing::instrument(level = "trace", skip(self, path, callback, submit), fields(path = %path.as_ref().display()))]
    pub fn stat_file<F>(
        &mut self,
        path: impl AsRef<Path>,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &StatFileResponse) + 'static,
    {
        let path = owned_path(path.as_ref(), "statx")?;
        self.submit_op(
            Box::new(StatFileOp {
                path,
                statx: unsafe { std::mem::zeroed() },
                callback: Box::new(callback),
            }),
            submit,
        )
        .map(drop)
    }

    /// Read standard input line by line. Each accumulated line (including
    /// its newline) is handed to the callback in arrival order; returning
    /// [`Flow::Stop`] stops mid-buffer.
    pub fn read_line<F>(
        &mut self,
        buffer: Buffer,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &ReadLineResponse<'_>) -> Flow + 'static,
    {
        let mut callback = callback;
        let mut line = Vec::new();
        self.read_file(
            File::STDIN,
            buffer,
            0,
            move |ctx, response| {
                scan_lines(&mut line, response.data, |text| {
                    callback(ctx, &ReadLineResponse { line: text })
                })
            },
            submit,
        )
    }

    /// Write `text` to standard output. The text is copied into a fresh
    /// buffer owned by the operation record and released after the write
    /// completes.
    pub fn print_stdout<F>(
        &mut self,
        text: impl AsRef<str>,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &WriteFileResponse) + 'static,
    {
        self.print_file(File::STDOUT, text.as_ref(), callback, submit)
    }

    /// Write `text` to standard error; see [`Reactor::print_stdout`].
    pub fn print_stderr<F>(
        &mut self,
        text: impl AsRef<str>,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &WriteFileResponse) + 'static,
    {
        self.print_file(File::STDERR, text.as_ref(), callback, submit)
    }

    fn print_file<F>(
        &mut self,
        file: File,
        text: &str,
        callback: F,
        submit: Option<&mut SubmitGuard>,
    ) -> Result<()>
    where
        F: FnMut(&mut EventContext<'_>, &WriteFileResponse) + 'static,
    {
        self.write_file(file, Buffer::from_bytes(text), callback, submit)
    }

    /// Number of operations currently in flight (test hook).
    pub fn in_flight(&self) -> usize {
        self.ops.len()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // Remaining records are released without running their callbacks;
        // the ring teardown happens in the IoUring drop.
        if !self.ops.is_empty() {
            tracing::debug!(
                outstanding = self.ops.len(),
                "reactor dropped with in-flight operations"
            );
        }
    }
}

fn owned_path(path: &Path, operation: &'static str) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::os(operation, libc::EINVAL))
}

/// Append `chunk` to the accumulator and emit every completed line
/// (newline included). Scanning continues across the remainder of the chunk
/// after each emit unless the consumer stops.
fn scan_lines(line: &mut Vec<u8>, chunk: &[u8], mut emit: impl FnMut(&str) -> Flow) -> Flow {
    for &byte in chunk {
        line.push(byte);
        if byte == b'\n' {
            let text = String::from_utf8_lossy(line).into_owned();
            if emit(&text) == Flow::Stop {
                return Flow::Stop;
            }
            line.clear();
        }
    }
    Flow::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_emits_lines_in_order() {
        let mut acc = Vec::new();
        let mut seen = Vec::new();
        let flow = scan_lines(&mut acc, b"abc\ndef\n", |text| {
            seen.push(text.to_string());
            Flow::Continue
        });
        assert_eq!(flow, Flow::Continue);
        assert_eq!(seen, ["abc\n", "def\n"]);
        assert!(acc.is_empty());
    }

    #[test]
    fn scan_keeps_partial_lines_across_chunks() {
        let mut acc = Vec::new();
        let mut seen = Vec::new();
        scan_lines(&mut acc, b"ab", |_| unreachable!());
        scan_lines(&mut acc, b"c\nd", |text| {
            seen.push(text.to_string());
            Flow::Continue
        });
        assert_eq!(seen, ["abc\n"]);
        assert_eq!(acc, b"d");
    }

    #[test]
    fn scan_stops_mid_chunk_when_asked() {
        let mut acc = Vec::new();
        let mut seen = Vec::new();
        let flow = scan_lines(&mut acc, b"one\ntwo\n", |text| {
            seen.push(text.to_string());
            Flow::Stop
        });
        assert_eq!(flow, Flow::Stop);
        assert_eq!(seen, ["one\n"]);
    }
}
