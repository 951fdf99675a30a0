//! Per-operation state and completion handling.
//!
//! Every submitted operation is represented by a boxed record implementing
//! [`Operation`]. The box gives kernel-visible fields (timespec, path
//! strings, sockaddr staging, statx output, buffer storage) a stable address
//! from submission to completion. `prepare` builds the submission entry for
//! the current shot; `handle` consumes a completion and decides whether the
//! reactor keeps the record armed.

use std::ffi::CString;
use std::time::{Duration, Instant};

use io_uring::{opcode, squeue, types};

use crate::buffer::Buffer;
use crate::error::try_extract_error;
use crate::fd::{Fd, File, Socket};
use crate::net::{PeerAddr, RawSockAddr};
use crate::reactor::EventContext;

/// Returned by repeatable-operation callbacks: keep the operation armed or
/// let the reactor release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Decision reached after a completion has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Armed {
    Retain,
    Remove,
}

pub(crate) trait Operation {
    fn name(&self) -> &'static str;

    /// Build the submission entry for the next shot. Called once before the
    /// first submission and again on every re-arm; fields that must be
    /// reset between shots are reset here or in `handle`.
    fn prepare(&mut self) -> squeue::Entry;

    /// Process a completion. `Retain` asks the reactor to re-prepare and
    /// re-submit under the same identifier.
    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Armed;
}

pub struct CloseResponse {
    pub fd: Fd,
}

pub struct TimerResponse {
    /// Seconds elapsed since the timer was (re-)armed.
    pub elapsed: f64,
}

pub struct AcceptResponse {
    pub client: Socket,
    pub peer: PeerAddr,
}

pub struct ConnectResponse {
    pub client: Socket,
    pub server: PeerAddr,
    /// Present when the connect completed with an error; the connection is
    /// not usable in that case.
    pub error: Option<String>,
}

pub struct SendResponse {
    pub client: Socket,
    pub size: usize,
}

pub struct ReceiveResponse<'a> {
    pub client: Socket,
    /// Received bytes; empty on a zero-sized (EOF-like) completion.
    pub data: &'a [u8],
}

pub struct OpenFileResponse {
    pub file: File,
}

pub struct ReadFileResponse<'a> {
    pub file: File,
    pub data: &'a [u8],
    /// Offset this chunk was read from.
    pub offset: u64,
}

pub struct WriteFileResponse {
    pub file: File,
    pub size: usize,
}

pub struct StatFileResponse {
    /// Full statx record, `None` when the operation failed.
    pub stats: Option<libc::statx>,
}

pub struct ReadLineResponse<'a> {
    /// One accumulated line, including the trailing newline.
    pub line: &'a str,
}

pub type CloseCallback = Box<dyn FnMut(&mut EventContext<'_>, &CloseResponse)>;
pub type TimerCallback = Box<dyn FnMut(&mut EventContext<'_>, &TimerResponse) -> Flow>;
pub type AcceptCallback = Box<dyn FnMut(&mut EventContext<'_>, &AcceptResponse) -> Flow>;
pub type ConnectCallback = Box<dyn FnMut(&mut EventContext<'_>, &ConnectResponse)>;
pub type SendCallback = Box<dyn FnMut(&mut EventContext<'_>, &SendResponse)>;
pub type ReceiveCallback = Box<dyn FnMut(&mut EventContext<'_>, &ReceiveResponse<'_>) -> Flow>;
pub type OpenFileCallback = Box<dyn FnMut(&mut EventContext<'_>, &OpenFileResponse)>;
pub type ReadFileCallback = Box<dyn FnMut(&mut EventContext<'_>, &ReadFileResponse<'_>) -> Flow>;
pub type WriteFileCallback = Box<dyn FnMut(&mut EventContext<'_>, &WriteFileResponse)>;
pub type StatFileCallback = Box<dyn FnMut(&mut EventContext<'_>, &StatFileResponse)>;
pub type ReadLineCallback = Box<dyn FnMut(&mut EventContext<'_>, &ReadLineResponse<'_>) -> Flow>;

pub(crate) struct CloseOp {
    pub(crate) fd: Fd,
    pub(crate) callback: CloseCallback,
}

impl Operation for CloseOp {
    fn name(&self) -> &'static str {
        "close"
    }

    fn prepare(&mut self) -> squeue::Entry {
        opcode::Close::new(types::Fd(self.fd.raw())).build()
    }

    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Armed {
        let response = CloseResponse { fd: self.fd };
        (self.callback)(ctx, &response);
        Armed::Remove
    }
}

pub(crate) struct TimerOp {
    pub(crate) start: Instant,
    pub(crate) duration: Duration,
    /// Read by the kernel between submit and completion; pinned by the box.
    pub(crate) timespec: types::Timespec,
    pub(crate) callback: TimerCallback,
}

impl Operation for TimerOp {
    fn name(&self) -> &'static str {
        "timer"
    }

    fn prepare(&mut self) -> squeue::Entry {
        let remaining = self.duration.saturating_sub(self.start.elapsed());
        self.timespec = types::Timespec::new()
            .sec(remaining.as_secs())
            .nsec(remaining.subsec_nanos());
        opcode::Timeout::new(std::ptr::from_ref(&self.timespec))
            .count(1)
            .build()
    }

    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Armed {
        let elapsed = self.start.elapsed();
        if elapsed < self.duration {
            // Woken before the deadline (the timeout also completes on
            // other ring activity); re-arm for the remaining delay without
            // notifying the caller.
            return Armed::Retain;
        }

        let response = TimerResponse {
            elapsed: elapsed.as_secs_f64(),
        };
        match (self.callback)(ctx, &response) {
            Flow::Continue => {
                self.start = Instant::now();
                Armed::Retain
            }
            Flow::Stop => Armed::Remove,
        }
    }
}

pub(crate) struct AcceptOp {
    pub(crate) server: Socket,
    pub(crate) staging: RawSockAddr,
    pub(crate) addr_len: libc::socklen_t,
    pub(crate) callback: AcceptCallback,
}

impl Operation for AcceptOp {
    fn name(&self) -> &'static str {
        "accept"
    }

    fn prepare(&mut self) -> squeue::Entry {
        self.addr_len = self.staging.socklen();
        opcode::Accept::new(
            types::Fd(self.server.raw()),
            self.staging.as_mut_ptr(),
            std::ptr::from_mut(&mut self.addr_len),
        )
        .build()
    }

    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Armed {
        let response = AcceptResponse {
            client: Socket::from_raw(ctx.result),
            peer: self.staging.to_peer(),
        };
        let flow = (self.callback)(ctx, &response);
        if flow == Flow::Continue && ctx.result > 0 {
            self.staging.clear();
            Armed::Retain
        } else {
            Armed::Remove
        }
    }
}

pub(crate) struct ConnectOp {
    pub(crate) client: Socket,
    pub(crate) server_addr: RawSockAddr,
    pub(crate) callback: ConnectCallback,
}

impl Operation for ConnectOp {
    fn name(&self) -> &'static str {
        "connect"
    }

    fn prepare(&mut self) -> squeue::Entry {
        opcode::Connect::new(
            types::Fd(self.client.raw()),
            self.server_addr.as_ptr(),
            self.server_addr.socklen(),
        )
        .build()
    }

    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Armed {
        let response = ConnectResponse {
            client: self.client,
            server: self.server_addr.to_peer(),
            error: try_extract_error(ctx.result),
        };
        (self.callback)(ctx, &response);
        Armed::Remove
    }
}

pub(crate) struct SendOp {
    pub(crate) client: Socket,
    pub(crate) data: Buffer,
    pub(crate) callback: SendCallback,
}

impl Operation for SendOp {
    fn name(&self) -> &'static str {
        "send"
    }

    fn prepare(&mut self) -> squeue::Entry {
        opcode::Send::new(
            types::Fd(self.client.raw()),
            self.data.as_ptr(),
            self.data.len() as u32,
        )
        .build()
    }

    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Armed {
        let response = SendResponse {
            client: self.client,
            size: ctx.result_as_size(),
        };
        (self.callback)(ctx, &response);
        Armed::Remove
    }
}

pub(crate) struct ReceiveOp {
    pub(crate) client: Socket,
    pub(crate) buffer: Buffer,
    pub(crate) callback: ReceiveCallback,
}

impl Operation for ReceiveOp {
    fn name(&self) -> &'static str {
        "receive"
    }

    fn prepare(&mut self) -> squeue::Entry {
        opcode::Recv::new(
            types::Fd(self.client.raw()),
            self.buffer.as_mut_ptr(),
            self.buffer.len() as u32,
        )
        .build()
    }

    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Armed {
        let size = ctx.result_as_size().min(self.buffer.len());
        let response = ReceiveResponse {
            client: self.client,
            data: &self.buffer.as_slice()[..size],
        };
        let flow = (self.callback)(ctx, &response);
        if flow == Flow::Continue && ctx.result > 0 {
            self.buffer.clear();
            Armed::Retain
        } else {
            Armed::Remove
        }
    }
}

pub(crate) struct OpenFileOp {
    /// Owned, NUL-terminated; the kernel reads the bytes asynchronously.
    pub(crate) path: CString,
    pub(crate) flags: i32,
    pub(crate) mode: libc::mode_t,
    pub(crate) callback: OpenFileCallback,
}

impl Operation for OpenFileOp {
    fn name(&self) -> &'static str {
        "open_file"
    }

    fn prepare(&mut self) -> squeue::Entry {
        opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), self.path.as_ptr())
            .flags(self.flags)
            .mode(self.mode)
            .build()
    }

    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Armed {
        let response = OpenFileResponse {
            file: File::from_raw(ctx.result),
        };
        (self.callback)(ctx, &response);
        Armed::Remove
    }
}

pub(crate) struct ReadFileOp {
    pub(crate) file: File,
    pub(crate) buffer: Buffer,
    pub(crate) offset: u64,
    pub(crate) callback: ReadFileCallback,
}

impl Operation for ReadFileOp {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn prepare(&mut self) -> squeue::Entry {
        opcode::Read::new(
            types::Fd(self.file.raw()),
            self.buffer.as_mut_ptr(),
            self.buffer.len() as u32,
        )
        .offset(self.offset)
        .build()
    }

    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Armed {
        let size = ctx.result_as_size().min(self.buffer.len());
        let response = ReadFileResponse {
            file: self.file,
            data: &self.buffer.as_slice()[..size],
            offset: self.offset,
        };
        let flow = (self.callback)(ctx, &response);
        if flow == Flow::Continue && ctx.result > 0 {
            self.offset += ctx.result as u64;
            self.buffer.clear();
            Armed::Retain
        } else {
            Armed::Remove
        }
    }
}

pub(crate) struct WriteFileOp {
    pub(crate) file: File,
    pub(crate) data: Buffer,
    pub(crate) callback: WriteFileCallback,
}

impl Operation for WriteFileOp {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn prepare(&mut self) -> squeue::Entry {
        opcode::Write::new(
            types::Fd(self.file.raw()),
            self.data.as_ptr(),
            self.data.len() as u32,
        )
        .offset(0)
        .build()
    }

    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Armed {
        let response = WriteFileResponse {
            file: self.file,
            size: ctx.result_as_size(),
        };
        (self.callback)(ctx, &response);
        Armed::Remove
    }
}

pub(crate) struct StatFileOp {
    pub(crate) path: CString,
    /// Written by the kernel between submit and completion.
    pub(crate) statx: libc::statx,
    pub(crate) callback: StatFileCallback,
}

impl Operation for StatFileOp {
    fn name(&self) -> &'static str {
        "stat_file"
    }

    fn prepare(&mut self) -> squeue::Entry {
        opcode::Statx::new(
            types::Fd(libc::AT_FDCWD),
            self.path.as_ptr(),
            std::ptr::from_mut(&mut self.statx).cast::<types::statx>(),
        )
        .mask(libc::STATX_ALL)
        .build()
    }

    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Armed {
        let response = StatFileResponse {
            stats: (ctx.result >= 0).then_some(self.statx),
        };
        (self.callback)(ctx, &response);
        Armed::Remove
    }
}
