//! Single-threaded completion-based I/O reactor built on `io_uring`.
//!
//! Operations (timers, socket accept/connect/send/receive, file
//! open/read/write/stat, descriptor close, line-oriented stdin reads) are
//! submitted to the kernel ring and delivered asynchronously to
//! caller-supplied callbacks. The [`reactor::Reactor`] correlates
//! submissions with completions through a monotonically increasing
//! identifier carried in the entry's user_data field; per-operation records
//! own every buffer and path the kernel touches until the completion
//! arrives.
//!
//! ```no_run
//! use std::time::Duration;
//! use rivulet::{Flow, Reactor, StopSignal};
//!
//! let stop = StopSignal::new();
//! let mut reactor = Reactor::new()?;
//! reactor.timer(
//!     Duration::from_secs(1),
//!     |ctx, response| {
//!         println!("fired after {:.3}s", response.elapsed);
//!         ctx.stop.request_stop();
//!         Flow::Stop
//!     },
//!     None,
//! )?;
//! reactor.run(&stop)?;
//! # Ok::<(), rivulet::Error>(())
//! ```

pub mod buffer;
pub mod error;
pub mod fd;
pub mod net;
pub mod reactor;

pub use buffer::Buffer;
pub use error::{check, try_extract_error, Error, Result};
pub use fd::{Fd, File, Socket};
pub use net::{PeerAddr, TcpListener, UnixListener};
pub use reactor::ops::{
    AcceptResponse, CloseResponse, ConnectResponse, Flow, OpenFileResponse, ReadFileResponse,
    ReadLineResponse, ReceiveResponse, SendResponse, StatFileResponse, TimerResponse,
    WriteFileResponse,
};
pub use reactor::{Dispatcher, EventContext, Reactor, StopSignal, SubmitGuard};
