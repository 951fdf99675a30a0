//! Strongly-typed, non-owning descriptor handles.
//!
//! The reactor never closes a descriptor implicitly; closing is an explicit
//! asynchronous operation ([`Reactor::close`](crate::reactor::Reactor::close)).
//! [`Socket`] and [`File`] convert freely into the generic [`Fd`] but not
//! into each other.

use std::fmt;
use std::os::fd::RawFd;

macro_rules! typed_fd {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(RawFd);

        impl $name {
            pub const fn from_raw(raw: RawFd) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> RawFd {
                self.0
            }

            /// A non-negative descriptor refers to an open file description.
            pub const fn is_open(self) -> bool {
                self.0 >= 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

typed_fd!(
    /// Generic descriptor, accepted wherever the kind does not matter
    /// (e.g. `close`).
    Fd
);
typed_fd!(
    /// Stream or datagram socket descriptor.
    Socket
);
typed_fd!(
    /// Regular file (or standard stream) descriptor.
    File
);

impl Fd {
    pub const INVALID: Fd = Fd(-1);
}

impl File {
    pub const STDIN: File = File(libc::STDIN_FILENO);
    pub const STDOUT: File = File(libc::STDOUT_FILENO);
    pub const STDERR: File = File(libc::STDERR_FILENO);
}

impl From<Socket> for Fd {
    fn from(socket: Socket) -> Fd {
        Fd(socket.0)
    }
}

impl From<File> for Fd {
    fn from(file: File) -> Fd {
        Fd(file.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_follows_sign() {
        assert!(Socket::from_raw(0).is_open());
        assert!(Socket::from_raw(12).is_open());
        assert!(!Socket::from_raw(-1).is_open());
        assert!(!Fd::INVALID.is_open());
    }

    #[test]
    fn ordering_and_equality_use_the_raw_value() {
        assert_eq!(File::from_raw(3), File::from_raw(3));
        assert!(Socket::from_raw(3) < Socket::from_raw(4));
        assert_ne!(Fd::from_raw(1), Fd::from_raw(2));
    }

    #[test]
    fn socket_and_file_convert_to_generic() {
        let fd: Fd = Socket::from_raw(7).into();
        assert_eq!(fd.raw(), 7);
        let fd: Fd = File::STDOUT.into();
        assert_eq!(fd.raw(), libc::STDOUT_FILENO);
    }
}
