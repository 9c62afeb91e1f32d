// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// The error kinds produced or propagated by the storage core.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Errno {
    // Generic.
    /// Invalid arguments.
    InvalidArgs,
    /// Out of memory.
    OutOfMemory,
    /// Not implemented.
    NotImplemented,
    /// Operation interrupted.
    Interrupted,
    /// OS-level failure not covered by a more specific kind.
    System,
    /// Entity not found.
    NotFound,
    /// Entity already exists.
    AlreadyExists,
    /// Resource is busy.
    ResourceBusy,
    /// Offset or range out of bounds.
    OutOfBounds,
    /// I/O failed.
    IoFailed,
    /// Operation timed out.
    Timeout,
    /// API called from a non-reactor thread.
    ThreadContext,

    // Storage-side.
    /// File not found.
    FileNotFound,
    /// File already exists.
    FileExists,
    /// Disk is full.
    DiskFull,
    /// Not enough free space to satisfy an allocation.
    InsufficientSpace,
    /// Stored checksum does not match the data.
    ChecksumMismatch,
    /// Offset is not valid for the target.
    InvalidOffset,
    /// Size is not valid for the target.
    InvalidSize,

    // Network-side.
    /// Generic network failure.
    Network,
    /// Connection lost.
    ConnectionLost,
    /// Connection refused by the peer.
    ConnectionRefused,
    /// Host unreachable.
    HostUnreachable,
    /// Network is down.
    NetworkDown,
    /// Address already in use.
    AddressInUse,

    // Cluster-side.
    /// Cluster is not ready to serve the request.
    ClusterNotReady,
    /// Node not found in the cluster view.
    NodeNotFound,
    /// Node is known but unreachable.
    NodeUnreachable,

    // Storage entities.
    /// Generic storage failure.
    StorageGeneric,
    /// Physical or virtual device failure.
    DeviceFailed,
    /// Device not found.
    DeviceNotFound,
    /// Volume not found.
    VolumeNotFound,
    /// Volume already exists.
    VolumeExists,
    /// Volume has active users.
    VolumeBusy,
    /// Block not found.
    BlockNotFound,
    /// Data block is corrupted.
    BlockCorrupted,

    // Replication.
    /// Generic replication failure.
    ReplicationGeneric,
    /// Replica not found.
    ReplicaNotFound,
    /// Replica holds outdated data.
    ReplicaOutdated,
    /// Replication sync operation failed.
    SyncFailed,
    /// Not enough healthy replicas available.
    NotEnoughReplicas,

    // Wire-protocol framing.
    /// Generic protocol failure.
    ProtocolGeneric,
    /// Incorrect magic number.
    MagicMismatch,
    /// Unsupported protocol version.
    VersionUnsupported,
    /// Checksum validation failed.
    ChecksumInvalid,
    /// Payload exceeds the protocol maximum.
    PayloadTooLarge,
    /// Message appears truncated.
    MessageIncomplete,
}

impl Errno {
    /// Returns `true` if a caller may reasonably retry the failed operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Errno::Network
                | Errno::ConnectionLost
                | Errno::ConnectionRefused
                | Errno::HostUnreachable
                | Errno::NetworkDown
                | Errno::Timeout
                | Errno::Interrupted
                | Errno::ResourceBusy
                | Errno::VolumeBusy
                | Errno::SyncFailed
                | Errno::ClusterNotReady
                | Errno::NodeUnreachable
        )
    }

    /// The signed status code carried in wire-protocol responses.
    pub fn wire_code(&self) -> i32 {
        match self {
            Errno::InvalidArgs => -1,
            Errno::OutOfMemory => -2,
            Errno::NotImplemented => -3,
            Errno::Interrupted => -4,
            Errno::System => -5,
            Errno::NotFound => -6,
            Errno::AlreadyExists => -7,
            Errno::ResourceBusy => -8,
            Errno::OutOfBounds => -9,
            Errno::IoFailed => -10,
            Errno::Timeout => -11,
            Errno::ThreadContext => -12,
            Errno::FileNotFound => -20,
            Errno::FileExists => -21,
            Errno::DiskFull => -22,
            Errno::InsufficientSpace => -23,
            Errno::ChecksumMismatch => -24,
            Errno::InvalidOffset => -25,
            Errno::InvalidSize => -26,
            Errno::Network => -40,
            Errno::ConnectionLost => -41,
            Errno::ConnectionRefused => -42,
            Errno::HostUnreachable => -43,
            Errno::NetworkDown => -44,
            Errno::AddressInUse => -45,
            Errno::ClusterNotReady => -60,
            Errno::NodeNotFound => -61,
            Errno::NodeUnreachable => -62,
            Errno::StorageGeneric => -80,
            Errno::DeviceFailed => -81,
            Errno::DeviceNotFound => -82,
            Errno::VolumeNotFound => -83,
            Errno::VolumeExists => -84,
            Errno::VolumeBusy => -85,
            Errno::BlockNotFound => -86,
            Errno::BlockCorrupted => -87,
            Errno::ReplicationGeneric => -100,
            Errno::ReplicaNotFound => -101,
            Errno::ReplicaOutdated => -102,
            Errno::SyncFailed => -103,
            Errno::NotEnoughReplicas => -106,
            Errno::ProtocolGeneric => -240,
            Errno::MagicMismatch => -241,
            Errno::VersionUnsupported => -242,
            Errno::ChecksumInvalid => -243,
            Errno::PayloadTooLarge => -244,
            Errno::MessageIncomplete => -245,
        }
    }

    /// Maps a wire status code back to an operation result.
    ///
    /// `0` is success; unknown negative codes collapse to the family-generic
    /// kind so that newer peers remain readable.
    pub fn from_wire(code: i32) -> core::result::Result<(), Error> {
        if code == 0 {
            return Ok(());
        }
        let errno = match code {
            -1 => Errno::InvalidArgs,
            -2 => Errno::OutOfMemory,
            -3 => Errno::NotImplemented,
            -4 => Errno::Interrupted,
            -5 => Errno::System,
            -6 => Errno::NotFound,
            -7 => Errno::AlreadyExists,
            -8 => Errno::ResourceBusy,
            -9 => Errno::OutOfBounds,
            -10 => Errno::IoFailed,
            -11 => Errno::Timeout,
            -12 => Errno::ThreadContext,
            -20 => Errno::FileNotFound,
            -21 => Errno::FileExists,
            -22 => Errno::DiskFull,
            -23 => Errno::InsufficientSpace,
            -24 => Errno::ChecksumMismatch,
            -25 => Errno::InvalidOffset,
            -26 => Errno::InvalidSize,
            -40 => Errno::Network,
            -41 => Errno::ConnectionLost,
            -42 => Errno::ConnectionRefused,
            -43 => Errno::HostUnreachable,
            -44 => Errno::NetworkDown,
            -45 => Errno::AddressInUse,
            -60 => Errno::ClusterNotReady,
            -61 => Errno::NodeNotFound,
            -62 => Errno::NodeUnreachable,
            -81 => Errno::DeviceFailed,
            -82 => Errno::DeviceNotFound,
            -83 => Errno::VolumeNotFound,
            -84 => Errno::VolumeExists,
            -85 => Errno::VolumeBusy,
            -86 => Errno::BlockNotFound,
            -87 => Errno::BlockCorrupted,
            -101 => Errno::ReplicaNotFound,
            -102 => Errno::ReplicaOutdated,
            -103 => Errno::SyncFailed,
            -106 => Errno::NotEnoughReplicas,
            -241 => Errno::MagicMismatch,
            -242 => Errno::VersionUnsupported,
            -243 => Errno::ChecksumInvalid,
            -244 => Errno::PayloadTooLarge,
            -245 => Errno::MessageIncomplete,
            c if (-99..=-80).contains(&c) => Errno::StorageGeneric,
            c if (-119..=-100).contains(&c) => Errno::ReplicationGeneric,
            c if (-259..=-240).contains(&c) => Errno::ProtocolGeneric,
            _ => Errno::System,
        };
        Err(Error::new(errno))
    }
}

/// An error kind plus an optional static message.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    /// Creates a new error with the given kind and no message.
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    /// Creates a new error with the given kind and message.
    pub const fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    /// Returns the error kind.
    pub fn errno(&self) -> Errno {
        self.errno
    }

    /// Returns `true` if a caller may reasonably retry the failed operation.
    pub fn is_recoverable(&self) -> bool {
        self.errno.is_recoverable()
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let errno = match err.kind() {
            ErrorKind::NotFound => Errno::FileNotFound,
            ErrorKind::AlreadyExists => Errno::FileExists,
            ErrorKind::ConnectionRefused => Errno::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Errno::ConnectionLost
            }
            ErrorKind::AddrInUse => Errno::AddressInUse,
            ErrorKind::TimedOut => Errno::Timeout,
            ErrorKind::Interrupted => Errno::Interrupted,
            ErrorKind::InvalidInput => Errno::InvalidArgs,
            ErrorKind::OutOfMemory => Errno::OutOfMemory,
            ErrorKind::Unsupported => Errno::NotImplemented,
            _ => Errno::IoFailed,
        };
        Error::new(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

/// The `Result` type used throughout the XSAN crates.
pub type Result<T> = core::result::Result<T, Error>;

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return core::result::Result::Err($crate::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno: expr, $msg: expr) => {
        return core::result::Result::Err($crate::Error::with_msg($errno, $msg))
    };
}
