use std::fmt;
use std::io;
use std::net::AddrParseError;

/// Parser/codec failures.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum ProtocolError {
    UnknownType,
    ReadData,
    UnknownState,
    UnsupportedSize,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownType => write!(f, "unknown message type"),
            ProtocolError::ReadData => write!(f, "truncated payload"),
            ProtocolError::UnknownState => write!(f, "impossible parser transition"),
            ProtocolError::UnsupportedSize => write!(f, "frame length exceeds maximum"),
        }
    }
}

/// Subkinds for wrapped OS errors.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum IoErrorKind {
    ClosedFd,
    Eof,
    Other(io::ErrorKind),
}

/// The full error taxonomy, as kinds rather than types.
#[derive(Debug)]
pub enum Error {
    /// A non-fatal "try again later" outcome (`WouldBlock`/`Interrupted`).
    /// Never surfaced to a storage-API caller; reactor and session code loop
    /// on it internally.
    Wait,
    Config(String),
    InvalidPath,
    InvalidName,
    NoSuchHandle,
    NoSpace,
    TypeMismatch,
    DataTooLarge,
    CannotDeleteRoot,
    EntryDeleted,
    NoParent,
    Io(IoErrorKind),
    Protocol(ProtocolError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Wait => write!(f, "would block"),
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::InvalidPath => write!(f, "invalid path"),
            Error::InvalidName => write!(f, "invalid name"),
            Error::NoSuchHandle => write!(f, "no such handle"),
            Error::NoSpace => write!(f, "handle table full"),
            Error::TypeMismatch => write!(f, "value type mismatch"),
            Error::DataTooLarge => write!(f, "raw/array value exceeds 254 elements"),
            Error::CannotDeleteRoot => write!(f, "cannot delete the root object"),
            Error::EntryDeleted => write!(f, "entry is deleted"),
            Error::NoParent => write!(f, "object has no parent"),
            Error::Io(kind) => write!(f, "io error: {:?}", kind),
            Error::Protocol(p) => write!(f, "protocol error: {}", p),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// True for outcomes that mean "not ready yet", as opposed to a fatal error.
    #[inline]
    pub fn is_wait(&self) -> bool {
        matches!(self, Error::Wait)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Error::Wait,
            io::ErrorKind::UnexpectedEof => Error::Io(IoErrorKind::Eof),
            io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => {
                Error::Io(IoErrorKind::ClosedFd)
            }
            other => Error::Io(IoErrorKind::Other(other)),
        }
    }
}

impl From<AddrParseError> for Error {
    fn from(_err: AddrParseError) -> Self {
        Error::Config("could not parse address".to_string())
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
