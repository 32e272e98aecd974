use std::io;

pub use chainerror::prelude::v1::{ChainError, ChainResult};

/// Similar to `std::convert::From`, but carries the call-site location of the
/// conversion, mirroring the API chainerror exposed in earlier releases.
pub trait ChainErrorFrom<T>: Sized {
    fn chain_error_from(from: T, line_filename: Option<(u32, &'static str)>) -> ChainError<Self>;
}

/// Constructs a [`ChainError`] from a kind value, capturing the call site.
#[macro_export]
macro_rules! context {
    ($kind:expr) => {
        $crate::error::ChainError::<_>::new($kind, None, Some(format!("{}:{}", file!(), line!())))
    };
}

/// Usable with `Result::map_err`; converts the underlying error into a
/// [`ChainError`] via [`ChainErrorFrom`], capturing the call site.
#[macro_export]
macro_rules! map_context {
    () => {
        |e| $crate::error::ChainErrorFrom::chain_error_from(e, Some((line!(), file!())))
    };
}

#[derive(Clone, PartialEq, Debug)]
pub enum ErrorKind {
    Io(::std::io::ErrorKind),
    SerdeJsonSer(::serde_json::error::Category),
    SerdeJsonDe(String),
    ProtocolViolation(String),
    DescriptorsUnsupported,
    Conversion(String),
    IdlParse(String),
    InterfaceNotFound(String),
    InvalidParameter(String),
    MethodNotFound(String),
    MethodNotImplemented(String),
    ExpectedMore,
    VarlinkErrorReply(crate::Reply),
    CallContinuesMismatch,
    CallModeMismatch,
    MethodCalledAlready,
    ConnectionClosed,
    InvalidAddress,
    Timeout,
    Configuration(String),
}

impl ::std::error::Error for ErrorKind {}

impl ::std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match self {
            ErrorKind::Io(_) => write!(f, "IO error"),
            ErrorKind::SerdeJsonSer(_) => write!(f, "JSON Serialization Error"),
            ErrorKind::SerdeJsonDe(v) => write!(f, "JSON Deserialization Error of '{}'", v),
            ErrorKind::ProtocolViolation(v) => write!(f, "Protocol violation: {}", v),
            ErrorKind::DescriptorsUnsupported => {
                write!(f, "File descriptors require socket endpoints")
            }
            ErrorKind::Conversion(v) => write!(f, "Conversion error: {}", v),
            ErrorKind::IdlParse(v) => write!(f, "Varlink interface parse error: {}", v),
            ErrorKind::InterfaceNotFound(v) => write!(f, "Interface not found: '{}'", v),
            ErrorKind::InvalidParameter(v) => write!(f, "Invalid parameter: '{}'", v),
            ErrorKind::MethodNotFound(v) => write!(f, "Method not found: '{}'", v),
            ErrorKind::MethodNotImplemented(v) => write!(f, "Method not implemented: '{}'", v),
            ErrorKind::ExpectedMore => write!(f, "Method expects the 'more' call flag"),
            ErrorKind::VarlinkErrorReply(v) => write!(f, "Varlink error reply: '{:#?}'", v),
            ErrorKind::CallContinuesMismatch => write!(
                f,
                "reply with continues, but without more in the request"
            ),
            ErrorKind::CallModeMismatch => {
                write!(f, "call flags do not match the chosen call variant")
            }
            ErrorKind::MethodCalledAlready => write!(f, "Varlink: method called already"),
            ErrorKind::ConnectionClosed => write!(f, "Connection Closed"),
            ErrorKind::InvalidAddress => write!(f, "Invalid varlink address URI"),
            ErrorKind::Timeout => write!(f, "Timeout Error"),
            ErrorKind::Configuration(v) => write!(f, "Configuration error: {}", v),
        }
    }
}

fn occurrence(line_filename: Option<(u32, &'static str)>) -> Option<String> {
    line_filename.map(|(line, file)| format!("{}:{}", file, line))
}

impl ChainErrorFrom<std::io::Error> for ErrorKind {
    fn chain_error_from(
        e: io::Error,
        line_filename: Option<(u32, &'static str)>,
    ) -> ChainError<Self> {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => ChainError::<_>::new(
                ErrorKind::ConnectionClosed,
                Some(Box::from(e)),
                occurrence(line_filename),
            ),

            kind => ChainError::<_>::new(
                ErrorKind::Io(kind),
                Some(Box::from(e)),
                occurrence(line_filename),
            ),
        }
    }
}

impl ChainErrorFrom<serde_json::error::Error> for ErrorKind {
    fn chain_error_from(
        e: serde_json::error::Error,
        line_filename: Option<(u32, &'static str)>,
    ) -> ChainError<Self> {
        ChainError::<_>::new(
            ErrorKind::SerdeJsonSer(e.classify()),
            Some(Box::from(e)),
            occurrence(line_filename),
        )
    }
}

impl ChainErrorFrom<crate::convert::ConversionError> for ErrorKind {
    fn chain_error_from(
        e: crate::convert::ConversionError,
        line_filename: Option<(u32, &'static str)>,
    ) -> ChainError<Self> {
        ChainError::<_>::new(
            ErrorKind::Conversion(e.to_string()),
            Some(Box::from(e)),
            occurrence(line_filename),
        )
    }
}

pub type Result<T> = ChainResult<T, ErrorKind>;
pub type Error = ChainError<ErrorKind>;
