use std::error;
use std::fmt;

/// Constructs a message-carrying [`Error`] variant from a format string.
macro_rules! err {
    ($variant:ident, $($arg:tt)*) => {
        $crate::errors::Error::$variant(format!($($arg)*))
    };
}

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// Insert of a key that is already present.
    DuplicateKey(u32),
    /// Find/update/delete of an absent key.
    NotFound(u32),
    /// A text field exceeds its fixed slot.
    StringTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    /// Allocation would exceed the page limit of the file.
    TableFull,
    /// A read or write failed, or a page came back short.
    Disk(String),
    /// Request for a page id outside the legal range.
    PageOutOfBounds(u32),
    /// A tree or freelist invariant failed during traversal.
    Corrupt(String),
    /// A command line could not be parsed.
    Syntax(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error. {}", e),
            Error::DuplicateKey(key) => write!(f, "Duplicate key {}.", key),
            Error::NotFound(key) => write!(f, "Key {} not found.", key),
            Error::StringTooLong { field, len, max } => {
                write!(f, "Value for {} is {} bytes, limit is {}.", field, len, max)
            }
            Error::TableFull => write!(f, "Table is full."),
            Error::Disk(msg) => write!(f, "Disk error. {}", msg),
            Error::PageOutOfBounds(page) => write!(f, "Page {} is out of bounds.", page),
            Error::Corrupt(msg) => write!(f, "Corruption detected. {}", msg),
            Error::Syntax(msg) => write!(f, "Syntax error. {}", msg),
        }
    }
}

impl error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}
