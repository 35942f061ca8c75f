use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    UnexpectedEof,
    InvalidMagic(u32),
    UnsupportedVersion(u16),
    InvalidUtf8,
    TrailingBytes(usize),
    TooLarge(&'static str),
    TooDeep(usize),
    Other(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnexpectedEof => write!(f, "unexpected end of input"),
            Error::InvalidMagic(magic) => write!(f, "invalid module magic: 0x{magic:08x}"),
            Error::UnsupportedVersion(version) => {
                write!(f, "unsupported module format version: {version}")
            }
            Error::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Error::TrailingBytes(n) => write!(f, "{n} trailing bytes after module image"),
            Error::TooLarge(what) => write!(f, "{what} does not fit the module format"),
            Error::TooDeep(limit) => {
                write!(f, "type nesting exceeds {limit} levels")
            }
            Error::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Error {}
