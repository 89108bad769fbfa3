use std::fmt;
use std::io;

#[derive(Debug)]
pub struct Error(String);

impl From<&str> for Error {
    fn from(s: &str) -> Error {
        Error(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Error {
        Error(s)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error(format!("{}", err))
    }
}

impl From<discman::Error> for Error {
    fn from(err: discman::Error) -> Error {
        Error(format!("{}", err))
    }
}

#[cfg(target_os = "linux")]
impl From<discman::linux::BlockError> for Error {
    fn from(err: discman::linux::BlockError) -> Error {
        Error(format!("{}", err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
