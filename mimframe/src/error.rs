use {
    lib_record::RecordError,
    std::{error, fmt, io::Error as IoError},
    thiserror::Error,
};

pub type CrateResult<T> = std::result::Result<T, CrateError>;
pub type MainResult<T> = std::result::Result<T, RefError>;

#[derive(Debug)]
pub struct CrateError {
    inner: Box<Err>,
}

impl<E> From<E> for CrateError
where
    E: Into<Err>,
{
    fn from(err: E) -> Self {
        Self {
            inner: Box::new(err.into()),
        }
    }
}

impl fmt::Display for CrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl error::Error for CrateError {}

/// Abstraction layer for potential early return in main if ProgramArgs init failed
#[derive(Debug)]
pub struct RefError {
    ref_err: Or,
}

impl From<&'static CrateError> for RefError {
    fn from(r: &'static CrateError) -> Self {
        Self {
            ref_err: Or::Ref(r),
        }
    }
}

impl From<CrateError> for RefError {
    fn from(e: CrateError) -> Self {
        Self {
            ref_err: Or::Err(e),
        }
    }
}

impl AsRef<CrateError> for RefError {
    fn as_ref(&self) -> &CrateError {
        match self.ref_err {
            Or::Ref(r) => r,
            Or::Err(ref e) => e,
        }
    }
}

impl fmt::Display for RefError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl error::Error for RefError {}

#[derive(Debug)]
enum Or {
    Ref(&'static CrateError),
    Err(CrateError),
}

#[derive(Debug, Error)]
pub enum Err {
    #[error("IO error: {}", .source)]
    Io {
        #[from]
        source: IoError,
    },
    #[error("Invalid config, {}", .source)]
    InvalidConfig {
        #[from]
        source: ConfigError,
    },
    #[error("Bad wire payload: {}", .source)]
    Wire {
        #[from]
        source: RecordError,
    },
    #[error("'{}' does not name a host:port address", .text)]
    Address { text: String },
}

impl Err {
    fn categorize(&self) -> Category {
        self.into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Category {
    Io,
    Config,
    Wire,
    Address,
}

impl From<&Err> for Category {
    fn from(err: &Err) -> Self {
        match err {
            Err::Io { .. } => Self::Io,
            Err::InvalidConfig { .. } => Self::Config,
            Err::Wire { .. } => Self::Wire,
            Err::Address { .. } => Self::Address,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Io => "IO",
            Self::Config => "Config",
            Self::Wire => "Wire",
            Self::Address => "Address",
        };

        write!(f, "{}", s)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("'{}' is not of the form cmd=VAR+VAR", .0)]
    BadEnvMapping(String),
    #[error("'{}' is not of the form REGEX{{REPLACE TEXT}}", .0)]
    BadAlteration(String),
    #[error("invalid alteration pattern: {}", .source)]
    BadPattern {
        #[from]
        source: regex::Error,
    },
}

pub trait LogError {
    fn log(self, level: tracing::Level) -> Self;
}

impl<T> LogError for CrateResult<T> {
    fn log(self, level: tracing::Level) -> Self {
        match self {
            ok @ Ok(_) => ok,
            Err(e) => Err(e.log(level)),
        }
    }
}

impl LogError for CrateError {
    fn log(self, level: tracing::Level) -> Self {
        match level {
            tracing::Level::ERROR => {
                tracing::error!(kind = %self.inner.categorize(), message = %self.inner)
            }
            tracing::Level::WARN => {
                tracing::warn!(kind = %self.inner.categorize(), message = %self.inner)
            }
            tracing::Level::INFO => {
                tracing::info!(kind = %self.inner.categorize(), message = %self.inner)
            }
            tracing::Level::DEBUG => {
                tracing::debug!(kind = %self.inner.categorize(), message = %self.inner)
            }
            tracing::Level::TRACE => {
                tracing::trace!(kind = %self.inner.categorize(), message = %self.inner)
            }
        }
        self
    }
}
