use {std::io::Error as IoError, thiserror::Error};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {}", .source)]
    Io {
        #[from]
        source: IoError,
    },
    #[error("malformed '{}' payload, expected {} separated fields", .kind, .expected)]
    FieldCount { kind: &'static str, expected: usize },
    #[error("invalid literal near offset {}: {}", .offset, .reason)]
    Literal { offset: usize, reason: &'static str },
    #[error("'{}' is not a valid number", .text)]
    Number { text: String },
}
