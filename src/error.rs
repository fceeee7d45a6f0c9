use std::fmt;

/// Builds a [`DexError`] of the given kind from a format string.
#[macro_export]
macro_rules! err {
    ($kind:ident, $($args:tt)*) => {
        $crate::error::DexError::new($crate::error::ErrorKind::$kind, format!($($args)*))
    };
}

/// Returns early with a [`DexError`] of the given kind.
#[macro_export]
macro_rules! fail {
    ($kind:ident, $($args:tt)*) => {
        return Err($crate::err!($kind, $($args)*))
    };
}

/// Failure categories shared by the resource table and dex readers/writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind
{
    /// Malformed or inconsistent header, size mismatch or truncated stream.
    Format,
    /// Unknown chunk tag or section type.
    UnsupportedFormat,
    /// Malformed logical key on create or resolve, or a key collision.
    InvalidKey,
    /// Explicit positional access outside a section.
    IndexOutOfRange,
    Io,
}

impl fmt::Display for ErrorKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            ErrorKind::Format => "format error",
            ErrorKind::UnsupportedFormat => "unsupported format",
            ErrorKind::InvalidKey => "invalid key",
            ErrorKind::IndexOutOfRange => "index out of range",
            ErrorKind::Io => "i/o error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexError
{
    kind: ErrorKind,
    msg: String,
    contexts: Vec<String>,
}

pub type DexResult<T> = Result<T, DexError>;

impl DexError
{
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self
    {
        DexError {
            kind,
            msg: msg.into(),
            contexts: Vec::new(),
        }
    }

    /// Appends an outer context; rendered as "msg for ctx1 of ctx2".
    pub fn with_context(mut self, context: impl Into<String>) -> Self
    {
        self.contexts.push(context.into());
        self
    }

    pub fn kind(&self) -> ErrorKind
    {
        self.kind
    }

    pub fn message(&self) -> &str
    {
        &self.msg
    }

    pub fn contexts(&self) -> &[String]
    {
        &self.contexts
    }
}

impl fmt::Display for DexError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}: {}", self.kind, self.msg)?;
        let mut connector = " for ";
        for context in &self.contexts
        {
            write!(f, "{}{}", connector, context)?;
            connector = " of ";
        }
        Ok(())
    }
}

impl std::error::Error for DexError {}

impl From<std::io::Error> for DexError
{
    fn from(value: std::io::Error) -> Self
    {
        DexError::new(ErrorKind::Io, value.to_string())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn truncated() -> DexResult<u32>
    {
        fail!(Format, "Unexpected end of stream reading u4 at index {}", 12);
    }

    #[test]
    fn display_chains_contexts()
    {
        let e = truncated().unwrap_err()
            .with_context("type_ids")
            .with_context("classes.dex");
        assert_eq!(e.kind(), ErrorKind::Format);
        assert_eq!(e.to_string(),
                   "format error: Unexpected end of stream reading u4 at index 12 for type_ids of classes.dex");
    }

    #[test]
    fn io_errors_map_to_io_kind()
    {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: DexError = io.into();
        assert_eq!(e.kind(), ErrorKind::Io);
        assert_eq!(err!(InvalidKey, "bad {}", "key").message(), "bad key");
    }
}
