use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    /// Acquiring a connection failed (store unreachable, auth rejected).
    Connection,
    /// Executing a query or fetching one of its rows failed.
    Query,
    /// A cached computation failed; the original error is the source.
    CacheCompute,
    Cancelled,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    query: Option<String>,
    offset: Option<u64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            query: None,
            offset: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Kind of the innermost `Error` in the source chain.
    ///
    /// A `CacheCompute` failure caused by a dropped connection reports
    /// `Connection` here, while `kind()` still reports `CacheCompute`.
    pub fn root_kind(&self) -> ErrorKind {
        let mut kind = self.kind;
        let mut cur = self.source();
        while let Some(source) = cur {
            if let Some(err) = source.downcast_ref::<Error>() {
                kind = err.kind;
            }
            cur = source.source();
        }
        kind
    }

    pub(crate) fn cancelled() -> Self {
        Error::new(ErrorKind::Cancelled).with_message("operation cancelled")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(query) = &self.query {
            write!(f, " (query: {query})")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " (offset: {offset})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::Connection => 3,
        ErrorKind::Query => 4,
        ErrorKind::CacheCompute => 5,
        ErrorKind::Cancelled => 6,
        ErrorKind::Io => 7,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, to_exit_code};

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::Connection, 3),
            (ErrorKind::Query, 4),
            (ErrorKind::CacheCompute, 5),
            (ErrorKind::Cancelled, 6),
            (ErrorKind::Io, 7),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn display_includes_query_and_offset() {
        let err = Error::new(ErrorKind::Query)
            .with_message("fetch failed")
            .with_query("SELECT 1")
            .with_offset(20);
        assert_eq!(
            err.to_string(),
            "Query: fetch failed (query: SELECT 1) (offset: 20)"
        );
    }

    #[test]
    fn root_kind_follows_wrapped_errors() {
        let inner = Error::new(ErrorKind::Connection).with_message("refused");
        let outer = Error::new(ErrorKind::CacheCompute).with_source(inner);
        assert_eq!(outer.kind(), ErrorKind::CacheCompute);
        assert_eq!(outer.root_kind(), ErrorKind::Connection);
    }
}
