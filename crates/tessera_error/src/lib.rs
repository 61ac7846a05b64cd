use std::error::Error;
use std::fmt;
use std::sync::Arc;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Error type used throughout the engine.
///
/// Errors are cheap to clone so that a single failure can be handed to every
/// consumer waiting on the same computation.
#[derive(Clone)]
pub struct EngineError {
    inner: Arc<EngineErrorInner>,
}

struct EngineErrorInner {
    msg: String,
    source: Option<Arc<dyn Error + Send + Sync>>,
    fields: Vec<ErrorField>,
}

#[derive(Debug, Clone)]
struct ErrorField {
    key: &'static str,
    value: String,
}

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        EngineError {
            inner: Arc::new(EngineErrorInner {
                msg: msg.into(),
                source: None,
                fields: Vec::new(),
            }),
        }
    }

    pub fn with_source(msg: impl Into<String>, source: Box<dyn Error + Send + Sync>) -> Self {
        EngineError {
            inner: Arc::new(EngineErrorInner {
                msg: msg.into(),
                source: Some(Arc::from(source)),
                fields: Vec::new(),
            }),
        }
    }

    /// Attach an additional key/value pair to the error for display.
    pub fn with_field(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        let field = ErrorField {
            key,
            value: value.to_string(),
        };
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.fields.push(field),
            None => {
                let mut fields = self.inner.fields.clone();
                fields.push(field);
                self.inner = Arc::new(EngineErrorInner {
                    msg: self.inner.msg.clone(),
                    source: self.inner.source.clone(),
                    fields,
                });
            }
        }
        self
    }

    pub fn get_msg(&self) -> &str {
        &self.inner.msg
    }

    /// Returns the value of a field previously attached with `with_field`.
    pub fn get_field(&self, key: &str) -> Option<&str> {
        self.inner
            .fields
            .iter()
            .find(|f| f.key == key)
            .map(|f| f.value.as_str())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.msg)?;
        for field in &self.inner.fields {
            write!(f, "\n  {}: {}", field.key, field.value)?;
        }
        if let Some(source) = &self.inner.source {
            write!(f, "\nError source: {source}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineError")
            .field("msg", &self.inner.msg)
            .field("fields", &self.inner.fields)
            .field("source", &self.inner.source)
            .finish()
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

impl From<fmt::Error> for EngineError {
    fn from(value: fmt::Error) -> Self {
        EngineError::with_source("Format error", Box::new(value))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        EngineError::with_source("IO error", Box::new(value))
    }
}

/// Helper for converting foreign errors into an `EngineError` with some
/// additional context.
pub trait ResultExt<T, E> {
    fn context(self, msg: &'static str) -> Result<T, EngineError>;
    fn context_fn<F: FnOnce() -> String>(self, f: F) -> Result<T, EngineError>;
}

impl<T, E: Error + Send + Sync + 'static> ResultExt<T, E> for std::result::Result<T, E> {
    fn context(self, msg: &'static str) -> Result<T, EngineError> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(EngineError::with_source(msg, Box::new(e))),
        }
    }

    fn context_fn<F: FnOnce() -> String>(self, f: F) -> Result<T, EngineError> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(EngineError::with_source(f(), Box::new(e))),
        }
    }
}

pub trait OptionExt<T> {
    /// Return an error if the option is None.
    fn required(self, msg: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, msg: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(EngineError::new(format!("Missing required value: {msg}"))),
        }
    }
}

#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)+) => {{
        let msg = format!($($arg)+);
        return Err($crate::EngineError::new(format!("Not yet implemented: {msg}")));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_fields_and_source() {
        let err = EngineError::with_source(
            "Failed to open table",
            Box::new(std::io::Error::other("disk on fire")),
        )
        .with_field("table", "people");

        let s = err.to_string();
        assert!(s.starts_with("Failed to open table"), "{s}");
        assert!(s.contains("table: people"), "{s}");
        assert!(s.contains("disk on fire"), "{s}");
        assert_eq!(Some("people"), err.get_field("table"));
    }

    #[test]
    fn with_field_on_shared_error() {
        let err = EngineError::new("shared");
        let other = err.clone().with_field("k", 4);

        assert_eq!(None, err.get_field("k"));
        assert_eq!(Some("4"), other.get_field("k"));
    }

    #[test]
    fn required_none() {
        let v: Option<i32> = None;
        let err = v.required("answer").unwrap_err();
        assert!(err.get_msg().contains("answer"));
    }

    #[test]
    fn context_wraps_source() {
        let r: std::result::Result<i32, std::num::ParseIntError> = "x".parse::<i32>();
        let err = r.context("failed to parse").unwrap_err();
        assert_eq!("failed to parse", err.get_msg());
        assert!(err.source().is_some());
    }

    fn unimplemented_thing() -> Result<()> {
        not_implemented!("thing {}", 3)
    }

    #[test]
    fn not_implemented_macro() {
        let err = unimplemented_thing().unwrap_err();
        assert_eq!("Not yet implemented: thing 3", err.get_msg());
    }
}
