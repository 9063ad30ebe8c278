//! Embedding trait consumed by the semantic cache.
use std::fmt;

#[derive(Debug)]
pub enum EmbedError {
    Unavailable(String),
    InferenceFailed(String),
    DimensionMismatch { expected: usize, actual: usize },
    Io(std::io::Error),
}

impl fmt::Display for EmbedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(e) => write!(f, "embedder unavailable: {e}"),
            Self::InferenceFailed(e) => write!(f, "inference failed: {e}"),
            Self::DimensionMismatch { expected, actual } => {
                write!(f, "dimension mismatch: expected {expected}, got {actual}")
            }
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for EmbedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EmbedError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedderInfo {
    pub name: String,
    pub dimension: usize,
}

/// A text → vector function. Must be deterministic for identical input within
/// a process; may block (model inference), the cache runs it off the async
/// executor.
pub trait Embedder: Send + Sync {
    fn info(&self) -> EmbedderInfo;
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
    fn dimension(&self) -> usize {
        self.info().dimension
    }
}

/// Adapts a plain function or closure into an [`Embedder`].
pub struct FnEmbedder<F> {
    name: String,
    dimension: usize,
    f: F,
}

impl<F> FnEmbedder<F>
where
    F: Fn(&str) -> Result<Vec<f32>, EmbedError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, dimension: usize, f: F) -> Self {
        Self {
            name: name.into(),
            dimension,
            f,
        }
    }
}

impl<F> fmt::Debug for FnEmbedder<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnEmbedder")
            .field("name", &self.name)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl<F> Embedder for FnEmbedder<F>
where
    F: Fn(&str) -> Result<Vec<f32>, EmbedError> + Send + Sync,
{
    fn info(&self) -> EmbedderInfo {
        EmbedderInfo {
            name: self.name.clone(),
            dimension: self.dimension,
        }
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        (self.f)(text)
    }
}
