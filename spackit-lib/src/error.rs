use crate::layout::LayoutError;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A layout was rejected at registration time; nothing has been decoded with it.
    #[error("malformed layout: {0}")]
    MalformedLayout(#[from] LayoutError),

    /// A layout definition document could not be parsed.
    #[cfg(feature = "serde")]
    #[error("invalid layout definitions: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to create decode thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("decode worker failed: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, Error>;
