/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::{
    array::TryFromSliceError,
    fmt::{Debug, Display},
    io,
    num::TryFromIntError,
};

/// Convenience alias for a `Result<T, ANNError>`.
pub type ANNResult<T> = Result<T, ANNError>;

/// Common error type shared through the search pipeline.
///
/// The runtime origin of an error is available through `kind()`. Errors raised deep inside
/// a stage task (for example an out-of-range node id discovered by the neighbor fetcher)
/// travel up to the caller of [`crate::pipeline::SearchPipeline`] unchanged, so callers can
/// tell configuration mistakes apart from index corruption.
/// ```rust
/// use streamann::{ANNError, ANNErrorKind, error::ErrorContext};
///
/// fn load() -> Result<(), ANNError> {
///     Err(ANNError::log_index_corruption("node 42 has 300 neighbors, capacity is 64"))
/// }
///
/// let err = load().context("while loading shard 1").unwrap_err();
/// assert_eq!(err.kind(), ANNErrorKind::IndexCorruption);
/// assert!(err.to_string().contains("node 42"));
/// assert!(err.to_string().contains("shard 1"));
/// ```
///
/// # Backtraces
///
/// Backtraces will be obtained upon the first construction of an `ANNError` if the
/// environment variable `RUST_BACKTRACE=1` is set.
#[derive(Debug)]
pub struct ANNError {
    kind: ANNErrorKind,
    error: anyhow::Error,
}

impl ANNError {
    /// Construct a new `ANNError` encapsulating `err`.
    ///
    /// Errors constructed this way can be retrieved using downcasting.
    ///
    /// # Attributes
    ///
    /// - `track_caller`: Internally, the type `err` is embedded inside a `Located` struct,
    ///   recording the file and line of creation.
    ///
    /// - `inline(never)`: Error construction is kept off the happy path.
    #[track_caller]
    #[inline(never)]
    pub fn new<E>(kind: ANNErrorKind, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind,
            error: anyhow::Error::new(Located::new(err)),
        }
    }

    /// Construct a new `ANNError` encapsulating `err` tagged with `ANNErrorKind::Opaque`.
    #[track_caller]
    #[inline(never)]
    pub fn opaque<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(ANNErrorKind::Opaque, err)
    }

    /// Construct a new `ANNError` with the provided error message.
    ///
    /// # Note
    ///
    /// Errors constructed this way are not recoverable by using the downcasting API.
    #[track_caller]
    #[inline(never)]
    pub fn message<D>(kind: ANNErrorKind, display: D) -> Self
    where
        D: Display + Debug + Send + Sync + 'static,
    {
        Self {
            kind,
            error: anyhow::Error::msg(Located::new(display)),
        }
    }

    /// Attempt to downcast the error object by reference.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        match self.error.downcast_ref::<E>() {
            Some(err) => Some(err),
            None => self.error.downcast_ref::<Located<E>>().map(|e| &e.err),
        }
    }

    /// Attach the context to `Self` and return a new error.
    #[track_caller]
    #[inline(never)]
    pub fn context<C>(self, context: C) -> Self
    where
        C: Display + Debug + Send + Sync + 'static,
    {
        Self {
            kind: self.kind,
            error: self.error.context(Located::new(context)),
        }
    }

    /// Return the kind of the originally constructed error.
    pub fn kind(&self) -> ANNErrorKind {
        self.kind
    }

    //----------------------//
    // Logging constructors //
    //----------------------//

    /// Create, log and return an `IndexConfigError` for an invalid `parameter`.
    #[track_caller]
    #[inline(never)]
    pub fn log_index_config_error<D: Display>(parameter: &str, err: D) -> Self {
        let err = Self::message(
            ANNErrorKind::IndexConfigError,
            format!("{} is invalid, err = {}", parameter, err),
        );
        tracing::error!(error = %err.error, "configuration rejected");
        err
    }

    /// Create, log and return an `IndexCorruption` error.
    #[track_caller]
    #[inline(never)]
    pub fn log_index_corruption<D: Display>(err: D) -> Self {
        let err = Self::message(ANNErrorKind::IndexCorruption, err.to_string());
        tracing::error!(error = %err.error, "index corruption detected");
        err
    }

    #[track_caller]
    #[inline(never)]
    pub fn log_dimension_mismatch_error(expected: usize, found: usize) -> Self {
        Self::message(
            ANNErrorKind::DimensionMismatchError,
            format!("expected dimension {}, found {}", expected, found),
        )
    }

    #[track_caller]
    #[inline(never)]
    pub fn log_invalid_file_format<D: Display>(err: D) -> Self {
        Self::message(ANNErrorKind::InvalidFileFormatError, err.to_string())
    }

    #[track_caller]
    #[inline(never)]
    pub fn log_io_error(err: io::Error) -> Self {
        Self::new(ANNErrorKind::IOError, err)
    }

    /// Create and return a `PipelineShutdown` error describing which channel went away.
    #[track_caller]
    #[inline(never)]
    pub fn log_pipeline_shutdown<D: Display>(err: D) -> Self {
        Self::message(ANNErrorKind::PipelineShutdown, err.to_string())
    }
}

impl Display for ANNError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        // The debug format of `anyhow::Error` includes the full context chain.
        write!(formatter, "ANNError: {:?}\n\n{:?}", self.kind, self.error)
    }
}

impl std::error::Error for ANNError {}

impl From<std::convert::Infallible> for ANNError {
    #[track_caller]
    fn from(_: std::convert::Infallible) -> Self {
        unreachable!("Infallible is an unconstructible type");
    }
}

impl From<io::Error> for ANNError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        ANNError::log_io_error(err)
    }
}

impl From<TryFromIntError> for ANNError {
    #[track_caller]
    fn from(err: TryFromIntError) -> Self {
        ANNError::new(ANNErrorKind::InvalidFileFormatError, err)
    }
}

impl From<TryFromSliceError> for ANNError {
    #[track_caller]
    fn from(err: TryFromSliceError) -> Self {
        ANNError::new(ANNErrorKind::InvalidFileFormatError, err)
    }
}

impl From<tokio::task::JoinError> for ANNError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> Self {
        ANNError::new(ANNErrorKind::PipelineShutdown, err)
    }
}

/// An internal wrapper for error types that also tracks the file and line information
/// for where the error was first converted and where context was propagated.
#[derive(Debug)]
struct Located<T>
where
    T: Debug,
{
    err: T,
    location: &'static std::panic::Location<'static>,
}

impl<T> Located<T>
where
    T: Debug,
{
    #[track_caller]
    fn new(err: T) -> Self {
        Self {
            err,
            location: std::panic::Location::caller(),
        }
    }
}

impl<T> Display for Located<T>
where
    T: Display + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{} -- ({}:{})",
            self.err,
            self.location.file(),
            self.location.line()
        )
    }
}

impl<T> std::error::Error for Located<T>
where
    T: std::error::Error + Debug,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.err.source()
    }
}

//////////////////
// ErrorContext //
//////////////////

/// Add context to a returned error that will be included in the source chain.
pub trait ErrorContext<T> {
    /// Attach the provided context to the error part of the result.
    fn context<C>(self, context: C) -> Result<T, ANNError>
    where
        C: Display + Debug + Send + Sync + 'static;

    /// Attach the provided context to the error part of the result.
    ///
    /// The function `f` will only be evaluated if `self` is an `Err`.
    fn with_context<F, C>(self, f: F) -> Result<T, ANNError>
    where
        C: Display + Debug + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    ANNError: From<E>,
{
    #[track_caller]
    fn context<C>(self, context: C) -> Result<T, ANNError>
    where
        C: Display + Debug + Send + Sync + 'static,
    {
        match self {
            Ok(value) => Ok(value),
            Err(error) => Err(ANNError::from(error).context(context)),
        }
    }

    #[track_caller]
    fn with_context<F, C>(self, f: F) -> Result<T, ANNError>
    where
        C: Display + Debug + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Ok(value) => Ok(value),
            Err(error) => Err(ANNError::from(error).context(f())),
        }
    }
}

//////////////////
// ANNErrorKind //
//////////////////

/// Error kinds used to tag a returned error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ANNErrorKind {
    /// A search parameter or index metadata value is out of its permitted range.
    IndexConfigError,

    /// The index refers to a node or adjacency list that cannot exist.
    IndexCorruption,

    /// A query or stored vector does not have the expected dimension.
    DimensionMismatchError,

    /// Reading or writing the backing files failed.
    IOError,

    /// A file does not follow the expected binary layout.
    InvalidFileFormatError,

    /// A pipeline stage exited and the pipeline can no longer make progress.
    PipelineShutdown,

    /// An opaque error with no tag.
    Opaque,
}
