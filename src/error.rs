/// Errors reported by [`ConcurrentMap`](crate::ConcurrentMap).
///
/// Ordinary contention never produces an error; it only adds latency.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A constructor or option was given a value outside its domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// An indexer-style read found no entry for the key.
    #[error("the given key was not present in the map")]
    KeyNotFound,
    /// Growing the table would exceed the configured segment ceiling.
    #[error("cannot grow past {max_segments} segments")]
    ResourceExhausted {
        /// The segment ceiling that was reached.
        max_segments: usize,
    },
    /// A neighborhood bitmap or displacement invariant does not hold.
    ///
    /// This indicates corruption; the table must not be used afterwards.
    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Reports a broken table invariant and aborts the current operation.
#[cold]
#[inline(never)]
pub(crate) fn invariant_violation(what: &'static str) -> ! {
    let error = Error::InternalInvariantViolation(what);
    tracing::error!(%error, "hopscotch table corrupted");
    panic!("{error}");
}
