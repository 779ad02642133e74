//! Caller-visible failure codes and the fatal path.
//!
//! Errors a client can provoke (bad names, exhausted tables, stale revisions)
//! travel back over the wire as negative integers and are always recoverable.
//! Registry or protocol corruption is not recoverable: it goes through
//! [`fatal!`](crate::fatal), which logs the context and panics (the release
//! profile aborts on panic).

use thiserror::Error;

/// Result of a registry or dispatch operation that a client asked for.
pub type RequestResult<T> = std::result::Result<T, RequestError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum RequestError {
    #[error("no master daemon is reachable")]
    NoMaster,

    #[error("invalid name")]
    InvalidName,

    #[error("name already exists")]
    Exists,

    #[error("no free slot left")]
    NoFreeSlot,

    #[error("not found")]
    NotFound,

    #[error("stale revision")]
    StaleRevision,

    #[error("anonymous node not permitted")]
    AnonymousNotPermitted,

    #[error("already opened")]
    AlreadyOpened,

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("invalid pointer")]
    InvalidPointer,
}

const ALL: [RequestError; 10] = [
    RequestError::NoMaster,
    RequestError::InvalidName,
    RequestError::Exists,
    RequestError::NoFreeSlot,
    RequestError::NotFound,
    RequestError::StaleRevision,
    RequestError::AnonymousNotPermitted,
    RequestError::AlreadyOpened,
    RequestError::InvalidParameter,
    RequestError::InvalidPointer,
];

impl RequestError {
    /// Wire code, always negative.
    pub fn code(self) -> i32 {
        match self {
            RequestError::NoMaster => -1,
            RequestError::InvalidName => -2,
            RequestError::Exists => -3,
            RequestError::NoFreeSlot => -4,
            RequestError::NotFound => -5,
            RequestError::StaleRevision => -6,
            RequestError::AnonymousNotPermitted => -7,
            RequestError::AlreadyOpened => -8,
            RequestError::InvalidParameter => -9,
            RequestError::InvalidPointer => -10,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        ALL.into_iter().find(|e| e.code() == code)
    }
}

/// Packs a request outcome into the single result parameter of a reply.
pub fn result_code(result: RequestResult<i32>) -> i32 {
    match result {
        Ok(value) => value,
        Err(e) => e.code(),
    }
}

/// Logs the diagnostic context and terminates the daemon.
///
/// Reserved for states the registry or the protocol can never legally reach.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        ::tracing::error!($($arg)*);
        panic!($($arg)*)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative_and_unique() {
        let mut seen = std::collections::HashSet::new();
        for e in ALL {
            assert!(e.code() < 0);
            assert!(seen.insert(e.code()));
            assert_eq!(RequestError::from_code(e.code()), Some(e));
        }
        assert_eq!(RequestError::from_code(0), None);
        assert_eq!(RequestError::from_code(7), None);
    }

    #[test]
    fn test_result_code_passes_values_through() {
        assert_eq!(result_code(Ok(12)), 12);
        assert_eq!(result_code(Err(RequestError::Exists)), -3);
    }

    #[test]
    #[should_panic(expected = "hash table corrupted")]
    fn test_fatal_panics_with_message() {
        fatal!("hash table corrupted at slot {}", 3);
    }
}
