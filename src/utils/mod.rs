/// Provide interoperability with C return values.
#[cfg(feature = "verbs")]
pub(crate) mod interop;

/// Provide poison-tolerant lock acquisition.
pub(crate) mod sync;

/// Provide random initial packet sequence numbers.
pub(crate) mod psn;
