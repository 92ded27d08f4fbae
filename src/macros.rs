//! Logging
//!
//! With `defmt-logging`, these forward to `defmt`, so messages use defmt's
//! format syntax (`{=u8}` and friends). Without it, the arguments are still
//! evaluated and then discarded, so no call site needs its own `cfg`.
//!
//! The stack logs at three levels only: `trace` for traffic that is dropped
//! in the normal course of things, `debug` for recoverable link and request
//! failures, and `warn` when something is given up on or refused.

#[cfg(feature = "defmt-logging")]
macro_rules! gea_log {
    (trace, $($arg:expr),*) => { defmt::trace!($($arg),*) };
    (debug, $($arg:expr),*) => { defmt::debug!($($arg),*) };
    (warn,  $($arg:expr),*) => { defmt::warn!($($arg),*) };
}

#[cfg(not(feature = "defmt-logging"))]
macro_rules! gea_log {
    ($level:ident, $($arg:expr),*) => {{ $( let _ = &$arg; )* }}
}

macro_rules! gea_trace {
    ($($arg:expr),*) => (gea_log!(trace, $($arg),*));
}

macro_rules! gea_debug {
    ($($arg:expr),*) => (gea_log!(debug, $($arg),*));
}

macro_rules! gea_warn {
    ($($arg:expr),*) => (gea_log!(warn, $($arg),*));
}
