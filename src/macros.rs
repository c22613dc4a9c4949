// src/macros.rs

//
// Logging macros
//
// logging feature enabled → tracing
// logging feature disabled → log_error prints to stderr so fatal escalations
// stay visible without a subscriber; the other levels only type-check their
// arguments and expand to `()`, which keeps them usable in expression
// position (match arms) and keeps log-only bindings from warning as unused
//

#![allow(unused_macros)]

// --------------------
// ERROR
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_error {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    ($($arg:tt)*) => {
        eprintln!("[mom-publisher] {}", format_args!($($arg)*))
    };
}

// --------------------
// Silent fallback shared by WARN / INFO / DEBUG
// --------------------

#[cfg(not(feature = "logging"))]
macro_rules! log_discard {
    ($($arg:tt)*) => {{
        if false {
            let _ = format_args!($($arg)*);
        }
    }};
}

// --------------------
// WARN
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::macros::log_discard!($($arg)*)
    };
}

// --------------------
// INFO
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_info {
    ($($arg:tt)*) => {
        tracing::info!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::macros::log_discard!($($arg)*)
    };
}

// --------------------
// DEBUG
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::macros::log_discard!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
pub(crate) use log_discard;

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
