//! Logging macros that tag every line with the local node identity.

use std::sync::OnceLock;

use env_logger::Env;

/// Node identity printed in front of every log line; `-` until set.
pub static ME: OnceLock<String> = OnceLock::new();

#[doc(hidden)]
#[macro_export]
macro_rules! pf_log {
    ($level:expr, $($fmt_args:tt)*) => {
        log::log!(
            $level,
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Per-message protocol chatter: votes received, batches cut.
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Trace, $($fmt_args)*)
    };
}

/// State transitions of sequences, buckets and windows.
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Debug, $($fmt_args)*)
    };
}

#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Info, $($fmt_args)*)
    };
}

/// Observed Byzantine behavior of peers and clients.
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Warn, $($fmt_args)*)
    };
}

#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Error, $($fmt_args)*)
    };
}

/// Installs `env_logger` (default filter `info`) unless a logger is already
/// in place, and records the node identity if given. Only the first identity
/// set sticks.
pub fn logger_init(me: Option<String>) {
    if let Some(me) = me {
        let _ = ME.set(me);
    }
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Logs the message at error level and evaluates to
/// `Err(MiradorError::ContractViolation(message))`.
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {{
        let msg = format!($($fmt_args)*);
        $crate::pf_error!("{}", msg);
        Err($crate::MiradorError::msg(msg))
    }};
}
