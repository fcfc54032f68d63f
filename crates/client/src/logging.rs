//! Component-tagged logging macros.
//!
//! Every subsystem logs under a short component tag (`"guard"`,
//! `"connection"`, `"recovery"`, `"streams"`, `"scoped"`, `"cache"`) which is
//! emitted as the structured `component` field of a `tracing` event:
//!
//! ```rust,ignore
//! log_warn!("connection"; "recreate dropped, retry in {:?}", retry_in);
//! ```

pub fn log_info_impl(component: &'static str, msg: &str) {
    tracing::info!(component, "{}", msg);
}

pub fn log_error_impl(component: &'static str, msg: &str) {
    tracing::error!(component, "{}", msg);
}

pub fn log_warn_impl(component: &'static str, msg: &str) {
    tracing::warn!(component, "{}", msg);
}

pub fn log_debug_impl(component: &'static str, msg: &str) {
    tracing::debug!(component, "{}", msg);
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    ($component:literal; $($arg:tt)*) => {
        $crate::logging::log_info_impl($component, &format!($($arg)*))
    };
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($component:literal; $($arg:tt)*) => {
        $crate::logging::log_error_impl($component, &format!($($arg)*))
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($component:literal; $($arg:tt)*) => {
        $crate::logging::log_warn_impl($component, &format!($($arg)*))
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($component:literal; $($arg:tt)*) => {
        $crate::logging::log_debug_impl($component, &format!($($arg)*))
    };
}
