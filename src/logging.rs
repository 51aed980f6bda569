//! Replay-safe logging for orchestration code.
//!
//! Orchestrations are re-run from the top on every turn. These macros only
//! emit while the orchestration is past the persisted part of its history, so
//! each line shows up once per logical step instead of once per replay.

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(
                target: "durable_research::orchestration",
                instance_id = %$ctx.instance_id(),
                turn_idx = $ctx.turn_index(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(
                target: "durable_research::orchestration",
                instance_id = %$ctx.instance_id(),
                turn_idx = $ctx.turn_index(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(
                target: "durable_research::orchestration",
                instance_id = %$ctx.instance_id(),
                turn_idx = $ctx.turn_index(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::debug!(
                target: "durable_research::orchestration",
                instance_id = %$ctx.instance_id(),
                turn_idx = $ctx.turn_index(),
                $($arg)+
            );
        }
    }};
}
