/// Logs a condition an operator has to act on and counts it.
///
/// Wraps `tracing::error!` with `alert = true` and `severity = "critical"` so
/// log pipelines can route it, and bumps `chain_indexer_critical_total`.
#[macro_export]
macro_rules! critical {
    ($($arg:tt)*) => {{
        ::metrics::counter!("chain_indexer_critical_total").increment(1);
        ::tracing::error!(
            alert = true,
            severity = "critical",
            $($arg)*
        )
    }};
}
