/// Awaits a fallible store or provider call, retrying transient failures.
///
/// `$operation` is re-evaluated on each attempt, so it must build a fresh future.
macro_rules! retry_store_operation {
    ($context:expr, $operation:expr) => {
        $crate::retry::retry_store_operation!($context, 3, $operation)
    };
    ($context:expr, $max_attempts:expr, $operation:expr) => {{
        const RETRY_DELAY_SECS: u64 = 3;

        let max_attempts: u32 = $max_attempts;
        let context_value: String = $context.into();
        let mut attempt = 1;

        loop {
            match ($operation).await {
                Ok(value) => break Ok(value),
                Err(err) if attempt >= max_attempts => break Err(err),
                Err(err) => {
                    log::warn!(
                        "{} failed on attempt {}/{}: {}. Retrying in {}s.",
                        context_value,
                        attempt,
                        max_attempts,
                        err,
                        RETRY_DELAY_SECS
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(RETRY_DELAY_SECS)).await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_store_operation;
