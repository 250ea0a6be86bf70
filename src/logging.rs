use std::fmt;

/// A request-scoped logger.
///
/// `ContextLog` is obtained from [`RequestContext::log`](crate::RequestContext::log)
/// and borrows the context, so it cannot outlive the request. Every event
/// carries the request id and operation name.
///
/// When the context's verbose flag is set, `debug` events are emitted at
/// info level so a single request can be traced without lowering the
/// global filter.
#[derive(Debug, Clone, Copy)]
pub struct ContextLog<'a> {
    request_id: &'a str,
    operation: &'a str,
    verbose: bool,
}

impl<'a> ContextLog<'a> {
    pub(crate) fn new(request_id: &'a str, operation: &'a str, verbose: bool) -> Self {
        Self {
            request_id,
            operation,
            verbose,
        }
    }

    /// Returns the request ID associated with this logger.
    pub fn request_id(&self) -> &str {
        self.request_id
    }

    /// Logs an info-level message.
    ///
    /// ```no_run
    /// # use service_core::ContextLog;
    /// # fn example(log: ContextLog<'_>, n: u32) {
    /// log.info(format_args!("dispatching {} calls", n));
    /// # }
    /// ```
    pub fn info(&self, args: fmt::Arguments<'_>) {
        tracing::info!(request_id = %self.request_id, operation = %self.operation, "{}", args);
    }

    /// Logs a warning-level message.
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        tracing::warn!(request_id = %self.request_id, operation = %self.operation, "{}", args);
    }

    /// Logs an error-level message.
    pub fn error(&self, args: fmt::Arguments<'_>) {
        tracing::error!(request_id = %self.request_id, operation = %self.operation, "{}", args);
    }

    /// Logs a debug-level message, or info-level when verbose.
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        if self.verbose {
            tracing::info!(
                request_id = %self.request_id,
                operation = %self.operation,
                verbose = true,
                "{}",
                args
            );
        } else {
            tracing::debug!(request_id = %self.request_id, operation = %self.operation, "{}", args);
        }
    }
}
