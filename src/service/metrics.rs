use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Counters of one contract, kept in a registry owned by that contract.
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    registry: Registry,
    requests: IntCounterVec,
    in_flight: IntGauge,
    downstream_calls: IntCounterVec,
}

impl ServiceMetrics {
    pub(crate) fn new(service: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("service_requests_total", "Inbound requests by operation and status")
                .const_label("service", service),
            &["operation", "status"],
        )?;
        let in_flight = IntGauge::with_opts(
            Opts::new("service_requests_in_flight", "Inbound requests being served")
                .const_label("service", service),
        )?;
        let downstream_calls = IntCounterVec::new(
            Opts::new(
                "service_downstream_calls_total",
                "Downstream calls by operation and outcome",
            )
            .const_label("service", service),
            &["operation", "outcome"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(downstream_calls.clone()))?;

        Ok(Self {
            registry,
            requests,
            in_flight,
            downstream_calls,
        })
    }

    /// The registry holding every metric of the contract.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn downstream_calls(&self) -> IntCounterVec {
        self.downstream_calls.clone()
    }

    pub(crate) fn record(&self, operation: &str, status: u16) {
        self.requests
            .with_label_values(&[operation, &status.to_string()])
            .inc();
    }

    pub(crate) fn enter(&self) -> InFlight {
        self.in_flight.inc();
        InFlight(self.in_flight.clone())
    }

    /// Requests answered so far for `operation` with `status`.
    pub fn requests(&self, operation: &str, status: u16) -> u64 {
        self.requests
            .with_label_values(&[operation, &status.to_string()])
            .get()
    }

    /// Downstream calls of `operation` (qualified) that ended with `outcome`.
    pub fn downstream(&self, operation: &str, outcome: &str) -> u64 {
        self.downstream_calls
            .with_label_values(&[operation, outcome])
            .get()
    }

    /// Renders the registry in the text exposition format.
    ///
    /// # Errors
    ///
    /// The encoder's error when a metric family cannot be written.
    pub fn render(&self) -> Result<(String, String), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        let body = String::from_utf8(buffer)
            .map_err(|err| prometheus::Error::Msg(err.to_string()))?;
        Ok((encoder.format_type().to_string(), body))
    }
}

/// Decrements the in-flight gauge when dropped.
pub(crate) struct InFlight(IntGauge);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.dec();
    }
}
