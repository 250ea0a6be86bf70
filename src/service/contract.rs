use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::auth::{AuthGate, Authenticator};
use crate::context::RequestContext;
use crate::downstream::{Dispatcher, DownstreamClients, DownstreamOperation, HttpTransport, Transport};
use crate::errmap::{ErrorMapper, ErrorScope, HttpError};
use crate::error::{BuildError, ErrorEnvelope};
use crate::health::{HealthRegistry, ServingStatus};
use crate::settings::{ConfigError, ServiceConfig};
use crate::state::Unauthed;
use crate::status::BuildMetadata;
use crate::validate::Validator;

use super::metrics::ServiceMetrics;
use super::operation::Operation;

pub(crate) type Middleware =
    Arc<dyn Fn(RequestContext<Unauthed>) -> RequestContext<Unauthed> + Send + Sync>;

pub(crate) struct CompiledOperation {
    pub(crate) operation: Operation,
    pub(crate) gate: Option<AuthGate>,
    pub(crate) clients: DownstreamClients,
}

pub(crate) struct ContractInner {
    pub(crate) name: String,
    pub(crate) config: ServiceConfig,
    pub(crate) operations: BTreeMap<String, CompiledOperation>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) validator: Validator,
    pub(crate) mapper: ErrorMapper,
    pub(crate) middleware: Vec<Middleware>,
    pub(crate) metrics: ServiceMetrics,
    pub(crate) health: HealthRegistry,
    pub(crate) build: BuildMetadata,
}

/// The immutable description of a running service: its operations, their
/// rules and gates, the downstream clients, and the hooks installed at
/// startup.
///
/// Built once with [`ServiceContract::builder`]; cloning is cheap and every
/// clone shares the same state. Requests enter through
/// [`invoke`](Self::invoke), directly or through [`web::router`](crate::web::router).
#[derive(Clone)]
pub struct ServiceContract {
    pub(crate) inner: Arc<ContractInner>,
}

impl fmt::Debug for ServiceContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContract")
            .field("name", &self.inner.name)
            .field("operations", &self.operation_names())
            .field("downstream", &self.inner.dispatcher)
            .finish()
    }
}

impl ServiceContract {
    /// Starts building a contract for service `name`.
    pub fn builder(name: impl Into<String>) -> ServiceContractBuilder {
        ServiceContractBuilder::new(name)
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Configuration the contract was built with.
    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Operation `name`, if declared.
    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.inner.operations.get(name).map(|c| &c.operation)
    }

    /// Declared operations in name order.
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.inner.operations.values().map(|c| &c.operation)
    }

    /// Declared operation names in order.
    pub fn operation_names(&self) -> Vec<&str> {
        self.inner.operations.keys().map(String::as_str).collect()
    }

    /// Downstream clients of the whole contract.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Metrics of this contract.
    pub fn metrics(&self) -> &ServiceMetrics {
        &self.inner.metrics
    }

    /// Health table; the contract registers itself as serving.
    pub fn health(&self) -> &HealthRegistry {
        &self.inner.health
    }

    /// Build information.
    pub fn build_metadata(&self) -> &BuildMetadata {
        &self.inner.build
    }

    /// Maps `err` the way the pipeline would.
    pub fn map_error(&self, err: &ErrorEnvelope, operation: &str, request_id: &str) -> HttpError {
        self.inner.mapper.map(
            err,
            &ErrorScope {
                operation,
                request_id,
            },
        )
    }
}

/// Collects operations, downstream declarations and hooks, then checks them
/// all at once in [`build`](Self::build).
///
/// ```
/// use http::Method;
/// use service_core::{DownstreamOperation, Operation, ServiceConfig, ServiceContract};
///
/// let contract = ServiceContract::builder("encoder")
///     .config(ServiceConfig::default())
///     .downstream(DownstreamOperation::new("backend", "Encode", Method::POST, "/encode"))
///     .operation(Operation::new("Encode", Method::POST, "/encode").downstream("backend.Encode"))
///     .build()
///     .unwrap();
/// assert_eq!(contract.operation_names(), ["Encode"]);
///
/// let err = ServiceContract::builder("encoder")
///     .operation(Operation::new("Encode", Method::POST, "/encode").downstream("backend.Missing"))
///     .build()
///     .unwrap_err();
/// assert!(err.to_string().contains("backend.Missing"));
/// ```
pub struct ServiceContractBuilder {
    name: String,
    config: ServiceConfig,
    downstream: Vec<DownstreamOperation>,
    operations: Vec<Operation>,
    validator: Option<Validator>,
    authenticator: Option<Arc<dyn Authenticator>>,
    mapper: ErrorMapper,
    middleware: Vec<Middleware>,
    transport: Option<Arc<dyn Transport>>,
    build: Option<BuildMetadata>,
}

impl fmt::Debug for ServiceContractBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContractBuilder")
            .field("name", &self.name)
            .field("operations", &self.operations.len())
            .field("downstream", &self.downstream.len())
            .finish_non_exhaustive()
    }
}

impl ServiceContractBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ServiceConfig::default(),
            downstream: Vec::new(),
            operations: Vec::new(),
            validator: None,
            authenticator: None,
            mapper: ErrorMapper::new(),
            middleware: Vec::new(),
            transport: None,
            build: None,
        }
    }

    /// Uses `config`; defaults apply otherwise.
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Declares a downstream operation.
    pub fn downstream(mut self, operation: DownstreamOperation) -> Self {
        self.downstream.push(operation);
        self
    }

    /// Declares an operation.
    pub fn operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Uses `validator`, typically one with custom kinds registered.
    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Authenticates bearer credentials of operations with a rule.
    pub fn authenticator<A: Authenticator + 'static>(mut self, authenticator: A) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Installs an error-mapping override that runs before the default table.
    pub fn error_override<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ErrorEnvelope, &ErrorScope<'_>) -> Option<HttpError> + Send + Sync + 'static,
    {
        self.mapper = self.mapper.with_override(hook);
        self
    }

    /// Adds a middleware. Middleware run in order on every request before
    /// authorization and may attach extensions or set the verbose flag.
    pub fn middleware<F>(mut self, middleware: F) -> Self
    where
        F: Fn(RequestContext<Unauthed>) -> RequestContext<Unauthed> + Send + Sync + 'static,
    {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Replaces the downstream transport; an [`HttpTransport`] otherwise.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build information for the status endpoint.
    pub fn build_metadata(mut self, build: BuildMetadata) -> Self {
        self.build = Some(build);
        self
    }

    /// Checks every declaration and freezes the contract.
    ///
    /// # Errors
    ///
    /// The first [`BuildError`] found: duplicate names, unknown or malformed
    /// rules, malformed authorization expressions, a rule without an
    /// authenticator, undeclared downstream references, invalid
    /// configuration, or a transport that cannot be built.
    pub fn build(self) -> Result<ServiceContract, BuildError> {
        self.config
            .validate()
            .map_err(|report| BuildError::Config(ConfigError::Invalid(report)))?;

        let mut declared = HashSet::new();
        for operation in &self.downstream {
            let qualified = operation.qualified_name();
            if !declared.insert(qualified.clone()) {
                return Err(BuildError::DuplicateDownstream(qualified));
            }
        }

        let validator = self.validator.unwrap_or_default();
        let mut checked = Vec::with_capacity(self.operations.len());
        let mut names = HashSet::new();
        for operation in self.operations {
            if !names.insert(operation.name().to_string()) {
                return Err(BuildError::DuplicateOperation(operation.name().to_string()));
            }
            for rules in [operation.request_rule_set(), operation.response_rule_set()] {
                validator
                    .check(rules)
                    .map_err(|source| BuildError::InvalidRule {
                        operation: operation.name().to_string(),
                        source,
                    })?;
            }
            if let Some(missing) = operation
                .downstream_operations()
                .iter()
                .find(|qualified| !declared.contains(*qualified))
            {
                return Err(BuildError::UnknownDownstream {
                    operation: operation.name().to_string(),
                    downstream: missing.clone(),
                });
            }

            let gate = match operation.authorization() {
                None => None,
                Some(expression) => {
                    let authenticator = self
                        .authenticator
                        .clone()
                        .ok_or_else(|| BuildError::MissingAuthenticator(operation.name().to_string()))?;
                    let gate = AuthGate::new(authenticator).require(expression).map_err(|source| {
                        BuildError::InvalidExpression {
                            operation: operation.name().to_string(),
                            source,
                        }
                    })?;
                    Some(gate)
                }
            };
            checked.push((operation, gate));
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new()?),
        };
        let metrics = ServiceMetrics::new(&self.name)?;
        let dispatcher = Dispatcher::new(
            self.downstream,
            &self.config,
            transport,
            Some(metrics.downstream_calls()),
        );

        let operations = checked
            .into_iter()
            .map(|(operation, gate)| {
                let clients = dispatcher.bundle(operation.name(), operation.downstream_operations());
                let name = operation.name().to_string();
                (
                    name,
                    CompiledOperation {
                        operation,
                        gate,
                        clients,
                    },
                )
            })
            .collect();

        let health = HealthRegistry::new();
        health.set_status("", ServingStatus::Serving);
        health.set_status(&self.name, ServingStatus::Serving);

        let build = self
            .build
            .unwrap_or_else(|| BuildMetadata::new(self.name.clone(), "unknown"));

        tracing::info!(
            service = %self.name,
            downstream = dispatcher.len(),
            "service contract built"
        );

        Ok(ServiceContract {
            inner: Arc::new(ContractInner {
                name: self.name,
                config: self.config,
                operations,
                dispatcher,
                validator,
                mapper: self.mapper,
                middleware: self.middleware,
                metrics,
                health,
                build,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenAuthenticator;
    use crate::validate::RuleSet;
    use http::Method;

    fn op(name: &str) -> Operation {
        Operation::new(name, Method::POST, format!("/{}", name.to_lowercase()))
    }

    fn builder() -> ServiceContractBuilder {
        ServiceContract::builder("svc").transport(Arc::new(crate::mock::MockTransport::new()))
    }

    #[test]
    fn duplicate_operations_are_rejected() {
        let err = builder().operation(op("A")).operation(op("A")).build().unwrap_err();
        assert!(matches!(err, BuildError::DuplicateOperation(name) if name == "A"));
    }

    #[test]
    fn unknown_rule_kinds_fail_at_build() {
        let rules = RuleSet::new().field("name", "required,sku").unwrap();
        let err = builder()
            .operation(op("A").request_rules(rules))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidRule { .. }));
    }

    #[test]
    fn malformed_expressions_fail_at_build() {
        let err = builder()
            .authenticator(StaticTokenAuthenticator::new())
            .operation(op("A").authorize("any(jwtHasScope('a')"))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidExpression { .. }));
    }

    #[test]
    fn rules_need_an_authenticator() {
        let err = builder()
            .operation(op("A").authorize("jwtHasScope('a')"))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingAuthenticator(_)));
    }

    #[test]
    fn invalid_config_fails_at_build() {
        let mut config = ServiceConfig::default();
        config.upstream.http.base_path = "api".to_string();
        let err = builder().config(config).build().unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
    }

    #[test]
    fn contract_registers_itself_as_serving() {
        let contract = builder().operation(op("A")).build().unwrap();
        assert_eq!(contract.health().check("svc"), ServingStatus::Serving);
        assert_eq!(contract.health().check(""), ServingStatus::Serving);
        assert_eq!(contract.build_metadata().name, "svc");
    }
}
