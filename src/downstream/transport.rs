use std::fmt;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};

use super::{DownstreamCall, DownstreamReply, Transport, TransportError};
use crate::error::BuildError;

/// A [`Transport`] over HTTP, backed by `reqwest`.
///
/// Transport options can be adjusted in two ways: [`configure`](Self::configure)
/// adds options on top of the defaults, [`with_client`](Self::with_client)
/// replaces the client entirely.
///
/// ```no_run
/// use std::time::Duration;
/// use service_core::HttpTransport;
///
/// let transport = HttpTransport::configure(|builder| {
///     builder.pool_idle_timeout(Duration::from_secs(30))
/// })?;
/// # Ok::<(), service_core::BuildError>(())
/// ```
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// A transport with default options.
    ///
    /// # Errors
    ///
    /// [`BuildError::Transport`] when the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, BuildError> {
        Self::configure(|builder| builder)
    }

    /// A transport with the defaults plus whatever `adjust` sets.
    ///
    /// # Errors
    ///
    /// [`BuildError::Transport`] when the client cannot be built.
    pub fn configure<F>(adjust: F) -> Result<Self, BuildError>
    where
        F: FnOnce(ClientBuilder) -> ClientBuilder,
    {
        let builder = Client::builder().user_agent(concat!("service-core/", env!("CARGO_PKG_VERSION")));
        let client = adjust(builder)
            .build()
            .map_err(|err| BuildError::Transport(err.to_string()))?;
        Ok(Self { client })
    }

    /// A transport over a caller-built client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, call: DownstreamCall) -> Result<DownstreamReply, TransportError> {
        let mut request = self
            .client
            .request(call.method.clone(), call.url())
            .headers(call.headers.clone())
            .timeout(call.timeout);
        if !call.query.is_empty() {
            request = request.query(&call.query);
        }
        if let Some(body) = &call.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;
        Ok(DownstreamReply {
            status,
            headers,
            body,
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::DeadlineExceeded
    } else if err.is_connect() {
        TransportError::Unreachable(err.to_string())
    } else {
        TransportError::Failed(err.to_string())
    }
}
