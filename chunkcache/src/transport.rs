//! HTTP transport used to fetch chunks from the backend.

use std::sync::Arc;

use async_trait::async_trait;
use auto_impl::auto_impl;
use hyper::client::connect::Connect;
use hyper::client::HttpConnector;
use hyper::header::{CONTENT_LENGTH, RANGE};
use hyper::{Body, Client, Request, Response};
use thiserror::Error;
use tracing::trace;

use crate::Error as CacheError;

/// A client able to issue HTTP range requests against a backend.
///
/// Implementations return the raw response; interpreting the status code is
/// left to the cache. Retries and timeouts, if any, belong to the
/// implementation.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait Transport: Send + Sync {
    /// Send `GET url` with the header `Range: bytes=<start>-<end>`.
    ///
    /// Both ends of the range are inclusive, as in the HTTP `Range` header.
    async fn get_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
    ) -> Result<Response<Body>, TransportError>;

    /// Return the size in bytes of the object at `url`.
    async fn head(&self, url: &str) -> Result<u64, TransportError>;
}

/// Failure of a [`Transport`] call, before any response status is inspected.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The request could not be built, for example due to an invalid URL.
    #[error("could not build request")]
    Request(#[source] Arc<hyper::http::Error>),

    /// The request failed in flight.
    #[error("request failed")]
    Transport(#[source] Arc<hyper::Error>),

    /// The response did not carry a usable `Content-Length`.
    #[error("no content length in response with status {0}")]
    MissingLength(hyper::StatusCode),
}

/// Create a plain HTTP client suitable for use as a [`Transport`].
pub fn http_client() -> Client<HttpConnector> {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    Client::builder().build(connector)
}

/// Format the value of a `Range` header with an inclusive end.
pub fn range_header(start: u64, end: u64) -> String {
    format!("bytes={start}-{end}")
}

#[async_trait]
impl<C: Connect + Clone + Send + Sync + 'static> Transport for Client<C, Body> {
    async fn get_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
    ) -> Result<Response<Body>, TransportError> {
        let req = Request::get(url)
            .header(RANGE, range_header(start, end))
            .body(Body::empty())
            .map_err(|err| TransportError::Request(Arc::new(err)))?;
        trace!(?req, "sending range request");
        self.request(req)
            .await
            .map_err(|err| TransportError::Transport(Arc::new(err)))
    }

    async fn head(&self, url: &str) -> Result<u64, TransportError> {
        let req = Request::head(url)
            .body(Body::empty())
            .map_err(|err| TransportError::Request(Arc::new(err)))?;
        let resp = self
            .request(req)
            .await
            .map_err(|err| TransportError::Transport(Arc::new(err)))?;
        if !resp.status().is_success() {
            return Err(TransportError::MissingLength(resp.status()));
        }
        resp.headers()
            .get(CONTENT_LENGTH)
            .and_then(|len| len.to_str().ok())
            .and_then(|len| len.parse().ok())
            .ok_or_else(|| TransportError::MissingLength(resp.status()))
    }
}

impl CacheError {
    /// Attach object and chunk context to a failed transport call.
    pub(crate) fn from_transport(
        err: TransportError,
        object_id: &str,
        offset: u64,
        offset_end: u64,
    ) -> Self {
        let object_id = object_id.to_owned();
        match err {
            TransportError::Request(source) => CacheError::Request {
                object_id,
                offset,
                offset_end,
                source,
            },
            TransportError::Transport(source) => CacheError::Transport {
                object_id,
                offset,
                offset_end,
                source,
            },
            TransportError::MissingLength(status) => CacheError::Status {
                object_id,
                offset,
                offset_end,
                status,
            },
        }
    }
}
