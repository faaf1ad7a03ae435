//! Transports that can be used for testing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::{Bytes, HttpBody};
use hyper::header::{CONTENT_LENGTH, CONTENT_RANGE};
use hyper::{Body, Response, StatusCode};
use parking_lot::{Mutex, RwLock};
use tokio::time;

use crate::transport::{Transport, TransportError};

/// A backend that serves objects from memory, keyed by URL.
///
/// Range requests are answered like an HTTP server would: `206 Partial
/// Content` with the bytes of the inclusive range, clamped to the object's
/// length.
#[derive(Default)]
pub struct Memory {
    objects: RwLock<HashMap<String, Bytes>>,
    status: Mutex<Option<StatusCode>>,
    failing: Mutex<HashSet<u64>>,
    delay: Mutex<Option<Duration>>,
    truncate: Mutex<bool>,
}

impl Memory {
    /// Create an empty backend.
    pub fn new() -> Self {
        Default::default()
    }

    /// Serve `data` at `url`.
    pub fn insert(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.write().insert(url.into(), data.into());
    }

    /// Answer every range request with `status` and the whole object.
    pub fn set_status(&self, status: StatusCode) {
        *self.status.lock() = Some(status);
    }

    /// Answer range requests starting at `start` with a server error.
    pub fn fail_range_at(&self, start: u64) {
        self.failing.lock().insert(start);
    }

    /// Wait for `delay` before answering each range request.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Abort every range response body after half of its bytes were sent.
    pub fn truncate_bodies(&self) {
        *self.truncate.lock() = true;
    }
}

fn response(status: StatusCode, body: Bytes) -> Result<Response<Body>, TransportError> {
    Response::builder()
        .status(status)
        .header(CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .map_err(|err| TransportError::Request(Arc::new(err)))
}

#[async_trait]
impl Transport for Memory {
    async fn get_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
    ) -> Result<Response<Body>, TransportError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }

        let data = match self.objects.read().get(url) {
            Some(data) => data.clone(),
            None => return response(StatusCode::NOT_FOUND, Bytes::new()),
        };
        if self.failing.lock().contains(&start) {
            return response(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new());
        }
        let status = *self.status.lock();
        if let Some(status) = status {
            return response(status, data);
        }

        let len = data.len() as u64;
        if start >= len || start > end {
            return response(StatusCode::RANGE_NOT_SATISFIABLE, Bytes::new());
        }
        let last = end.min(len - 1);
        let body = data.slice(start as usize..=last as usize);
        if *self.truncate.lock() {
            let (mut sender, channel) = Body::channel();
            let head = body.slice(..body.len() / 2);
            tokio::spawn(async move {
                if sender.send_data(head).await.is_ok() {
                    sender.abort();
                }
            });
            return Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .body(channel)
                .map_err(|err| TransportError::Request(Arc::new(err)));
        }
        let mut resp = response(StatusCode::PARTIAL_CONTENT, body)?;
        let content_range = format!("bytes {start}-{last}/{len}");
        if let Ok(value) = content_range.parse() {
            resp.headers_mut().insert(CONTENT_RANGE, value);
        }
        Ok(resp)
    }

    async fn head(&self, url: &str) -> Result<u64, TransportError> {
        match self.objects.read().get(url) {
            Some(data) => Ok(data.len() as u64),
            None => Err(TransportError::MissingLength(StatusCode::NOT_FOUND)),
        }
    }
}

/// A transport wrapper that records the requests it forwards.
pub struct Tracking<T> {
    inner: T,
    ranges: Mutex<Vec<(u64, u64)>>,

    /// Bytes of response bodies with a known length returned so far.
    pub bytes_served: AtomicU64,
}

impl<T> Tracking<T> {
    /// Wrap a transport.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            ranges: Default::default(),
            bytes_served: Default::default(),
        }
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Number of range requests forwarded so far.
    pub fn requests(&self) -> usize {
        self.ranges.lock().len()
    }

    /// The `(start, end)` pairs of all forwarded range requests, in order.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.lock().clone()
    }

    /// Number of forwarded range requests starting at `start`.
    pub fn requests_at(&self, start: u64) -> usize {
        self.ranges.lock().iter().filter(|(s, _)| *s == start).count()
    }
}

#[async_trait]
impl<T: Transport> Transport for Tracking<T> {
    async fn get_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
    ) -> Result<Response<Body>, TransportError> {
        self.ranges.lock().push((start, end));
        let resp = self.inner.get_range(url, start, end).await?;
        if let Some(len) = resp.body().size_hint().exact() {
            self.bytes_served.fetch_add(len, SeqCst);
        }
        Ok(resp)
    }

    async fn head(&self, url: &str) -> Result<u64, TransportError> {
        self.inner.head(url).await
    }
}
