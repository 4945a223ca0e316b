use crate::response::{CachedResponse, HeaderValues};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("client went away before the response completed")]
    Closed,
}

/// Destination for an HTTP response as it is produced.
///
/// Implementations: the client-facing sink in the proxy binary, and
/// [`CaptureSink`], which records everything while forwarding it.
/// The head is committed by the first `write_status` or `write_body`;
/// headers appended after that are not delivered.
#[async_trait]
pub trait ResponseSink: Send {
    fn append_header(&mut self, name: HeaderName, value: HeaderValue);

    fn write_status(&mut self, status: StatusCode);

    async fn write_body(&mut self, chunk: Bytes) -> Result<(), SinkError>;
}

/// Forwards every call to the wrapped sink immediately and keeps a copy of
/// the status, headers and body bytes it saw.
pub struct CaptureSink<S> {
    inner: S,
    status: StatusCode,
    headers: HeaderValues,
    body: BytesMut,
    committed: bool,
}

impl<S: ResponseSink> CaptureSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            status: StatusCode::OK,
            headers: HeaderValues::new(),
            body: BytesMut::new(),
            committed: false,
        }
    }

    /// Number of body bytes captured so far.
    pub fn captured_len(&self) -> usize {
        self.body.len()
    }

    /// Snapshot what was captured, handing back the wrapped sink.
    ///
    /// Dropping the returned sink is what ends the client's response, so
    /// callers decide whether that happens before or after storing.
    pub fn finalize(self) -> (CachedResponse, S) {
        let response = CachedResponse::from_parts(self.status, self.headers, self.body.freeze());
        (response, self.inner)
    }
}

#[async_trait]
impl<S: ResponseSink> ResponseSink for CaptureSink<S> {
    fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        if !self.committed {
            self.headers
                .entry(name.as_str().to_owned())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        self.inner.append_header(name, value);
    }

    fn write_status(&mut self, status: StatusCode) {
        if !self.committed {
            self.status = status;
            self.committed = true;
        }
        self.inner.write_status(status);
    }

    async fn write_body(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        self.committed = true;
        self.body.extend_from_slice(&chunk);
        self.inner.write_body(chunk).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum SinkCall {
        Header(String, String),
        Status(u16),
        Body(Bytes),
    }

    /// Records every call in order. With `closed` set, body writes fail
    /// after being recorded.
    #[derive(Default)]
    pub struct RecordingSink {
        pub calls: Vec<SinkCall>,
        pub closed: bool,
    }

    #[async_trait]
    impl ResponseSink for RecordingSink {
        fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
            self.calls.push(SinkCall::Header(
                name.as_str().to_owned(),
                value.to_str().unwrap().to_owned(),
            ));
        }

        fn write_status(&mut self, status: StatusCode) {
            self.calls.push(SinkCall::Status(status.as_u16()));
        }

        async fn write_body(&mut self, chunk: Bytes) -> Result<(), SinkError> {
            self.calls.push(SinkCall::Body(chunk));
            if self.closed {
                return Err(SinkError::Closed);
            }
            Ok(())
        }
    }
}
