use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use postgrest_cache::{ResponseSink, SinkError};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

/// Body chunks buffered between the producer and hyper before
/// `write_body` waits.
const BODY_CHANNEL_CAPACITY: usize = 16;

type Chunk = Result<Bytes, std::io::Error>;

/// Sink that delivers straight to the client.
///
/// Headers collect until the head is committed (first status or body
/// write); the head then goes to the waiting handler and body chunks stream
/// through a bounded channel. Dropping the sink ends the body.
pub struct ClientSink {
    headers: HeaderMap,
    head_tx: Option<oneshot::Sender<(StatusCode, HeaderMap)>>,
    body_tx: mpsc::Sender<Chunk>,
}

/// The handler's half: resolves to the response once the head is committed.
pub struct PendingResponse {
    head_rx: oneshot::Receiver<(StatusCode, HeaderMap)>,
    body_rx: mpsc::Receiver<Chunk>,
}

pub fn client_channel() -> (ClientSink, PendingResponse) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    (
        ClientSink {
            headers: HeaderMap::new(),
            head_tx: Some(head_tx),
            body_tx,
        },
        PendingResponse { head_rx, body_rx },
    )
}

impl ClientSink {
    fn commit(&mut self, status: StatusCode) {
        if let Some(tx) = self.head_tx.take() {
            // receiver gone means the client already left; body writes will report it
            let _ = tx.send((status, std::mem::take(&mut self.headers)));
        }
    }
}

#[async_trait]
impl ResponseSink for ClientSink {
    fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        if self.head_tx.is_some() {
            self.headers.append(name, value);
        }
    }

    fn write_status(&mut self, status: StatusCode) {
        self.commit(status);
    }

    async fn write_body(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        self.commit(StatusCode::OK);
        self.body_tx
            .send(Ok(chunk))
            .await
            .map_err(|_| SinkError::Closed)
    }
}

impl PendingResponse {
    /// Wait for the head. If the producer dies without committing one, the
    /// client gets a 502.
    pub async fn into_response(self) -> Response<Body> {
        match self.head_rx.await {
            Ok((status, headers)) => {
                let body = Body::from_stream(ReceiverStream::new(self.body_rx));
                let mut response = Response::new(body);
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Err(_) => {
                tracing::error!("response producer exited before writing a status");
                let mut response = Response::new(Body::from("Bad Gateway"));
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        }
    }
}
