use crate::sink::{ResponseSink, SinkError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Header name -> values, in the order they were added for that name.
pub type HeaderValues = BTreeMap<String, Vec<String>>;

/// Immutable snapshot of an upstream response, suitable for replay.
///
/// Built only by [`CaptureSink::finalize`](crate::sink::CaptureSink::finalize)
/// or by decoding a stored entry. Fields are private so a snapshot can't be
/// edited after the fact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedResponse {
    body: Bytes,
    status: StatusCode,
    headers: HeaderValues,
}

impl CachedResponse {
    pub(crate) fn from_parts(status: StatusCode, headers: HeaderValues, body: Bytes) -> Self {
        Self {
            body,
            status,
            headers,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderValues {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Serialize to the stored JSON form.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse the stored JSON form.
    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Replay this response into `sink`: every recorded header addition,
    /// then the status, then the body as a single write.
    pub async fn write_to<S>(&self, sink: &mut S) -> Result<(), SinkError>
    where
        S: ResponseSink + ?Sized,
    {
        for (name, values) in &self.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                tracing::warn!(header = %name, "skipping invalid cached header name");
                continue;
            };
            for value in values {
                match HeaderValue::from_str(value) {
                    Ok(v) => sink.append_header(name.clone(), v),
                    Err(_) => {
                        tracing::warn!(header = %name, "skipping invalid cached header value")
                    }
                }
            }
        }

        sink.write_status(self.status);
        sink.write_body(self.body.clone()).await
    }
}

/// On-the-wire layout of a cache entry.
///
/// Field names and the base64 body match entries already in production
/// Redis, so old and new writers can share a namespace.
#[derive(Serialize, Deserialize)]
struct StoredResponse<H> {
    body: Option<String>,
    status_code: u16,
    #[serde(default)]
    headers: H,
}

impl Serialize for CachedResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        StoredResponse {
            body: Some(STANDARD.encode(&self.body)),
            status_code: self.status.as_u16(),
            headers: &self.headers,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CachedResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stored = StoredResponse::<HeaderValues>::deserialize(deserializer)?;
        // older writers store an empty body as null
        let body = match stored.body {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| D::Error::custom(format!("invalid base64 body: {e}")))?,
            None => Vec::new(),
        };
        let status = StatusCode::from_u16(stored.status_code)
            .map_err(|_| D::Error::custom(format!("invalid status code {}", stored.status_code)))?;
        Ok(CachedResponse::from_parts(status, stored.headers, Bytes::from(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::{RecordingSink, SinkCall};
    use pretty_assertions::assert_eq;

    fn sample() -> CachedResponse {
        let mut headers = HeaderValues::new();
        headers.insert(
            "content-type".into(),
            vec!["application/json; charset=utf-8".into()],
        );
        headers.insert(
            "set-cookie".into(),
            vec!["b=2".into(), "a=1".into(), "c=3".into()],
        );
        CachedResponse::from_parts(
            StatusCode::PARTIAL_CONTENT,
            headers,
            Bytes::from_static(b"[{\"id\":1}]\n\x00\xff"),
        )
    }

    #[test]
    fn encode_decode_preserves_everything() {
        let original = sample();
        let data = original.encode().unwrap();
        let decoded = CachedResponse::decode(&data).unwrap();

        assert_eq!(decoded, original);
        assert_eq!(
            decoded.headers()["set-cookie"],
            vec!["b=2".to_string(), "a=1".into(), "c=3".into()]
        );
        assert_eq!(decoded.body().as_ref(), b"[{\"id\":1}]\n\x00\xff");
    }

    #[test]
    fn stored_layout_uses_base64_body() {
        let resp = CachedResponse::from_parts(
            StatusCode::OK,
            HeaderValues::new(),
            Bytes::from_static(b"hello"),
        );
        let value: serde_json::Value = serde_json::from_slice(&resp.encode().unwrap()).unwrap();

        assert_eq!(value["body"], "aGVsbG8=");
        assert_eq!(value["status_code"], 200);
        assert!(value["headers"].as_object().unwrap().is_empty());
    }

    #[test]
    fn decodes_existing_entry_layout() {
        let data = br#"{"body":"W10=","status_code":200,"headers":{"Content-Type":["application/json"]}}"#;
        let resp = CachedResponse::decode(data).unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body().as_ref(), b"[]");
        assert_eq!(resp.headers()["Content-Type"], vec!["application/json"]);
    }

    #[test]
    fn null_body_decodes_as_empty() {
        let resp = CachedResponse::decode(br#"{"body":null,"status_code":204,"headers":{}}"#).unwrap();
        assert!(resp.body().is_empty());
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn rejects_corrupt_payloads() {
        assert!(CachedResponse::decode(b"not json").is_err());
        assert!(CachedResponse::decode(br#"{"body":"%%%","status_code":200}"#).is_err());
        assert!(CachedResponse::decode(br#"{"body":"","status_code":42}"#).is_err());
    }

    #[tokio::test]
    async fn replay_writes_headers_then_status_then_one_body() {
        let resp = sample();
        let mut sink = RecordingSink::default();
        resp.write_to(&mut sink).await.unwrap();

        assert_eq!(
            sink.calls,
            vec![
                SinkCall::Header(
                    "content-type".into(),
                    "application/json; charset=utf-8".into()
                ),
                SinkCall::Header("set-cookie".into(), "b=2".into()),
                SinkCall::Header("set-cookie".into(), "a=1".into()),
                SinkCall::Header("set-cookie".into(), "c=3".into()),
                SinkCall::Status(206),
                SinkCall::Body(Bytes::from_static(b"[{\"id\":1}]\n\x00\xff")),
            ]
        );
    }

    #[tokio::test]
    async fn replay_of_empty_body_still_writes_once() {
        let resp = CachedResponse::from_parts(StatusCode::NO_CONTENT, HeaderValues::new(), Bytes::new());
        let mut sink = RecordingSink::default();
        resp.write_to(&mut sink).await.unwrap();

        assert_eq!(
            sink.calls,
            vec![SinkCall::Status(204), SinkCall::Body(Bytes::new())]
        );
    }
}
