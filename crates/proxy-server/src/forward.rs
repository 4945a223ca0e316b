use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::{self, HeaderName};
use axum::http::uri::{Authority, Scheme};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, Uri, Version};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use postgrest_cache::ResponseSink;
use std::net::SocketAddr;

pub type HttpClient = Client<HttpConnector, Body>;

/// Hop-by-hop headers, never forwarded in either direction.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// How a forward ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    /// The whole upstream response reached the sink.
    Completed,
    /// Upstream unreachable (the sink got a 502) or its body broke off.
    UpstreamFailed,
    /// The sink reported the client gone before the body finished.
    ClientGone,
}

#[derive(Debug, thiserror::Error)]
#[error("upstream uri {0} needs a scheme and a host")]
pub struct InvalidUpstream(Uri);

/// Sends requests to the upstream origin and streams the answer into
/// whatever sink it is handed.
pub struct UpstreamForwarder {
    client: HttpClient,
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    host: HeaderValue,
}

impl UpstreamForwarder {
    pub fn new(upstream: Uri) -> Result<Self, InvalidUpstream> {
        let (Some(scheme), Some(authority)) =
            (upstream.scheme().cloned(), upstream.authority().cloned())
        else {
            return Err(InvalidUpstream(upstream));
        };
        let Ok(host) = HeaderValue::from_str(authority.as_str()) else {
            return Err(InvalidUpstream(upstream));
        };
        let base_path = upstream.path().trim_end_matches('/').to_string();
        let client = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self {
            client,
            scheme,
            authority,
            base_path,
            host,
        })
    }

    /// Upstream base path joined with the inbound path and query.
    fn target_uri(&self, path_and_query: &str) -> Result<Uri, axum::http::Error> {
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(format!("{}{}", self.base_path, path_and_query))
            .build()
    }

    /// Forward `req` and write the upstream response to `sink`.
    ///
    /// Always commits a status: if the upstream can't be reached the sink
    /// gets a 502. Stops early if the sink reports the client is gone.
    pub async fn forward<S>(&self, req: Request<Body>, sink: &mut S) -> Forwarded
    where
        S: ResponseSink + ?Sized,
    {
        let (mut parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_owned();

        let target = match self.target_uri(&path_and_query) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!(error = %e, path = %path_and_query, "failed to build upstream uri");
                bad_gateway(sink).await;
                return Forwarded::UpstreamFailed;
            }
        };

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.insert(header::HOST, self.host.clone());
        if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            append_forwarded_for(&mut parts.headers, *peer);
        }
        parts.uri = target;
        parts.version = Version::HTTP_11;

        let upstream_resp = match self.client.request(Request::from_parts(parts, body)).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(error = %e, path = %path_and_query, "upstream request failed");
                bad_gateway(sink).await;
                return Forwarded::UpstreamFailed;
            }
        };

        let (mut head, mut body) = upstream_resp.into_parts();
        strip_hop_by_hop(&mut head.headers);
        for (name, value) in head.headers.iter() {
            sink.append_header(name.clone(), value.clone());
        }
        sink.write_status(head.status);

        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    if sink.write_body(data).await.is_err() {
                        tracing::debug!(path = %path_and_query, "client went away mid-response");
                        return Forwarded::ClientGone;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, path = %path_and_query, "upstream body failed mid-stream");
                    return Forwarded::UpstreamFailed;
                }
            }
        }
        Forwarded::Completed
    }
}

async fn bad_gateway<S>(sink: &mut S)
where
    S: ResponseSink + ?Sized,
{
    sink.append_header(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    sink.write_status(StatusCode::BAD_GATEWAY);
    let _ = sink.write_body(Bytes::from_static(b"Bad Gateway")).await;
}

/// Remove hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let ip = peer.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {ip}"),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder(url: &str) -> UpstreamForwarder {
        UpstreamForwarder::new(url.parse().unwrap()).unwrap()
    }

    #[test]
    fn target_keeps_path_and_query() {
        let f = forwarder("http://rest:3000");
        assert_eq!(
            f.target_uri("/rest/v1/orders?limit=10&order=id.asc").unwrap(),
            "http://rest:3000/rest/v1/orders?limit=10&order=id.asc"
        );
    }

    #[test]
    fn target_joins_upstream_base_path() {
        let f = forwarder("http://gateway:8000/supabase/");
        assert_eq!(
            f.target_uri("/rest/v1/orders").unwrap(),
            "http://gateway:8000/supabase/rest/v1/orders"
        );
    }

    #[test]
    fn rejects_relative_upstream() {
        assert!(UpstreamForwarder::new("/just/a/path".parse().unwrap()).is_err());
    }

    #[test]
    fn strips_hop_by_hop_and_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[header::ACCEPT], "application/json");
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let peer: SocketAddr = "10.0.0.7:51234".parse().unwrap();
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, peer);
        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.7");

        append_forwarded_for(&mut headers, "10.0.0.8:1".parse().unwrap());
        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.7, 10.0.0.8");
    }
}
