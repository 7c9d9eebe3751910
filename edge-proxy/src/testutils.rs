use crate::errors::JSON_CONTENT_TYPE;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use url::Url;

/// A request as seen by the mock upstream.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    /// Path and query
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn query_param(&self, name: &str) -> Option<String> {
        let (_, query) = self.uri.split_once('?')?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }
}

pub enum Reply {
    Respond(StatusCode, &'static str, String),
    Delayed(Duration, StatusCode, String),
    /// Closes the connection without answering.
    Drop,
}

impl Reply {
    pub fn json(status: StatusCode, body: &str) -> Self {
        Reply::Respond(status, JSON_CONTENT_TYPE, body.to_string())
    }

    pub fn script(body: &str) -> Self {
        Reply::Respond(StatusCode::OK, "text/javascript", body.to_string())
    }
}

type Handler = dyn Fn(&RecordedRequest) -> Reply + Send + Sync;

/// A real HTTP/1 server on an ephemeral local port that records every request.
pub struct MockUpstream {
    pub url: Url,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockUpstream {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let handler = handler.clone();
                let recorded = recorded.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = handler.clone();
                        let recorded = recorded.clone();
                        async move { respond(req, handler, recorded).await }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        MockUpstream {
            url: Url::parse(&format!("http://127.0.0.1:{port}")).unwrap(),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

async fn respond(
    req: Request<Incoming>,
    handler: Arc<Handler>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> Result<Response<Full<Bytes>>, io::Error> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    let request = RecordedRequest {
        method: parts.method,
        uri: parts.uri.to_string(),
        headers: parts.headers,
        body,
    };
    let reply = handler(&request);
    recorded.lock().unwrap().push(request);

    let (status, content_type, body) = match reply {
        Reply::Respond(status, content_type, body) => (status, content_type, body),
        Reply::Delayed(delay, status, body) => {
            tokio::time::sleep(delay).await;
            (status, JSON_CONTENT_TYPE, body)
        }
        Reply::Drop => return Err(io::Error::other("connection dropped by mock upstream")),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, content_type.parse().unwrap());
    response
        .headers_mut()
        .insert("set-cookie", "upstream-session=1".parse().unwrap());
    Ok(response)
}
