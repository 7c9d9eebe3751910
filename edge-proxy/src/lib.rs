pub mod aggregator;
pub mod cache;
pub mod config;
pub mod cors;
pub mod credentials;
pub mod errors;
pub mod metrics_defs;
pub mod router;
pub mod signature;
pub mod upstream;
pub mod windows;

#[cfg(test)]
mod testutils;

use crate::cache::build_store;
use crate::errors::EdgeProxyError;
use crate::router::Router;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Runs the proxy and admin listeners until either fails or Ctrl-C is received.
/// Queued cache writes are flushed before returning.
pub async fn run(config: config::Config) -> Result<(), EdgeProxyError> {
    let config = Arc::new(config);
    let ready = Arc::new(AtomicBool::new(false));

    let store = build_store(&config.cache);
    let router = Router::new(config.clone(), store)?;
    ready.store(true, Ordering::Relaxed);

    let proxy_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        EdgeProxyService::new(router.clone()),
    );
    let is_ready = ready.clone();
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::<_, EdgeProxyError>::new(move || is_ready.load(Ordering::Relaxed)),
    );

    tokio::select! {
        result = async { tokio::try_join!(proxy_task, admin_task) } => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
        }
    }

    ready.store(false, Ordering::Relaxed);
    router.flush_cache().await;
    Ok(())
}

/// Buffers the request body and hands the request to the [`Router`].
pub struct EdgeProxyService {
    router: Router,
}

impl EdgeProxyService {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

impl Service<Request<Incoming>> for EdgeProxyService {
    type Response = Response<BoxBody<Bytes, Self::Error>>;
    type Error = EdgeProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let router = self.router.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let response = match body.collect().await {
                Ok(collected) => {
                    let request = Request::from_parts(parts, collected.to_bytes());
                    router.route(request).await
                }
                Err(e) => router.reject(
                    &parts.headers,
                    EdgeProxyError::RequestBodyError(e.to_string()),
                ),
            };

            Ok(response.map(|body| Full::new(body).map_err(|e| match e {}).boxed()))
        })
    }
}
