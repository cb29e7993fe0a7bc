use axum::{
    body::BoxBody,
    http::{HeaderValue, Method, Request, Response, StatusCode},
    response::IntoResponse,
};
use futures::future::BoxFuture;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::{AxumTusHeaders, TusHeaderMap, TUS_VERSION};

/// Enforces `Tus-Resumable` on requests and stamps it on every response.
#[derive(Debug, Clone, Default)]
pub struct TusLayer;

impl TusLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for TusLayer {
    type Service = TusService<S>;

    fn layer(&self, service: S) -> Self::Service {
        TusService {
            service,
            version: TUS_VERSION,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TusService<S> {
    service: S,
    version: &'static str,
}

impl<S, B> Service<Request<B>> for TusService<S>
where
    S: Service<Request<B>, Response = Response<BoxBody>> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let version = self.version;

        // OPTIONS is how a client discovers the version, so it may omit the header.
        if request.method() != Method::OPTIONS && !speaks_version(&request, version) {
            tracing::debug!(
                method = %request.method(),
                uri = %request.uri(),
                "rejecting request without a supported Tus-Resumable"
            );

            let headers = TusHeaderMap {
                version: Some(vec![version.to_string()]),
                ..TusHeaderMap::with_tus_version()
            }
            .into_header_map();
            let response = (StatusCode::PRECONDITION_FAILED, headers).into_response();

            return Box::pin(async move { Ok(response) });
        }

        let fut = self.service.call(request);

        Box::pin(async move {
            let mut response = fut.await?;
            response
                .headers_mut()
                .insert(AxumTusHeaders::Resumable.header_name(), HeaderValue::from_static(version));
            Ok(response)
        })
    }
}

fn speaks_version<B>(request: &Request<B>, version: &str) -> bool {
    request
        .headers()
        .get(AxumTusHeaders::Resumable.name())
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value.trim() == version)
}
