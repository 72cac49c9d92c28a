//! Kubelet HTTP surface
//!
//! Serves container logs, exec, stats and the running pod list on behalf of
//! the provider.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use k8s_openapi::api::core::v1::Pod;
use kube::core::{ObjectList, TypeMeta};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::manager::ResourceManager;
use crate::provider::{AttachIo, ContainerLogOpts, Provider, ProviderError};

pub type ServerBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Header carrying the exit code of an exec request
pub const EXIT_CODE_HEADER: &str = "x-exit-code";

const EXEC_BUFFER: usize = 64 * 1024;

pub struct KubeletServer {
    provider: Arc<dyn Provider>,
    resources: Arc<ResourceManager>,
}

fn full(body: impl Into<Bytes>) -> ServerBody {
    Full::new(body.into())
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<ServerBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
}

fn json(body: Vec<u8>) -> Response<ServerBody> {
    let mut response = respond(StatusCode::OK, body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn provider_error(err: ProviderError) -> Response<ServerBody> {
    let status = match &err {
        ProviderError::NotFound(_) => StatusCode::NOT_FOUND,
        ProviderError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    respond(status, err.to_string())
}

/// `/prefix/{namespace}/{pod}/{container}`
fn container_path<'a>(path: &'a str, prefix: &str) -> Option<(&'a str, &'a str, &'a str)> {
    let rest = path.strip_prefix(prefix)?;
    let mut parts = rest.split('/');
    let (ns, pod, container) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || ns.is_empty() || pod.is_empty() || container.is_empty() {
        return None;
    }
    Some((ns, pod, container))
}

fn query_pairs(uri: &Uri) -> Vec<(String, String)> {
    uri.query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn parse_param<T: std::str::FromStr>(params: &HashMap<String, String>, name: &str) -> Result<Option<T>, String> {
    match params.get(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| format!("invalid value {:?} for {}", raw, name)),
    }
}

/// Log options from the query string
pub fn log_opts(uri: &Uri) -> Result<ContainerLogOpts, String> {
    let params: HashMap<String, String> = query_pairs(uri).into_iter().collect();
    let mut opts = ContainerLogOpts::default();
    if let Some(tail) = parse_param(&params, "tailLines")? {
        opts.tail = Some(tail);
    }
    opts.limit_bytes = parse_param(&params, "limitBytes")?;
    opts.since_seconds = parse_param(&params, "sinceSeconds")?;
    opts.follow = parse_param(&params, "follow")?.unwrap_or(false);
    opts.previous = parse_param(&params, "previous")?.unwrap_or(false);
    opts.timestamps = parse_param(&params, "timestamps")?.unwrap_or(false);
    Ok(opts)
}

impl KubeletServer {
    pub fn new(provider: Arc<dyn Provider>, resources: Arc<ResourceManager>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            resources,
        })
    }

    /// Accept connections on `port` until `token` is cancelled
    pub async fn serve(self: Arc<Self>, port: u16, token: CancellationToken) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        info!("Kubelet server listening on {}", addr);

        loop {
            let (stream, _) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection: {}", e);
                }
            });
        }

        info!("Kubelet server stopped");
        Ok(())
    }

    async fn handle_request(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<ServerBody>, hyper::Error> {
        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(self.route(&parts.method, &parts.uri, body).await)
    }

    /// Dispatch one request
    pub async fn route(&self, method: &Method, uri: &Uri, body: Bytes) -> Response<ServerBody> {
        let path = uri.path();
        debug!(%method, path, "Kubelet request");

        if let Some(target) = container_path(path, "/containerLogs/") {
            if *method != Method::GET {
                return respond(StatusCode::METHOD_NOT_ALLOWED, "");
            }
            return self.container_logs(target, uri).await;
        }
        if let Some(target) = container_path(path, "/exec/") {
            if *method != Method::POST && *method != Method::GET {
                return respond(StatusCode::METHOD_NOT_ALLOWED, "");
            }
            return self.exec(target, uri, body).await;
        }

        match (method, path) {
            (&Method::GET, "/stats/summary") | (&Method::GET, "/stats/summary/") => self.stats_summary().await,
            (&Method::GET, "/runningpods/") => self.running_pods(),
            _ => respond(StatusCode::NOT_FOUND, "Not Found"),
        }
    }

    async fn container_logs(&self, (namespace, pod, container): (&str, &str, &str), uri: &Uri) -> Response<ServerBody> {
        let opts = match log_opts(uri) {
            Ok(opts) => opts,
            Err(msg) => return respond(StatusCode::BAD_REQUEST, msg),
        };
        match self
            .provider
            .get_container_logs(namespace, pod, container, &opts)
            .await
        {
            Ok(reader) => {
                let stream = ReaderStream::new(reader).map_ok(Frame::data);
                let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                response
            }
            Err(e) => {
                warn!(namespace, pod, container, error = %e, "Failed to get container logs");
                provider_error(e)
            }
        }
    }

    async fn exec(&self, (namespace, pod, container): (&str, &str, &str), uri: &Uri, stdin: Bytes) -> Response<ServerBody> {
        let Some(executor) = self.provider.as_container_executor() else {
            return respond(StatusCode::NOT_IMPLEMENTED, "exec is not supported by this provider");
        };
        let command: Vec<String> = query_pairs(uri)
            .into_iter()
            .filter(|(k, _)| k == "command")
            .map(|(_, v)| v)
            .collect();
        if command.is_empty() {
            return respond(StatusCode::BAD_REQUEST, "missing command");
        }

        let (stdout_w, mut stdout_r) = tokio::io::duplex(EXEC_BUFFER);
        let (stderr_w, mut stderr_r) = tokio::io::duplex(EXEC_BUFFER);
        let io = AttachIo {
            stdin: Some(Box::pin(std::io::Cursor::new(stdin.to_vec()))),
            stdout: Some(Box::pin(stdout_w)),
            stderr: Some(Box::pin(stderr_w)),
            tty: false,
        };

        let mut out = Vec::new();
        let mut err = Vec::new();
        let (exit, _, _) = tokio::join!(
            executor.run_in_container(namespace, pod, container, command, io),
            stdout_r.read_to_end(&mut out),
            stderr_r.read_to_end(&mut err),
        );

        match exit {
            Ok(code) => {
                out.extend_from_slice(&err);
                let mut response = respond(StatusCode::OK, out);
                response
                    .headers_mut()
                    .insert(EXIT_CODE_HEADER, HeaderValue::from(code));
                response
            }
            Err(e) => {
                warn!(namespace, pod, container, error = %e, "Exec failed");
                provider_error(e)
            }
        }
    }

    async fn stats_summary(&self) -> Response<ServerBody> {
        let Some(metrics) = self.provider.as_metrics_provider() else {
            return respond(StatusCode::NOT_IMPLEMENTED, "stats are not supported by this provider");
        };
        match metrics.get_stats_summary().await {
            Ok(summary) => match serde_json::to_vec(&summary) {
                Ok(body) => json(body),
                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            Err(e) => provider_error(e),
        }
    }

    fn running_pods(&self) -> Response<ServerBody> {
        let list: ObjectList<Pod> = ObjectList {
            types: TypeMeta {
                api_version: "v1".to_string(),
                kind: "PodList".to_string(),
            },
            items: self
                .resources
                .get_pods()
                .iter()
                .map(|pod| (**pod).clone())
                .collect(),
            metadata: Default::default(),
        };
        match serde_json::to_vec(&list) {
            Ok(body) => json(body),
            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_paths_need_three_segments() {
        assert_eq!(
            container_path("/containerLogs/default/web/nginx", "/containerLogs/"),
            Some(("default", "web", "nginx"))
        );
        assert_eq!(container_path("/containerLogs/default/web", "/containerLogs/"), None);
        assert_eq!(container_path("/containerLogs/default//nginx", "/containerLogs/"), None);
        assert_eq!(container_path("/containerLogs/a/b/c/d", "/containerLogs/"), None);
    }

    #[test]
    fn log_options_come_from_the_query() {
        let uri: Uri = "/containerLogs/default/web/nginx?tailLines=50&follow=true&limitBytes=1024"
            .parse()
            .unwrap();
        let opts = log_opts(&uri).unwrap();
        assert_eq!(opts.tail, Some(50));
        assert!(opts.follow);
        assert_eq!(opts.limit_bytes, Some(1024));
        assert!(!opts.timestamps);

        let uri: Uri = "/containerLogs/default/web/nginx".parse().unwrap();
        assert_eq!(log_opts(&uri).unwrap(), ContainerLogOpts::default());

        let uri: Uri = "/containerLogs/default/web/nginx?tailLines=ten".parse().unwrap();
        assert!(log_opts(&uri).is_err());
    }
}
