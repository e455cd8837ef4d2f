//! Pod log streams.

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, LogParams},
    Client,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::StoreError;

/// Raw log bytes as they arrive from the cluster.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    /// Keep the stream open while the container runs
    pub follow: bool,
    /// Start from the last n lines (server-side)
    pub tail_lines: Option<i64>,
    /// Logs of the previous container instance
    pub previous: bool,
    pub container: Option<String>,
}

#[async_trait::async_trait]
pub trait LogSource: Send + Sync {
    async fn open_logs(&self, namespace: &str, pod: &str, opts: &LogOptions) -> Result<ByteStream, StoreError>;
}

#[derive(Clone)]
pub struct KubeLogs {
    client: Client,
}

impl KubeLogs {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl LogSource for KubeLogs {
    async fn open_logs(&self, namespace: &str, pod: &str, opts: &LogOptions) -> Result<ByteStream, StoreError> {
        use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};

        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = LogParams {
            follow: opts.follow,
            tail_lines: opts.tail_lines,
            previous: opts.previous,
            container: opts.container.clone(),
            ..Default::default()
        };
        info!(ns = %namespace, pod = %pod, follow = lp.follow, tail = ?lp.tail_lines, "log stream opening");
        let reader = api.log_stream(pod, &lp).await.map_err(|e| StoreError::from_kube(e, "Pod", namespace, pod))?;
        // futures::io::AsyncRead -> tokio::io::AsyncRead -> Stream<Bytes>
        Ok(ReaderStream::new(reader.compat()).boxed())
    }
}
