use std::sync::Arc;
use std::time::Duration;

use super::{Transport, deliver};
use crate::cluster::ClusterView;
use crate::cluster::types::NodeId;
use crate::error::{EngineError, Result};
use crate::event::EventQueue;
use crate::node::protocol::{ENDPOINT_MESSAGE, Envelope, Message};
use crate::node::types::NodeEvent;

const SEND_TIMEOUT: Duration = Duration::from_millis(500);
const SEND_ATTEMPTS: usize = 3;

/// Posts bincode envelopes to the receiver's `/internal/message` endpoint.
///
/// Sends run on their own task. A message that exhausts its retries is
/// logged and dropped; the sender's pending entry is failed by the reaper.
pub struct HttpTransport {
    http_client: reqwest::Client,
    view: Arc<ClusterView>,
    local: NodeId,
    local_queue: Arc<EventQueue<NodeEvent>>,
}

impl HttpTransport {
    pub fn new(view: Arc<ClusterView>, local: NodeId, local_queue: Arc<EventQueue<NodeEvent>>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            view,
            local,
            local_queue,
        }
    }
}

impl Transport for HttpTransport {
    fn send(&self, from: &NodeId, to: &NodeId, message: Message) -> Result<()> {
        let envelope = Envelope {
            from: from.clone(),
            message,
        };
        if *to == self.local {
            return deliver(&self.local_queue, envelope);
        }

        let addr = self
            .view
            .get_member(to)
            .map(|node| node.addr)
            .ok_or_else(|| EngineError::NodeUnavailable(to.clone()))?;
        let kind = envelope.message.kind();
        let body = bincode::serialize(&envelope)
            .map_err(|e| EngineError::Transport(format!("encode {}: {}", kind, e)))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let client = self.http_client.clone();
        let url = format!("http://{}{}", addr, ENDPOINT_MESSAGE);
        let to = to.clone();
        runtime.spawn(async move {
            match post_with_retry(&client, url, body, SEND_TIMEOUT, SEND_ATTEMPTS).await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    tracing::warn!("{} to {:?} rejected: {}", kind, to, resp.status());
                }
                Err(e) => {
                    tracing::warn!("Failed to deliver {} to {:?}: {}", kind, to, e);
                }
            }
        });
        Ok(())
    }
}

async fn post_with_retry(
    client: &reqwest::Client,
    url: String,
    body: Vec<u8>,
    timeout: Duration,
    attempts: usize,
) -> anyhow::Result<reqwest::Response> {
    let mut delay_ms = 150u64;

    for attempt in 0..attempts {
        let response = client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body.clone())
            .timeout(timeout)
            .send()
            .await;

        match response {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                if attempt + 1 == attempts {
                    return Err(anyhow::anyhow!(e));
                }
                let jitter = rand::random::<u64>() % 50;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(1200);
            }
        }
    }

    Err(anyhow::anyhow!("Retry attempts exhausted"))
}
