//! Content uploads. Progress is reported per chunk; the local timeout, if
//! configured, is re-armed on every progress notification so a slow but
//! live upload is not killed by a single fixed deadline.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::stream;
use serde_json::Value;
use tokio::sync::oneshot;

use mx_core::MxError;
use mx_timer::{RealtimeTimer, TimerKey};

use crate::gateway::{rearm_timeout, schedule_timeout, HttpGateway, Reply};
use crate::pending::{CancelHandle, PendingResult};

const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub raw_response: bool,
    pub only_content_uri: bool,
}

#[derive(Debug, Clone)]
pub enum UploadReply {
    ContentUri(String),
    Raw(Reply),
}

impl HttpGateway {
    /// `upload(blob, opts) -> PendingResult` emitting progress through `on_progress(sent, total)`.
    pub fn upload(
        &self,
        blob: Vec<u8>,
        opts: UploadOptions,
        on_progress: impl Fn(u64, u64) + Send + 'static,
    ) -> PendingResult<UploadReply> {
        let total = blob.len() as u64;
        let mut params = Vec::new();
        if let Some(token) = self.access_token() {
            params.push(("access_token".to_string(), token));
        }
        if let Some(name) = &opts.name {
            params.push(("filename".to_string(), name.clone()));
        }
        let param_refs: Vec<(&str, &str)> = params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let url = self.form_url("/upload", &param_refs, Some("/_matrix/media/v1"));

        let client = self.client_ref().clone();
        let content_type = opts.content_type.clone().unwrap_or_else(|| "application/octet-stream".to_string());
        let timer = self.timer_handle();
        let timeout_ms = self.local_timeout_ms();
        let cancel = Arc::new(CancelHandle::default());
        let (tx, rx) = oneshot::channel();

        let key_slot: Arc<Mutex<Option<TimerKey>>> = Arc::new(Mutex::new(None));
        if let Some(ms) = timeout_ms {
            *key_slot.lock().unwrap() = Some(schedule_timeout(&timer, &cancel, ms));
        }

        let cancel_for_task = cancel.clone();
        let only_content_uri = opts.only_content_uri;
        tokio::spawn(async move {
            let body_stream = chunked_progress_stream(blob, total, timer, cancel.clone(), key_slot, timeout_ms, on_progress);
            let body = reqwest::Body::wrap_stream(body_stream);

            let fut = async {
                let resp = client
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| MxError::Network(e.into()))?;
                let status = resp.status().as_u16();
                let bytes = resp.bytes().await.map_err(|e| MxError::Network(e.into()))?;
                let data: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
                if !(200..300).contains(&status) {
                    return Err(MxError::HttpStatus {
                        status,
                        body: String::from_utf8_lossy(&bytes).to_string(),
                    });
                }
                let reply = Reply {
                    code: status,
                    headers: Default::default(),
                    data: data.clone(),
                };
                if only_content_uri {
                    let uri = data.get("content_uri").and_then(Value::as_str).unwrap_or_default().to_string();
                    Ok(UploadReply::ContentUri(uri))
                } else {
                    Ok(UploadReply::Raw(reply))
                }
            };
            tokio::pin!(fut);
            let cancelled = cancel_for_task.cancelled();
            tokio::pin!(cancelled);

            let result = tokio::select! {
                r = &mut fut => r,
                err = &mut cancelled => Err(err),
            };
            let _ = tx.send(result);
        });

        PendingResult::new(rx, cancel)
    }
}

fn chunked_progress_stream(
    blob: Vec<u8>,
    total: u64,
    timer: RealtimeTimer,
    cancel: Arc<CancelHandle>,
    key_slot: Arc<Mutex<Option<TimerKey>>>,
    timeout_ms: Option<u64>,
    on_progress: impl Fn(u64, u64) + Send + 'static,
) -> impl futures::Stream<Item = std::result::Result<Bytes, std::io::Error>> {
    let chunks: Vec<Bytes> = blob.chunks(CHUNK_SIZE).map(Bytes::copy_from_slice).collect();
    let mut sent: u64 = 0;
    stream::iter(chunks.into_iter()).map(move |chunk| {
        sent += chunk.len() as u64;
        on_progress(sent, total);
        if let Some(ms) = timeout_ms {
            let mut slot = key_slot.lock().unwrap();
            let old = slot.take();
            *slot = Some(rearm_timeout(&timer, &cancel, old, ms));
        }
        Ok(chunk)
    })
}
