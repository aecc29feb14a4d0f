// Relay mirror: append-only diagnostic copy of every relayed chunk.
//
// The data path only ever does a non-blocking `try_send`; the detached task owns the sink.
// Once the queue overflows or the sink fails, mirroring stops for good so the mirrored
// file is always a clean prefix of the relayed stream.

use std::path::Path;

use bytes::Bytes;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MIRROR_QUEUE_DEPTH: usize = 256;

pub struct Mirror {
    tx: Option<mpsc::Sender<Bytes>>,
    task: Option<JoinHandle<()>>,
}

impl Mirror {
    /// Open (or create) `path` in append mode and mirror into it.
    pub async fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        debug!(path = %path.display(), "Relay mirror opened");
        Ok(Self::new(file))
    }

    /// Mirror into an arbitrary sink. Must be called inside a tokio runtime.
    pub fn new<W>(sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Bytes>(MIRROR_QUEUE_DEPTH);
        let task = tokio::spawn(async move {
            let mut sink = sink;
            while let Some(chunk) = rx.recv().await {
                if let Err(e) = sink.write_all(&chunk).await {
                    warn!(error = %e, "Relay mirror write failed, mirroring disabled");
                    return;
                }
            }
            if let Err(e) = sink.flush().await {
                warn!(error = %e, "Relay mirror flush failed");
            }
        });
        Self {
            tx: Some(tx),
            task: Some(task),
        }
    }

    pub fn is_active(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub(crate) fn offer(&mut self, chunk: &[u8]) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        match tx.try_send(Bytes::copy_from_slice(chunk)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Relay mirror cannot keep up, mirroring disabled");
                self.tx = None;
            }
            Err(TrySendError::Closed(_)) => {
                self.tx = None;
            }
        }
    }

    /// Stop accepting chunks and wait until everything queued hit the sink.
    pub async fn close(&mut self) {
        self.tx = None;
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Relay mirror task ended abnormally");
        }
    }
}
