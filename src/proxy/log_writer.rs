//! Background persistence of exchange records
//!
//! Records arrive on a bounded queue filled by the `ExchangeRecorder`. The
//! writer appends them to the `LogStore` one at a time; a failed append is
//! logged and the record dropped, the client has long since been answered.

use crate::domain::ExchangeRecord;
use crate::infrastructure::log_messages::log_writer as messages;
use crate::infrastructure::LogStore;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

pub struct LogWriter {
    store: Arc<dyn LogStore>,
    queue: mpsc::Receiver<Arc<ExchangeRecord>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl LogWriter {
    /// Create a writer and the sender the recorder publishes to
    pub fn new(
        store: Arc<dyn LogStore>,
        capacity: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Self, mpsc::Sender<Arc<ExchangeRecord>>) {
        let (tx, queue) = mpsc::channel(capacity.max(1));

        let writer = Self {
            store,
            queue,
            shutdown_rx,
        };

        (writer, tx)
    }

    /// Run until shutdown is signalled or every sender is gone; queued
    /// records are drained before returning
    pub async fn run(mut self) -> usize {
        info!("{}", messages::STARTED);
        let mut written = 0;

        loop {
            tokio::select! {
                biased;

                record = self.queue.recv() => match record {
                    Some(record) => {
                        if self.write(&record).await {
                            written += 1;
                        }
                    }
                    None => break,
                },
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("{}", messages::SHUTTING_DOWN);
                        self.queue.close();
                        while let Some(record) = self.queue.recv().await {
                            if self.write(&record).await {
                                written += 1;
                            }
                        }
                        break;
                    }
                }
            }
        }

        info!(written, "{}", messages::STOPPED);
        written
    }

    async fn write(&self, record: &ExchangeRecord) -> bool {
        match self.store.append(record).await {
            Ok(()) => {
                debug!(request_id = %record.request_id, code = %record.mapping_code, "Exchange persisted");
                true
            }
            Err(e) => {
                error!(
                    request_id = %record.request_id,
                    error = %e,
                    "{}", messages::APPEND_FAILED
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CapturedBody, MappingCode, RedactedHeaders};
    use crate::infrastructure::{InMemoryLogStore, StoreError};
    use crate::proxy::recorder::tests::draft;
    use async_trait::async_trait;
    use std::time::Duration;

    fn record() -> Arc<ExchangeRecord> {
        Arc::new(draft("ab12cd").into_record(
            200,
            RedactedHeaders::default(),
            CapturedBody::empty(),
            None,
            3,
        ))
    }

    struct FailingStore;

    #[async_trait]
    impl LogStore for FailingStore {
        async fn append(&self, _record: &ExchangeRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk full".to_string()))
        }

        async fn query(
            &self,
            _code: &MappingCode,
            _limit: usize,
            _offset: usize,
        ) -> Result<Vec<ExchangeRecord>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn writes_queued_records_to_store() {
        let store = Arc::new(InMemoryLogStore::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (writer, tx) = LogWriter::new(store.clone(), 8, shutdown_rx);
        let handle = tokio::spawn(writer.run());

        tx.send(record()).await.unwrap();
        tx.send(record()).await.unwrap();
        drop(tx);

        let written = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.count(&MappingCode::try_new("ab12cd").unwrap()), 2);
    }

    #[tokio::test]
    async fn shutdown_drains_queue() {
        let store = Arc::new(InMemoryLogStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (writer, tx) = LogWriter::new(store.clone(), 8, shutdown_rx);

        for _ in 0..3 {
            tx.try_send(record()).unwrap();
        }
        shutdown_tx.send(true).unwrap();

        let written = tokio::time::timeout(Duration::from_secs(1), writer.run())
            .await
            .unwrap();
        assert_eq!(written, 3);
    }

    #[tokio::test]
    async fn failed_append_does_not_stop_writer() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (writer, tx) = LogWriter::new(Arc::new(FailingStore), 8, shutdown_rx);
        let handle = tokio::spawn(writer.run());

        tx.send(record()).await.unwrap();
        tx.send(record()).await.unwrap();
        drop(tx);

        let written = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written, 0);
    }
}
