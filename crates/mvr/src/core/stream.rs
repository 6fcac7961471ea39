//! The data stream: bounded batch channel plus the column pair.

use std::sync::atomic::{AtomicU64, Ordering};

use super::column::Column;
use super::value::Batch;

/// One reader producer, N writer consumers.
///
/// Created by a driver's preflight; the source columns reflect what the
/// driver returned, the destination columns start as a copy and then have
/// user overrides applied. Both sets are immutable afterwards. The reader
/// closes the channel when the row stream is exhausted or fails, which is
/// the writers' normal completion signal.
pub struct DataStream {
    pub columns: Vec<Column>,
    pub dest_columns: Vec<Column>,
    pub batch_size: usize,
    sender: async_channel::Sender<Batch>,
    receiver: async_channel::Receiver<Batch>,
    total_rows: AtomicU64,
}

impl DataStream {
    /// Build a stream over a bounded channel of `batch_count` batches.
    ///
    /// Panics if the column sets are misaligned; drivers construct the
    /// destination set from the source set, so a mismatch is a bug.
    pub fn new(
        columns: Vec<Column>,
        dest_columns: Vec<Column>,
        batch_size: usize,
        batch_count: usize,
    ) -> Self {
        assert_eq!(
            columns.len(),
            dest_columns.len(),
            "source and destination column sets must align"
        );
        let (sender, receiver) = async_channel::bounded(batch_count.max(1));
        Self {
            columns,
            dest_columns,
            batch_size,
            sender,
            receiver,
            total_rows: AtomicU64::new(0),
        }
    }

    /// Sender side, held by the single reader task.
    pub fn sender(&self) -> async_channel::Sender<Batch> {
        self.sender.clone()
    }

    /// Receiver side, cloned per writer worker.
    pub fn receiver(&self) -> async_channel::Receiver<Batch> {
        self.receiver.clone()
    }

    /// Close the channel so consumers drain and exit.
    pub fn close_channel(&self) {
        self.sender.close();
    }

    /// Record rows committed by a writer.
    pub fn add_rows(&self, n: u64) {
        self.total_rows.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStream")
            .field("columns", &self.columns.len())
            .field("batch_size", &self.batch_size)
            .field("total_rows", &self.total_rows())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CanonicalType;
    use crate::core::value::Value;

    fn make_stream() -> DataStream {
        let cols = vec![Column::new("id", CanonicalType::Integer, 0)];
        DataStream::new(cols.clone(), cols, 2, 4)
    }

    #[test]
    fn test_channel_close_unblocks_consumers() {
        let ds = make_stream();
        let rx = ds.receiver();
        ds.close_channel();
        assert!(rx.recv_blocking().is_err());
    }

    #[test]
    fn test_row_counter() {
        let ds = make_stream();
        ds.add_rows(3);
        ds.add_rows(2);
        assert_eq!(ds.total_rows(), 5);
    }

    #[test]
    fn test_batch_handoff() {
        let ds = make_stream();
        let tx = ds.sender();
        let rx = ds.receiver();
        let mut batch = Batch::with_capacity(1);
        batch.rows.push(vec![Value::I32(1)]);
        tx.send_blocking(batch).unwrap();
        drop(tx);
        ds.close_channel();
        let got = rx.recv_blocking().unwrap();
        assert_eq!(got.len(), 1);
        assert!(rx.recv_blocking().is_err());
    }

    #[test]
    #[should_panic(expected = "must align")]
    fn test_misaligned_columns_panic() {
        let cols = vec![Column::new("id", CanonicalType::Integer, 0)];
        DataStream::new(cols, vec![], 1, 1);
    }
}
