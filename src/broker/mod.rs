pub mod server;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by broker reads.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The reader fell behind and its offset has been overwritten.
    #[error("requested data has been overwritten")]
    Overwritten,
    /// The writer closed with a terminal error.
    #[error("stream source failed: {0}")]
    Source(String),
    /// The read was cancelled.
    #[error("read cancelled")]
    Cancelled,
}

/**
    A fixed-capacity circular byte buffer with one writer and multiple
    concurrent readers. Data is addressed by a monotonically increasing byte
    offset; once the buffer wraps, the oldest data is silently overwritten
    and readers still pointing at it get [`BrokerError::Overwritten`].

    Writes never block and never fail. Reads block until data past the
    requested offset exists, the writer closes, or the caller cancels.
*/
pub struct RingBroker {
    /// Monotonic total bytes written. Published after the copy completes;
    /// readers load it before touching the buffer.
    write_pos: AtomicU64,
    done: AtomicBool,
    buf: RwLock<Vec<u8>>,
    capacity: u64,
    /// Terminal error, set at most once before `done`.
    err: Mutex<Option<String>>,
    /// Readers subscribe, re-check state, then wait for a change. A fresh
    /// subscription marks the current version seen, so a wake that lands
    /// between the re-check and the wait is never lost.
    wake: watch::Sender<()>,
}

impl RingBroker {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "broker capacity must be non-zero");
        let (wake, _) = watch::channel(());
        Self {
            write_pos: AtomicU64::new(0),
            done: AtomicBool::new(false),
            buf: RwLock::new(vec![0u8; capacity]),
            capacity: capacity as u64,
            err: Mutex::new(None),
            wake,
        }
    }

    /// Total bytes written so far.
    pub fn total_written(&self) -> u64 {
        self.write_pos.load(Ordering::Acquire)
    }

    /// The lowest byte offset still readable.
    pub fn oldest_offset(&self) -> u64 {
        self.total_written().saturating_sub(self.capacity)
    }

    /**
        Append `data`, overwriting the oldest bytes on wrap. The write offset
        is published only after the whole copy, then all waiting readers are
        woken.
    */
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        // A chunk larger than the buffer reduces to its tail: everything
        // before it would be overwritten within this same call.
        let (skipped, chunk) = if data.len() as u64 > self.capacity {
            let cut = data.len() - self.capacity as usize;
            (cut as u64, &data[cut..])
        } else {
            (0, data)
        };

        {
            let mut buf = self.buf.write().expect("broker buffer lock poisoned");
            let mut pos = self.write_pos.load(Ordering::Relaxed) + skipped;
            let mut rest = chunk;
            while !rest.is_empty() {
                let start = (pos % self.capacity) as usize;
                let n = rest.len().min(buf.len() - start);
                buf[start..start + n].copy_from_slice(&rest[..n]);
                pos += n as u64;
                rest = &rest[n..];
            }
            self.write_pos.store(pos, Ordering::Release);
        }

        self.wake.send_replace(());
    }

    /**
        Mark end-of-stream. Readers that have consumed all available data get
        EOF (a zero-length read), or the terminal error when one is given.
    */
    pub fn close(&self, terminal_err: Option<String>) {
        if let Some(message) = terminal_err {
            let mut err = self.err.lock().expect("broker error lock poisoned");
            err.get_or_insert(message);
        }
        self.done.store(true, Ordering::Release);
        self.wake.send_replace(());
    }

    fn terminal_error(&self) -> Option<BrokerError> {
        self.err
            .lock()
            .expect("broker error lock poisoned")
            .as_ref()
            .map(|m| BrokerError::Source(m.clone()))
    }

    /**
        Copy bytes starting at the monotonic `offset` into `buf`, blocking
        until data is available past the offset, the writer closes, or
        `cancel` fires. `Ok(0)` means end-of-stream.
    */
    pub async fn read_at(
        &self,
        cancel: &CancellationToken,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, BrokerError> {
        loop {
            let wp = self.total_written();
            if offset < wp.saturating_sub(self.capacity) {
                return Err(BrokerError::Overwritten);
            }
            if wp > offset {
                return self.copy_from(buf, offset);
            }
            if self.done.load(Ordering::Acquire) {
                return match self.terminal_error() {
                    Some(err) => Err(err),
                    None => Ok(0),
                };
            }

            let mut rx = self.wake.subscribe();

            // Re-check after subscribing, before sleeping: a write or close
            // that landed in between bumped the watch version, so the wait
            // below would return immediately anyway.
            if self.total_written() > offset || self.done.load(Ordering::Acquire) {
                continue;
            }

            tokio::select! {
                _ = rx.changed() => {}
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            }
        }
    }

    /// Copy under the read lock, re-validating the offset against overwrites.
    fn copy_from(&self, buf: &mut [u8], offset: u64) -> Result<usize, BrokerError> {
        let ring = self.buf.read().expect("broker buffer lock poisoned");

        let wp = self.total_written();
        if offset < wp.saturating_sub(self.capacity) {
            return Err(BrokerError::Overwritten);
        }

        let avail = (wp - offset).min(buf.len() as u64).min(self.capacity) as usize;
        let start = (offset % self.capacity) as usize;

        if start + avail <= ring.len() {
            buf[..avail].copy_from_slice(&ring[start..start + avail]);
        } else {
            let first = ring.len() - start;
            buf[..first].copy_from_slice(&ring[start..]);
            buf[first..avail].copy_from_slice(&ring[..avail - first]);
        }

        Ok(avail)
    }

    /**
        Block until at least `min_offset` total bytes have been written, the
        writer closes, or `cancel` fires.
    */
    pub async fn wait_for_data(
        &self,
        cancel: &CancellationToken,
        min_offset: u64,
    ) -> Result<(), BrokerError> {
        loop {
            if self.total_written() >= min_offset || self.done.load(Ordering::Acquire) {
                return Ok(());
            }

            let mut rx = self.wake.subscribe();

            if self.total_written() >= min_offset || self.done.load(Ordering::Acquire) {
                return Ok(());
            }

            tokio::select! {
                _ = rx.changed() => {}
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn read_returns_written_bytes() {
        let broker = RingBroker::new(16);
        broker.write(b"hello");

        let mut buf = [0u8; 16];
        let n = broker.read_at(&token(), &mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn read_is_contiguous_suffix_after_wrap() {
        let broker = RingBroker::new(8);
        broker.write(b"abcdefgh");
        broker.write(b"XY"); // overwrites "ab", oldest is now offset 2

        assert_eq!(broker.oldest_offset(), 2);

        let mut buf = [0u8; 8];
        let n = broker.read_at(&token(), &mut buf, 2).await.unwrap();
        assert_eq!(&buf[..n], b"cdefghXY");
    }

    #[tokio::test]
    async fn overwritten_offset_errors() {
        let broker = RingBroker::new(4);
        broker.write(b"abcd");
        broker.write(b"efgh");

        let mut buf = [0u8; 4];
        let err = broker.read_at(&token(), &mut buf, 0).await.unwrap_err();
        assert!(matches!(err, BrokerError::Overwritten));
    }

    #[tokio::test]
    async fn oversized_write_keeps_tail() {
        let broker = RingBroker::new(4);
        broker.write(b"0123456789");

        assert_eq!(broker.total_written(), 10);

        let mut buf = [0u8; 4];
        let n = broker
            .read_at(&token(), &mut buf, broker.oldest_offset())
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"6789");
    }

    #[tokio::test]
    async fn eof_after_close() {
        let broker = RingBroker::new(8);
        broker.write(b"end");
        broker.close(None);

        let mut buf = [0u8; 8];
        let n = broker.read_at(&token(), &mut buf, 3).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn terminal_error_reaches_reader() {
        let broker = RingBroker::new(8);
        broker.close(Some("encoder died".to_string()));

        let mut buf = [0u8; 8];
        let err = broker.read_at(&token(), &mut buf, 0).await.unwrap_err();
        assert!(matches!(err, BrokerError::Source(m) if m == "encoder died"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocked_reader_is_woken_by_write() {
        let broker = Arc::new(RingBroker::new(8));

        let reader = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                let n = broker.read_at(&token(), &mut buf, 0).await.unwrap();
                buf[..n].to_vec()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.write(b"late");

        let got = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader was never woken")
            .unwrap();
        assert_eq!(got, b"late");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_readers_all_wake() {
        let broker = Arc::new(RingBroker::new(64));

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    broker.read_at(&token(), &mut buf, 0).await.unwrap()
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.write(b"fanout");

        for reader in readers {
            let n = tokio::time::timeout(Duration::from_secs(2), reader)
                .await
                .expect("a reader missed the wake-up")
                .unwrap();
            assert_eq!(n, 6);
        }
    }

    #[tokio::test]
    async fn wait_for_data_observes_threshold() {
        let broker = Arc::new(RingBroker::new(16));

        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.wait_for_data(&token(), 6).await })
        };

        broker.write(b"123");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        broker.write(b"456");
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter never released")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_interrupts_read() {
        let broker = Arc::new(RingBroker::new(8));
        let cancel = token();

        let reader = {
            let broker = Arc::clone(&broker);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                broker.read_at(&cancel, &mut buf, 0).await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("cancelled read never returned")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BrokerError::Cancelled));
    }
}
