//! Link Driver
//!
//! Owns the physical radio link: scan, connect, MTU negotiation,
//! notification enablement and chunked writes. The platform radio stack is
//! injected through the [`RadioLink`] trait; this layer adds bounded retry
//! with exponential backoff and the inter-chunk pacing delay.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use super::packet::{self, PacketError};

/// Fallback ATT MTU before negotiation completes.
pub const DEFAULT_MTU: usize = 23;

/// A peer seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Errors from the radio link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("not connected")]
    NotConnected,
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("MTU negotiation failed: {0}")]
    Mtu(String),
    #[error("notification enable failed: {0}")]
    NotifyEnable(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("{op} failed after {attempts} attempts")]
    RetriesExhausted { op: &'static str, attempts: u32 },
    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Platform radio primitives. Exactly one implementation owns the physical
/// adapter; everything above it goes through the driver.
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Start scanning; discovered peers flow into `found` until
    /// [`RadioLink::stop_scan`] or the sender is dropped.
    async fn start_scan(&self, found: mpsc::Sender<DiscoveredPeer>) -> Result<(), LinkError>;

    async fn stop_scan(&self);

    async fn connect(&self, address: &str) -> Result<(), LinkError>;

    async fn disconnect(&self);

    /// Negotiate the ATT MTU for the established connection.
    async fn negotiate_mtu(&self) -> Result<usize, LinkError>;

    /// Enable notifications on the host's TX characteristic.
    async fn enable_notifications(&self) -> Result<(), LinkError>;

    /// Write one packet to the host's RX characteristic.
    async fn write_chunk(&self, data: &[u8]) -> Result<(), LinkError>;

    /// Subscribe to inbound notification packets.
    async fn subscribe(&self) -> mpsc::Receiver<Vec<u8>>;
}

/// Retry policy for chunk writes and descriptor writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `n` (0-based): base, 2x base, 4x base, ...
    fn delay(&self, n: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(n)
    }
}

/// Reliable chunked writer over a [`RadioLink`].
pub struct LinkDriver {
    radio: Arc<dyn RadioLink>,
    mtu: AtomicUsize,
    retry: RetryPolicy,
    inter_chunk_delay: Duration,
}

impl LinkDriver {
    pub fn new(radio: Arc<dyn RadioLink>, retry: RetryPolicy, inter_chunk_delay: Duration) -> Self {
        Self {
            radio,
            mtu: AtomicUsize::new(DEFAULT_MTU),
            retry,
            inter_chunk_delay,
        }
    }

    pub fn radio(&self) -> &Arc<dyn RadioLink> {
        &self.radio
    }

    pub fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Relaxed)
    }

    /// Establish the link: connect, negotiate MTU, enable notifications
    /// (descriptor write retried like any other write).
    pub async fn establish(&self, address: &str) -> Result<(), LinkError> {
        self.radio.connect(address).await?;

        let mtu = self.radio.negotiate_mtu().await?;
        if mtu <= packet::HEADER_LEN {
            return Err(LinkError::Mtu(format!("negotiated MTU {mtu} unusable")));
        }
        self.mtu.store(mtu, Ordering::Relaxed);
        tracing::info!("link established, MTU {}", mtu);

        self.with_retry("notification enable", || self.radio.enable_notifications())
            .await
    }

    pub async fn teardown(&self) {
        self.radio.disconnect().await;
        self.mtu.store(DEFAULT_MTU, Ordering::Relaxed);
    }

    pub async fn subscribe(&self) -> mpsc::Receiver<Vec<u8>> {
        self.radio.subscribe().await
    }

    /// Chunk `payload` to the negotiated MTU and write the packets strictly
    /// in order. A failed packet fails the whole message after retries.
    pub async fn send_message(&self, payload: &[u8], encrypted: bool) -> Result<(), LinkError> {
        let packets = packet::chunk_message(payload, self.mtu(), encrypted)?;
        let count = packets.len();
        for (i, chunk) in packets.iter().enumerate() {
            tracing::trace!("chunk {}/{}: {}", i + 1, count, hex::encode(chunk));
            self.with_retry("chunk write", || self.radio.write_chunk(chunk))
                .await?;
            if self.inter_chunk_delay > Duration::ZERO && i + 1 < count {
                tokio::time::sleep(self.inter_chunk_delay).await;
            }
        }
        Ok(())
    }

    async fn with_retry<F, Fut>(&self, op: &'static str, mut call: F) -> Result<(), LinkError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), LinkError>>,
    {
        let mut last_err = None;
        for attempt in 0..self.retry.attempts {
            match call().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!("{} attempt {} failed: {}", op, attempt + 1, e);
                    last_err = Some(e);
                    if attempt + 1 < self.retry.attempts {
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
            }
        }
        match last_err {
            Some(LinkError::NotConnected) => Err(LinkError::NotConnected),
            _ => Err(LinkError::RetriesExhausted {
                op,
                attempts: self.retry.attempts,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Radio that fails the first `fail_first` writes, then succeeds,
    /// recording every delivered chunk.
    struct FlakyRadio {
        fail_first: Mutex<u32>,
        written: Mutex<Vec<Vec<u8>>>,
        mtu: usize,
    }

    impl FlakyRadio {
        fn new(fail_first: u32, mtu: usize) -> Self {
            Self {
                fail_first: Mutex::new(fail_first),
                written: Mutex::new(Vec::new()),
                mtu,
            }
        }
    }

    #[async_trait]
    impl RadioLink for FlakyRadio {
        async fn start_scan(&self, _found: mpsc::Sender<DiscoveredPeer>) -> Result<(), LinkError> {
            Ok(())
        }
        async fn stop_scan(&self) {}
        async fn connect(&self, _address: &str) -> Result<(), LinkError> {
            Ok(())
        }
        async fn disconnect(&self) {}
        async fn negotiate_mtu(&self) -> Result<usize, LinkError> {
            Ok(self.mtu)
        }
        async fn enable_notifications(&self) -> Result<(), LinkError> {
            Ok(())
        }
        async fn write_chunk(&self, data: &[u8]) -> Result<(), LinkError> {
            let mut remaining = self.fail_first.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LinkError::Write("simulated".into()));
            }
            self.written.lock().unwrap().push(data.to_vec());
            Ok(())
        }
        async fn subscribe(&self) -> mpsc::Receiver<Vec<u8>> {
            mpsc::channel(1).1
        }
    }

    fn driver(radio: Arc<FlakyRadio>) -> LinkDriver {
        let retry = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        LinkDriver::new(radio, retry, Duration::ZERO)
    }

    #[tokio::test]
    async fn send_retries_transient_write_failures() {
        let radio = Arc::new(FlakyRadio::new(2, 64));
        let driver = driver(radio.clone());
        driver.establish("aa:bb").await.unwrap();

        driver.send_message(b"hello", false).await.unwrap();
        assert_eq!(radio.written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_fails_after_exhausting_retries() {
        let radio = Arc::new(FlakyRadio::new(10, 64));
        let driver = driver(radio.clone());
        driver.establish("aa:bb").await.unwrap();

        let err = driver.send_message(b"hello", false).await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::RetriesExhausted { op: "chunk write", attempts: 3 }
        ));
    }

    #[tokio::test]
    async fn chunks_written_in_order() {
        let radio = Arc::new(FlakyRadio::new(0, 23));
        let driver = driver(radio.clone());
        driver.establish("aa:bb").await.unwrap();

        let payload: Vec<u8> = (0..100u8).collect();
        driver.send_message(&payload, false).await.unwrap();

        let written = radio.written.lock().unwrap();
        assert!(written.len() > 1);
        let mut reassembler = packet::Reassembler::new();
        let mut complete = None;
        for chunk in written.iter() {
            if let Some(msg) = reassembler.push(chunk).unwrap() {
                complete = Some(msg);
            }
        }
        assert_eq!(complete.unwrap().data, payload);
    }

    #[tokio::test]
    async fn unusable_mtu_rejected() {
        struct TinyMtu;
        #[async_trait]
        impl RadioLink for TinyMtu {
            async fn start_scan(&self, _f: mpsc::Sender<DiscoveredPeer>) -> Result<(), LinkError> {
                Ok(())
            }
            async fn stop_scan(&self) {}
            async fn connect(&self, _a: &str) -> Result<(), LinkError> {
                Ok(())
            }
            async fn disconnect(&self) {}
            async fn negotiate_mtu(&self) -> Result<usize, LinkError> {
                Ok(4)
            }
            async fn enable_notifications(&self) -> Result<(), LinkError> {
                Ok(())
            }
            async fn write_chunk(&self, _d: &[u8]) -> Result<(), LinkError> {
                Ok(())
            }
            async fn subscribe(&self) -> mpsc::Receiver<Vec<u8>> {
                mpsc::channel(1).1
            }
        }

        let driver = LinkDriver::new(Arc::new(TinyMtu), RetryPolicy::default(), Duration::ZERO);
        assert!(matches!(
            driver.establish("aa:bb").await,
            Err(LinkError::Mtu(_))
        ));
    }
}
