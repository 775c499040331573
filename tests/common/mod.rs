//! Shared fakes and helpers for integration tests
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::time::timeout;

use blescout::bluetooth::{RadioEvent, RadioSource, ScanSettings};
use blescout::error::{RadioError, StoreError};
use blescout::sighting::{RawEvent, RecordId, SessionId, Sighting};
use blescout::store::SightingSink;

mock! {
    pub Radio {}

    #[async_trait]
    impl RadioSource for Radio {
        async fn start_scan(&self, settings: &ScanSettings) -> Result<Receiver<RadioEvent>, RadioError>;
        async fn stop_scan(&self) -> Result<(), RadioError>;
    }
}

mock! {
    pub Sink {}

    #[async_trait]
    impl SightingSink for Sink {
        async fn append(&self, sighting: Sighting, session_id: SessionId) -> Result<RecordId, StoreError>;
    }
}

/// Radio whose events are pushed by the test
#[derive(Default)]
pub struct ChannelRadio {
    sender: Mutex<Option<Sender<RadioEvent>>>,
    stops: AtomicUsize,
}

impl ChannelRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn advertise(&self, address: &str, rssi: i16, name: Option<&str>) {
        self.emit(RadioEvent::Advertisement(RawEvent::new(
            address,
            rssi,
            name.map(str::to_string),
        )))
        .await;
    }

    pub async fn emit(&self, event: RadioEvent) {
        let sender = self.sender.lock().unwrap().clone();
        sender
            .expect("radio was not started")
            .send(event)
            .await
            .expect("event pump is gone");
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RadioSource for ChannelRadio {
    async fn start_scan(&self, settings: &ScanSettings) -> Result<Receiver<RadioEvent>, RadioError> {
        let (tx, rx) = channel(settings.event_buffer);
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        match self.sender.lock().unwrap().take() {
            Some(_) => Ok(()),
            None => Err(RadioError::NotScanning),
        }
    }
}

/// Radio whose first `start_scan` waits until the test opens the gate
pub struct GatedRadio {
    gate: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
    senders: Mutex<Vec<Sender<RadioEvent>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl GatedRadio {
    pub fn new() -> (Self, oneshot::Sender<()>) {
        let (open, gate) = oneshot::channel();
        let radio = Self {
            gate: tokio::sync::Mutex::new(Some(gate)),
            senders: Mutex::new(Vec::new()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        };
        (radio, open)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RadioSource for GatedRadio {
    async fn start_scan(&self, settings: &ScanSettings) -> Result<Receiver<RadioEvent>, RadioError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let (tx, rx) = channel(settings.event_buffer);
        self.senders.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink that takes its time, to observe aborted appends
pub struct SlowSink {
    pub delay: Duration,
    pub completed: AtomicUsize,
}

impl SlowSink {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            completed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SightingSink for SlowSink {
    async fn append(&self, _sighting: Sighting, _session_id: SessionId) -> Result<RecordId, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(RecordId::new())
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Run an async operation with a timeout
pub async fn with_timeout<T, F>(duration_secs: u64, future: F) -> Result<T, &'static str>
where
    F: Future<Output = T>,
{
    match timeout(Duration::from_secs(duration_secs), future).await {
        Ok(result) => Ok(result),
        Err(_) => Err("Operation timed out"),
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
