//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};

use crate::inference::{InferenceClient, InferenceContext, InferenceError, InferenceReply};
use crate::synthesis::{AudioByteStream, SpeechSynthesizer, SynthesisError, SynthesisOptions};
use crate::transcription::{LinkError, LinkEvent, LinkSession, TranscriptEntry, TranscriptionConnector, TranscriptionLink};
use crate::transport::{
    JoinedConnection, PacketStream, PlayerSource, SpeakerId, TransportError, TransportEvent, TransportTarget,
    VoiceConnection, VoiceTransport,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub(crate) fn byte_stream(chunks: Vec<Vec<u8>>) -> AudioByteStream {
    futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c)))).boxed()
}

// ---------------------------------------------------------------------------
// Transcription
// ---------------------------------------------------------------------------

pub(crate) struct FakeLink {
    connected: AtomicBool,
    frames: Mutex<Vec<Vec<u8>>>,
    commits: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeLink {
    pub(crate) fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            frames: Mutex::new(Vec::new()),
            commits: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn frames_sent(&self) -> usize {
        lock(&self.frames).len()
    }

    pub(crate) fn last_frame(&self) -> Option<Vec<u8>> {
        lock(&self.frames).last().cloned()
    }

    pub(crate) fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl TranscriptionLink for FakeLink {
    fn send_audio(&self, pcm: Vec<u8>) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        lock(&self.frames).push(pcm);
        Ok(())
    }

    fn commit(&self) -> Result<(), LinkError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.set_connected(false);
    }
}

/// Hands out one shared [`FakeLink`]; tests inject server events via
/// [`FakeConnector::emit`].
pub(crate) struct FakeConnector {
    pub(crate) link: Arc<FakeLink>,
    events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    fail: bool,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self {
            link: Arc::new(FakeLink::new()),
            events: Mutex::new(None),
            fail: false,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub(crate) async fn emit(&self, event: LinkEvent) {
        let sender = lock(&self.events).clone().expect("link connected");
        sender.send(event).await.expect("session listening");
    }
}

#[async_trait]
impl TranscriptionConnector for FakeConnector {
    async fn connect(&self) -> Result<LinkSession, LinkError> {
        if self.fail {
            return Err(LinkError::Connect("refused".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        *lock(&self.events) = Some(tx);
        Ok(LinkSession {
            link: Arc::clone(&self.link) as Arc<dyn TranscriptionLink>,
            events: rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Records what the session does to the voice connection.  The output
/// player consumes one frame per `frame_interval`.
pub(crate) struct FakeConnection {
    subscribes: AtomicUsize,
    speakers: Mutex<HashMap<SpeakerId, mpsc::Sender<Result<Vec<u8>, TransportError>>>>,
    players_attached: AtomicUsize,
    players_finished: Arc<AtomicUsize>,
    frames_received: Arc<AtomicUsize>,
    destroyed: AtomicUsize,
    frame_interval: Duration,
}

impl FakeConnection {
    pub(crate) fn new() -> Self {
        Self {
            subscribes: AtomicUsize::new(0),
            speakers: Mutex::new(HashMap::new()),
            players_attached: AtomicUsize::new(0),
            players_finished: Arc::new(AtomicUsize::new(0)),
            frames_received: Arc::new(AtomicUsize::new(0)),
            destroyed: AtomicUsize::new(0),
            frame_interval: Duration::from_millis(20),
        }
    }

    pub(crate) fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub(crate) fn players_attached(&self) -> usize {
        self.players_attached.load(Ordering::SeqCst)
    }

    pub(crate) fn players_finished(&self) -> usize {
        self.players_finished.load(Ordering::SeqCst)
    }

    pub(crate) fn frames_received(&self) -> usize {
        self.frames_received.load(Ordering::SeqCst)
    }

    pub(crate) fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Deliver one packet on the speaker's subscription.  `false` when the
    /// speaker has no open subscription.
    pub(crate) async fn send_packet(&self, speaker: &SpeakerId, packet: Vec<u8>) -> bool {
        self.deliver(speaker, Ok(packet)).await
    }

    pub(crate) async fn send_error(&self, speaker: &SpeakerId, error: TransportError) -> bool {
        self.deliver(speaker, Err(error)).await
    }

    /// Close the speaker's subscription.
    pub(crate) fn end_stream(&self, speaker: &SpeakerId) {
        lock(&self.speakers).remove(speaker);
    }

    async fn deliver(&self, speaker: &SpeakerId, packet: Result<Vec<u8>, TransportError>) -> bool {
        let sender = lock(&self.speakers).get(speaker).cloned();
        match sender {
            Some(sender) => sender.send(packet).await.is_ok(),
            None => false,
        }
    }
}

impl VoiceConnection for FakeConnection {
    fn subscribe_to_speaker(&self, speaker: &SpeakerId) -> Result<PacketStream, TransportError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        lock(&self.speakers).insert(speaker.clone(), tx);
        Ok(rx)
    }

    fn attach_output_player(&self, mut source: PlayerSource) -> Result<oneshot::Receiver<()>, TransportError> {
        self.players_attached.fetch_add(1, Ordering::SeqCst);
        let frames = Arc::clone(&self.frames_received);
        let finished = Arc::clone(&self.players_finished);
        let interval = self.frame_interval;
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            while source.next_frame().await.is_some() {
                frames.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(interval).await;
            }
            finished.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(());
        });
        Ok(done_rx)
    }

    fn display_name(&self, speaker: &SpeakerId) -> Option<String> {
        Some(format!("{speaker} (display)"))
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakeTransport {
    pub(crate) connection: Arc<FakeConnection>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self {
            connection: Arc::new(FakeConnection::new()),
            events: Mutex::new(None),
        }
    }

    pub(crate) async fn emit(&self, event: TransportEvent) {
        let sender = lock(&self.events).clone().expect("joined");
        sender.send(event).await.expect("session listening");
    }
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    async fn join(&self, _target: &TransportTarget) -> Result<JoinedConnection, TransportError> {
        let (tx, rx) = mpsc::channel(64);
        *lock(&self.events) = Some(tx);
        Ok(JoinedConnection {
            connection: Arc::clone(&self.connection) as Arc<dyn VoiceConnection>,
            events: rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

pub(crate) struct FakeInference {
    reply: Option<InferenceReply>,
    delay: Duration,
    calls: AtomicUsize,
    recorded: Mutex<Vec<TranscriptEntry>>,
}

impl FakeInference {
    pub(crate) fn replying(reply: InferenceReply) -> Self {
        Self {
            reply: Some(reply),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            recorded: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            reply: None,
            ..Self::replying(InferenceReply::default())
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn recorded(&self) -> Vec<String> {
        lock(&self.recorded).iter().map(|e| e.text.clone()).collect()
    }
}

#[async_trait]
impl InferenceClient for FakeInference {
    fn record_transcript(&self, entry: &TranscriptEntry) {
        lock(&self.recorded).push(entry.clone());
    }

    async fn run_inference(&self, _context: InferenceContext) -> Result<InferenceReply, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.reply
            .clone()
            .ok_or_else(|| InferenceError::Request("model unavailable".into()))
    }
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// Streams `chunks` chunks of `chunk_size` non-zero bytes.
pub(crate) struct FakeSynthesizer {
    chunks: usize,
    chunk_size: usize,
    chunk_delay: Duration,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeSynthesizer {
    pub(crate) fn new(chunks: usize, chunk_size: usize) -> Self {
        Self {
            chunks,
            chunk_size,
            chunk_delay: Duration::ZERO,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0, 0)
        }
    }

    pub(crate) fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn synthesize(&self, _text: &str, _options: &SynthesisOptions) -> Result<AudioByteStream, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SynthesisError::Request("provider rejected the request".into()));
        }
        let (chunks, size, delay) = (self.chunks, self.chunk_size, self.chunk_delay);
        Ok(futures::stream::unfold(0, move |sent| async move {
            if sent == chunks {
                return None;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Some((Ok(Bytes::from(vec![0x11_u8; size])), sent + 1))
        })
        .boxed())
    }
}
