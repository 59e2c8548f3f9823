use super::*;
use std::path::Path;

use crate::audio::codec::{PcmFormat, RawPcmCodec};
use crate::config::TranscoderConfig;
use crate::inference::InferenceReply;
use crate::testing::{
    eventually, init_logging, FakeConnection, FakeConnector, FakeInference, FakeSynthesizer, FakeTransport,
};
use crate::transcription::LinkEvent;
use crate::transport::{SpeakerId, TransportEvent};

/// One 20 ms frame of transport PCM.
const FRAME: usize = 3_840;

struct Harness {
    transport: Arc<FakeTransport>,
    connector: Arc<FakeConnector>,
    inference: Arc<FakeInference>,
    synthesizer: Arc<FakeSynthesizer>,
    handle: SessionHandle,
}

impl Harness {
    fn connection(&self) -> &FakeConnection {
        &self.transport.connection
    }

    async fn say(&self, item: &str, text: &str) {
        self.connector
            .emit(LinkEvent::TranscriptComplete {
                item_id: item.into(),
                transcript: Some(text.into()),
            })
            .await;
    }
}

fn config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.synthesis.transcoder = TranscoderConfig {
        program: "cat".into(),
        args: Vec::new(),
    };
    config
}

fn deps(
    transport: &Arc<FakeTransport>,
    connector: &Arc<FakeConnector>,
    inference: &Arc<FakeInference>,
    synthesizer: &Arc<FakeSynthesizer>,
) -> SessionDeps {
    SessionDeps {
        transport: Arc::clone(transport) as Arc<dyn VoiceTransport>,
        transcription: Arc::clone(connector) as Arc<dyn TranscriptionConnector>,
        inference: Arc::clone(inference) as Arc<dyn InferenceClient>,
        synthesizer: Arc::clone(synthesizer) as Arc<dyn SpeechSynthesizer>,
        codec: Arc::new(RawPcmCodec::new(PcmFormat::TRANSPORT)),
    }
}

async fn start(inference: FakeInference, synthesizer: FakeSynthesizer, config: BridgeConfig) -> Harness {
    init_logging();
    let transport = Arc::new(FakeTransport::new());
    let connector = Arc::new(FakeConnector::new());
    let inference = Arc::new(inference);
    let synthesizer = Arc::new(synthesizer);

    let handle = start_session(
        deps(&transport, &connector, &inference, &synthesizer),
        &TransportTarget::new("guild", "lounge"),
        SessionOptions::from_config(&config),
        &config,
    )
    .await
    .expect("session starts");

    Harness {
        transport,
        connector,
        inference,
        synthesizer,
        handle,
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transcript_is_answered_with_one_reply() {
    let h = start(
        FakeInference::replying(InferenceReply::speak("it is sunny")),
        FakeSynthesizer::new(5, FRAME),
        config(),
    )
    .await;
    let alice = SpeakerId::from("alice");

    h.transport.emit(TransportEvent::Ready).await;
    h.transport.emit(TransportEvent::SpeakingStart(alice.clone())).await;
    eventually("subscription", || h.connection().subscribes() == 1).await;
    for _ in 0..5 {
        assert!(h.connection().send_packet(&alice, vec![0x11; FRAME]).await);
    }
    eventually("mixed audio at the link", || h.connector.link.frames_sent() > 0).await;

    h.say("item-1", "what's the weather like").await;
    eventually("reply played", || h.connection().players_finished() == 1).await;
    eventually("idle again", || h.handle.phase() == TurnPhase::Idle).await;

    assert_eq!(h.inference.calls(), 1);
    assert_eq!(h.inference.recorded(), vec!["what's the weather like".to_string()]);
    assert_eq!(h.synthesizer.calls(), 1);
    assert_eq!(h.connection().players_attached(), 1);
    assert_eq!(h.connection().frames_received(), 5);

    assert_eq!(h.handle.cleanup("test over").await, "test over");
    assert_eq!(h.connection().destroyed(), 1);
    assert_eq!(h.connector.link.closes(), 1);
}

#[tokio::test]
async fn speech_inside_the_window_does_not_interrupt() {
    let h = start(
        FakeInference::replying(InferenceReply::speak("a long answer")),
        FakeSynthesizer::new(50, FRAME),
        config(),
    )
    .await;

    h.say("item-1", "tell me a story").await;
    eventually("playback started", || h.connection().frames_received() > 0).await;
    h.say("item-2", "actually never mind").await;

    eventually("reply played", || h.connection().players_finished() == 1).await;
    assert_eq!(h.connection().frames_received(), 50);
    assert_eq!(h.connection().players_attached(), 1);
    assert_eq!(h.inference.calls(), 1);
    assert_eq!(h.inference.recorded().len(), 2);

    h.handle.cleanup("test over").await;
}

#[tokio::test]
async fn transcripts_while_thinking_share_one_inference() {
    let inference =
        FakeInference::replying(InferenceReply::speak("ok")).with_delay(Duration::from_millis(300));
    let h = start(inference, FakeSynthesizer::new(2, FRAME), config()).await;

    h.say("item-1", "first").await;
    eventually("thinking", || h.handle.phase() == TurnPhase::Thinking).await;
    h.say("item-2", "second").await;
    h.say("item-3", "third").await;

    eventually("reply played", || h.connection().players_finished() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.inference.calls(), 1);
    assert_eq!(h.inference.recorded().len(), 3);

    h.handle.cleanup("test over").await;
}

#[tokio::test]
async fn detected_speech_cuts_the_reply() {
    let synthesizer = FakeSynthesizer::new(1_000, FRAME).with_chunk_delay(Duration::from_millis(10));
    let h = start(FakeInference::replying(InferenceReply::speak("on and on")), synthesizer, config()).await;

    h.say("item-1", "keep talking").await;
    eventually("playback started", || h.connection().frames_received() >= 3).await;
    h.connector.emit(LinkEvent::SpeechStarted).await;

    eventually("player released", || h.connection().players_finished() == 1).await;
    eventually("idle again", || h.handle.phase() == TurnPhase::Idle).await;
    assert!(h.connection().frames_received() < 1_000);
    assert!(!h.handle.is_shutting_down());

    h.handle.cleanup("test over").await;
}

#[tokio::test]
async fn announcement_is_spoken_on_ready() {
    let mut config = config();
    config.session.announcement = Some("  hello everyone ".into());
    let h = start(FakeInference::replying(InferenceReply::default()), FakeSynthesizer::new(3, FRAME), config).await;

    h.transport.emit(TransportEvent::Ready).await;
    eventually("announcement played", || h.connection().players_finished() == 1).await;
    assert_eq!(h.connection().frames_received(), 3);
    assert_eq!(h.inference.calls(), 0);

    h.handle.cleanup("test over").await;
}

#[tokio::test]
async fn failed_inference_apologizes_then_leaves() {
    let h = start(FakeInference::failing(), FakeSynthesizer::new(3, FRAME), config()).await;

    h.say("item-1", "hello?").await;

    assert_eq!(h.handle.closed().await, "inference failed");
    assert_eq!(h.connection().players_attached(), 1);
    assert_eq!(h.connection().frames_received(), 3);
    assert_eq!(h.connection().destroyed(), 1);
}

// ---------------------------------------------------------------------------
// Speaking lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn quick_restart_keeps_one_subscription() {
    let h = start(FakeInference::replying(InferenceReply::default()), FakeSynthesizer::new(1, FRAME), config()).await;
    let alice = SpeakerId::from("alice");

    h.transport.emit(TransportEvent::SpeakingStart(alice.clone())).await;
    h.transport.emit(TransportEvent::SpeakingEnd(alice.clone())).await;
    h.transport.emit(TransportEvent::SpeakingStart(alice.clone())).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.connection().subscribes(), 1);

    h.transport.emit(TransportEvent::SpeakingEnd(alice.clone())).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    h.transport.emit(TransportEvent::SpeakingStart(alice.clone())).await;
    eventually("fresh subscription", || h.connection().subscribes() == 2).await;

    h.handle.cleanup("test over").await;
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn destroyed_connection_kills_the_pipeline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pid_file = dir.path().join("transcoder.pid");
    let mut config = config();
    config.synthesis.transcoder = TranscoderConfig {
        program: "sh".into(),
        args: vec![
            "-c".into(),
            format!("echo $$ > {}; exec cat", pid_file.display()),
        ],
    };
    let synthesizer = FakeSynthesizer::new(1_000, FRAME).with_chunk_delay(Duration::from_millis(10));
    let h = start(FakeInference::replying(InferenceReply::speak("endless")), synthesizer, config).await;

    h.say("item-1", "go on").await;
    eventually("playback started", || h.connection().frames_received() >= 3).await;
    let pid = std::fs::read_to_string(&pid_file).expect("pid written");
    let pid = pid.trim();
    assert!(Path::new(&format!("/proc/{pid}")).exists());

    h.transport.emit(TransportEvent::Destroyed).await;
    assert_eq!(h.handle.closed().await, "voice connection destroyed");

    assert!(!Path::new(&format!("/proc/{pid}")).exists());
    let played = h.connection().frames_received();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.connection().frames_received(), played);
    assert_eq!(h.connection().destroyed(), 1);
    assert_eq!(h.connector.link.closes(), 1);
}

#[tokio::test]
async fn concurrent_cleanup_runs_once() {
    let h = start(FakeInference::replying(InferenceReply::default()), FakeSynthesizer::new(1, FRAME), config()).await;
    let other = h.handle.clone();

    let (a, b, c) = tokio::join!(
        h.handle.cleanup("first"),
        other.cleanup("second"),
        h.handle.cleanup("third"),
    );

    assert_eq!(a, b);
    assert_eq!(b, c);
    assert!(h.handle.is_closed());
    assert_eq!(h.connection().destroyed(), 1);
    assert_eq!(h.connector.link.closes(), 1);
    assert_eq!(h.handle.cleanup("again").await, a);
}

#[tokio::test]
async fn concurrent_cleanup_mid_reply_releases_everything_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pid_file = dir.path().join("transcoder.pid");
    let mut config = config();
    config.synthesis.transcoder = TranscoderConfig {
        program: "sh".into(),
        args: vec![
            "-c".into(),
            format!("echo $$ > {}; exec cat", pid_file.display()),
        ],
    };
    let synthesizer = FakeSynthesizer::new(1_000, FRAME).with_chunk_delay(Duration::from_millis(10));
    let h = start(FakeInference::replying(InferenceReply::speak("endless")), synthesizer, config).await;

    h.say("item-1", "go on").await;
    eventually("playback started", || h.connection().frames_received() >= 3).await;
    let pid = std::fs::read_to_string(&pid_file).expect("pid written");
    let proc_dir = format!("/proc/{}", pid.trim());
    assert!(Path::new(&proc_dir).exists());

    let (first, second) = (h.handle.clone(), h.handle.clone());
    let (a, b, c) = tokio::join!(first.cleanup("a"), second.cleanup("b"), h.handle.cleanup("c"));

    assert_eq!(a, b);
    assert_eq!(b, c);
    assert!(!Path::new(&proc_dir).exists());
    assert_eq!(h.connection().destroyed(), 1);
    assert_eq!(h.connector.link.closes(), 1);
    eventually("player released", || h.connection().players_finished() == 1).await;
}

#[tokio::test]
async fn zero_frame_ms_still_starts() {
    let mut config = config();
    config.audio.frame_ms = 0;
    let h = start(FakeInference::replying(InferenceReply::default()), FakeSynthesizer::new(1, FRAME), config).await;

    assert!(!h.handle.is_shutting_down());
    h.handle.cleanup("test over").await;
}

#[tokio::test]
async fn closed_link_ends_the_session() {
    let h = start(FakeInference::replying(InferenceReply::default()), FakeSynthesizer::new(1, FRAME), config()).await;

    h.connector.emit(LinkEvent::Closed).await;

    assert_eq!(h.handle.closed().await, "transcription link closed");
    assert!(h.handle.is_shutting_down());
    assert_eq!(h.connection().destroyed(), 1);
}

#[tokio::test]
async fn idle_session_leaves_at_the_time_limit() {
    let mut config = config();
    config.session.time_limit_secs = Some(1);
    let h = start(FakeInference::replying(InferenceReply::default()), FakeSynthesizer::new(1, FRAME), config).await;

    let reason = tokio::time::timeout(Duration::from_secs(5), h.handle.closed())
        .await
        .expect("closed before timeout");
    assert_eq!(reason, "time limit reached");
}

#[tokio::test]
async fn failed_link_leaves_the_channel() {
    init_logging();
    let transport = Arc::new(FakeTransport::new());
    let connector = Arc::new(FakeConnector::failing());
    let inference = Arc::new(FakeInference::replying(InferenceReply::default()));
    let synthesizer = Arc::new(FakeSynthesizer::new(1, FRAME));
    let config = config();

    let result = start_session(
        deps(&transport, &connector, &inference, &synthesizer),
        &TransportTarget::new("guild", "lounge"),
        SessionOptions::from_config(&config),
        &config,
    )
    .await;

    assert!(matches!(result, Err(SessionError::Link(_))));
    assert_eq!(transport.connection.destroyed(), 1);
}
