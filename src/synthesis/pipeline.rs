//! One utterance's audio path from synthesized bytes to the output player.
//!
//! An [`AudioPipeline`] is created on the first synthesized byte.  It owns
//! the transcoder process, the task feeding it, the task pumping its PCM
//! into encoded frames, and the player attachment.  [`AudioPipeline::teardown`]
//! releases all of them in one step; dropping an unfinished pipeline aborts
//! the tasks and the transcoder dies with its handle.

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::audio::codec::{pcm_bytes_to_samples, FrameChunker, FrameEncoder};
use crate::config::{BridgeConfig, TranscoderConfig};
use crate::synthesis::transcoder::Transcoder;
use crate::synthesis::{AudioByteStream, SynthesisError};
use crate::transport::{PlayerSource, VoiceConnection};

const READ_CHUNK: usize = 8 * 1024;

/// Everything a pipeline needs besides the audio itself.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub transcoder: TranscoderConfig,
    /// Bytes of transport PCM per outbound frame.
    pub frame_bytes: usize,
    /// Encoded frames queued ahead of the player.
    pub buffer_frames: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            transcoder: config.synthesis.transcoder.clone(),
            frame_bytes: config
                .audio
                .transport_format
                .bytes_per_frame(config.audio.cadence_ms())
                .max(2),
            buffer_frames: config.audio.player_buffer_frames.max(1),
        }
    }
}

type TaskSlot = Option<JoinHandle<Result<(), SynthesisError>>>;

pub struct AudioPipeline {
    transcoder: Transcoder,
    feeder: TaskSlot,
    pump: TaskSlot,
    finished: Option<oneshot::Receiver<()>>,
    stop: watch::Sender<bool>,
    torn_down: bool,
}

impl AudioPipeline {
    /// Spawn the transcoder, start feeding it `first` followed by `rest`, and
    /// attach the encoded output to the connection's player.
    pub fn start(
        first: Bytes,
        rest: AudioByteStream,
        connection: &dyn VoiceConnection,
        encoder: Box<dyn FrameEncoder>,
        settings: &PipelineSettings,
    ) -> Result<Self, SynthesisError> {
        let mut transcoder = Transcoder::spawn(&settings.transcoder)?;
        let stdin = transcoder.take_stdin()?;
        let stdout = transcoder.take_stdout()?;

        let (frames_tx, frames_rx) = mpsc::channel(settings.buffer_frames.max(1));
        let (stop, stop_rx) = watch::channel(false);

        let finished = connection
            .attach_output_player(PlayerSource::new(frames_rx, stop_rx))
            .map_err(|e| SynthesisError::Player(e.to_string()))?;

        let feeder = tokio::spawn(feed(first, rest, stdin));
        let pump = tokio::spawn(pump(stdout, encoder, frames_tx, settings.frame_bytes));

        Ok(Self {
            transcoder,
            feeder: Some(feeder),
            pump: Some(pump),
            finished: Some(finished),
            stop,
            torn_down: false,
        })
    }

    /// Transcoder process id while it is running.
    pub fn transcoder_id(&self) -> Option<u32> {
        self.transcoder.id()
    }

    /// Run until every frame has been handed to the player and the player
    /// reports idle.
    ///
    /// Cancel-safe: dropping the future leaves the pipeline ready for
    /// [`teardown`](Self::teardown).
    pub async fn play(&mut self) -> Result<(), SynthesisError> {
        let (feeder, pump) = (&mut self.feeder, &mut self.pump);
        tokio::try_join!(join_task(feeder), join_task(pump))?;

        if let Some(finished) = self.finished.as_mut() {
            if finished.await.is_err() {
                log::debug!("synthesis: player dropped its completion signal");
            }
            self.finished = None;
        }
        Ok(())
    }

    /// Stop the player, abort both tasks (dropping the upstream byte stream)
    /// and kill the transcoder.  Later calls do nothing.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.stop.send_replace(true);
        for task in [self.feeder.take(), self.pump.take()].into_iter().flatten() {
            task.abort();
        }
        self.finished = None;
        self.transcoder.shutdown().await;
        log::debug!("synthesis: pipeline torn down");
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        for task in [self.feeder.take(), self.pump.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

async fn join_task(slot: &mut TaskSlot) -> Result<(), SynthesisError> {
    let Some(handle) = slot.as_mut() else {
        return Ok(());
    };
    let result = handle.await;
    *slot = None;
    match result {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => Err(SynthesisError::Stream("pipeline task cancelled".into())),
        Err(e) => Err(SynthesisError::Transcoder(format!("pipeline task panicked: {e}"))),
    }
}

/// Write the synthesized bytes into the transcoder, then close its stdin.
async fn feed(
    first: Bytes,
    mut rest: AudioByteStream,
    mut stdin: tokio::process::ChildStdin,
) -> Result<(), SynthesisError> {
    let write_err = |e: std::io::Error| SynthesisError::Transcoder(format!("stdin: {e}"));

    stdin.write_all(&first).await.map_err(write_err)?;
    while let Some(chunk) = rest.next().await {
        let chunk = chunk?;
        stdin.write_all(&chunk).await.map_err(write_err)?;
    }
    stdin.shutdown().await.map_err(write_err)?;
    Ok(())
}

/// Cut the transcoder's PCM into frames, encode them and queue them for the
/// player.  The zero-padded tail goes out last.
async fn pump(
    mut stdout: tokio::process::ChildStdout,
    mut encoder: Box<dyn FrameEncoder>,
    frames: mpsc::Sender<Vec<u8>>,
    frame_bytes: usize,
) -> Result<(), SynthesisError> {
    let mut chunker = FrameChunker::new(frame_bytes);
    let mut buf = vec![0_u8; READ_CHUNK];
    let mut sent = 0_usize;

    loop {
        let n = stdout
            .read(&mut buf)
            .await
            .map_err(|e| SynthesisError::Transcoder(format!("stdout: {e}")))?;
        if n == 0 {
            break;
        }
        for frame in chunker.push(&buf[..n]) {
            send_frame(&frame, encoder.as_mut(), &frames).await?;
            sent += 1;
        }
    }
    if let Some(tail) = chunker.finish() {
        send_frame(&tail, encoder.as_mut(), &frames).await?;
        sent += 1;
    }

    log::debug!("synthesis: {sent} frames queued for playback");
    Ok(())
}

async fn send_frame(
    frame: &[u8],
    encoder: &mut dyn FrameEncoder,
    frames: &mpsc::Sender<Vec<u8>>,
) -> Result<(), SynthesisError> {
    let packet = encoder.encode(&pcm_bytes_to_samples(frame)?)?;
    frames
        .send(packet)
        .await
        .map_err(|_| SynthesisError::Player("player stopped reading".into()))
}
