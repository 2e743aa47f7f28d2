//! # Streaming Session
//!
//! Manages the lifecycle of one bidirectional audio exchange with the live endpoint:
//! microphone windows go out as encoded frames, model audio comes back and is scheduled
//! for playback, and an interruption from the remote silences everything at once.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: nothing running yet
//! 2. **Connecting**: devices acquired, waiting for the remote to acknowledge the setup
//! 3. **Live**: frames flow both ways
//! 4. **Disconnected**: the remote closed the channel
//! 5. **Error**: the channel failed to open or faulted mid-session
//! 6. **Stopped**: stopped locally
//!
//! Every terminal state is left only through a fresh start, which rebuilds everything.
//!
//! ## Concurrency:
//! One task owns all session state (encoder, scheduler, channel, devices) and handles
//! its three event sources in a single `select!` loop, so no locks guard the cursor or
//! the active source set. The outside world only sees snapshots published on a
//! `watch` channel.

use crate::audio::capture::CaptureEncoder;
use crate::audio::playback::{PlaybackScheduler, SourceId};
use crate::config::{AppConfig, AudioConfig};
use crate::device::{AudioBackend, CaptureStream, PlaybackStream};
use crate::error::{AppError, AppResult};
use crate::live::channel::{LiveChannel, LiveConnector};
use crate::live::protocol::{ServerEvent, SessionSetup};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Current status of the streaming session.
///
/// ## Rust Concepts:
/// - **Copy enum**: cheap to pass around and compare, no heap data
/// - **serde rename**: serialized as `"connecting"`, `"live"`, ... for the control API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Live,
    Disconnected,
    Error,
    Stopped,
}

impl SessionStatus {
    /// Convert status to string for logs and API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Live => "live",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Error => "error",
            SessionStatus::Stopped => "stopped",
        }
    }

    /// Whether a session task may still be running in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Connecting | SessionStatus::Live)
    }
}

/// Traffic counters for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub decode_failures: u64,
    pub interruptions: u64,
    pub buffers_scheduled: u64,
    /// Buffers the speaker finished on its own
    pub buffers_played: u64,
}

/// What the control surface sees of the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: SessionStatus,
    /// Microphone level in `[0, volume_max]`
    pub volume: f32,
    pub stats: SessionStats,
    /// `kind: message` of the failure that ended the session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn idle() -> Self {
        Self {
            session_id: None,
            status: SessionStatus::Idle,
            volume: 0.0,
            stats: SessionStats::default(),
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

fn describe(err: &AppError) -> String {
    format!("{}: {}", err.kind(), err.message())
}

/// Devices acquired by `start` before the session task runs.
struct SessionDevices {
    capture: CaptureStream,
    playback: PlaybackStream,
}

fn open_devices(backend: &dyn AudioBackend, audio: &AudioConfig) -> AppResult<SessionDevices> {
    let capture = backend.open_capture(audio.capture_sample_rate, audio.capture_window)?;
    // If the speaker fails, dropping `capture` releases the microphone
    let playback = backend.open_playback(audio.playback_sample_rate)?;
    Ok(SessionDevices { capture, playback })
}

/// Why the live loop ended.
enum Outcome {
    Stopped,
    RemoteClosed,
    Fault(AppError),
}

/// The single owned state of a running session.
struct StreamingSession {
    session_id: String,
    encoder: CaptureEncoder,
    scheduler: PlaybackScheduler,
    capture: Option<CaptureStream>,
    ended: Option<mpsc::UnboundedReceiver<SourceId>>,
    stats: SessionStats,
    volume: f32,
    publisher: Arc<watch::Sender<SessionSnapshot>>,
}

impl StreamingSession {
    fn new(
        session_id: String,
        audio: &AudioConfig,
        devices: SessionDevices,
        publisher: Arc<watch::Sender<SessionSnapshot>>,
    ) -> Self {
        let SessionDevices { capture, playback } = devices;
        Self {
            session_id,
            encoder: CaptureEncoder::from_config(audio),
            scheduler: PlaybackScheduler::new(playback.device, audio.playback_sample_rate),
            capture: Some(capture),
            ended: Some(playback.ended),
            stats: SessionStats::default(),
            volume: 0.0,
            publisher,
        }
    }

    fn publish(&self, status: SessionStatus, last_error: Option<String>) {
        self.publisher.send_replace(SessionSnapshot {
            session_id: Some(self.session_id.clone()),
            status,
            volume: self.volume,
            stats: self.stats.clone(),
            last_error,
            updated_at: Utc::now(),
        });
    }

    /// Connect, stream until something ends the session, then release everything.
    async fn run(
        mut self,
        connector: Arc<dyn LiveConnector>,
        setup: SessionSetup,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let connected = tokio::select! {
            biased;
            _ = &mut stop_rx => None,
            result = connector.connect(&setup) => Some(result),
        };

        let mut channel = match connected {
            None => {
                info!(session_id = %self.session_id, "session stopped while connecting");
                self.teardown(None).await;
                self.publish(SessionStatus::Stopped, None);
                return;
            }
            Some(Err(err)) => {
                error!(session_id = %self.session_id, error = %err, "live channel failed to open");
                self.teardown(None).await;
                self.publish(SessionStatus::Error, Some(describe(&err)));
                return;
            }
            Some(Ok(channel)) => channel,
        };

        // Windows captured before the acknowledgement are not sent
        let mut discarded = 0usize;
        if let Some(capture) = self.capture.as_mut() {
            while capture.windows.try_recv().is_ok() {
                discarded += 1;
            }
        }

        info!(session_id = %self.session_id, discarded, state = "live", "session live");
        self.publish(SessionStatus::Live, None);

        let outcome = self.stream(channel.as_mut(), &mut stop_rx).await;
        self.teardown(Some(channel.as_mut())).await;

        match outcome {
            Outcome::Stopped => {
                info!(session_id = %self.session_id, state = "stopped", "session stopped");
                self.publish(SessionStatus::Stopped, None);
            }
            Outcome::RemoteClosed => {
                info!(session_id = %self.session_id, state = "disconnected", "remote closed the session");
                self.publish(SessionStatus::Disconnected, None);
            }
            Outcome::Fault(err) => {
                error!(session_id = %self.session_id, error = %err, state = "error", "session faulted");
                self.publish(SessionStatus::Error, Some(describe(&err)));
            }
        }
    }

    /// The live loop: stop requests, remote events, capture windows and ended sources.
    async fn stream(&mut self, channel: &mut dyn LiveChannel, stop_rx: &mut oneshot::Receiver<()>) -> Outcome {
        loop {
            tokio::select! {
                biased;
                _ = &mut *stop_rx => return Outcome::Stopped,
                event = channel.recv() => match event {
                    Some(Ok(event)) => self.handle_event(event),
                    Some(Err(err)) => return Outcome::Fault(err),
                    None => return Outcome::RemoteClosed,
                },
                window = next_or_pending(self.capture.as_mut().map(|c| &mut c.windows)) => match window {
                    Some(window) => {
                        if let Err(err) = self.handle_window(channel, window) {
                            return Outcome::Fault(err);
                        }
                    }
                    None => {
                        warn!(session_id = %self.session_id, "microphone stopped delivering audio");
                        if let Some(mut capture) = self.capture.take() {
                            capture.close();
                        }
                        self.volume = 0.0;
                        self.publish(SessionStatus::Live, None);
                    }
                },
                ended = next_or_pending(self.ended.as_mut()) => match ended {
                    Some(id) => {
                        if self.scheduler.on_source_ended(id) {
                            self.stats.buffers_played += 1;
                            trace!(source = id, "buffer finished");
                            self.publish(SessionStatus::Live, None);
                        }
                    }
                    // The output thread is gone; nothing scheduled would ever play or end
                    None => {
                        self.ended = None;
                        return Outcome::Fault(AppError::PermissionDenied(
                            "speaker stopped responding".to_string(),
                        ));
                    }
                },
            }
        }
    }

    /// Encode one capture window and send it without waiting.
    fn handle_window(&mut self, channel: &mut dyn LiveChannel, window: Vec<f32>) -> AppResult<()> {
        let Some(captured) = self.encoder.encode_window(&window) else {
            return Ok(());
        };

        channel.send(captured.frame)?;
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += captured.pcm_bytes as u64;
        self.volume = captured.volume;
        debug!(sequence = captured.sequence, bytes = captured.pcm_bytes, "frame sent");

        self.publish(SessionStatus::Live, None);
        Ok(())
    }

    fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Audio(data) => {
                self.stats.frames_received += 1;
                match self.scheduler.enqueue(&data) {
                    Ok(Some(source)) => {
                        self.stats.buffers_scheduled += 1;
                        self.stats.bytes_received += source.pcm_bytes as u64;
                        debug!(source = source.id, start = source.start_time, duration = source.duration, "audio scheduled");
                    }
                    Ok(None) => {}
                    Err(err) => {
                        self.stats.decode_failures += 1;
                        warn!(session_id = %self.session_id, error = %err, "dropping inbound frame");
                    }
                }
            }
            ServerEvent::Interrupted => {
                let stopped = self.scheduler.interrupt();
                self.stats.interruptions += 1;
                info!(session_id = %self.session_id, stopped, "playback interrupted by remote");
            }
            ServerEvent::TurnComplete => debug!(session_id = %self.session_id, "model turn complete"),
            ServerEvent::GoAway => warn!(session_id = %self.session_id, "remote announced it will disconnect"),
            ServerEvent::Malformed(reason) => {
                self.stats.frames_received += 1;
                self.stats.decode_failures += 1;
                warn!(session_id = %self.session_id, reason = %reason, "dropping inbound part");
            }
            ServerEvent::SetupComplete => debug!("duplicate setup acknowledgement ignored"),
        }
        self.publish(SessionStatus::Live, None);
    }

    /// Release the microphone, the speaker and the channel, in that order.
    async fn teardown(&mut self, channel: Option<&mut dyn LiveChannel>) {
        if let Some(mut capture) = self.capture.take() {
            capture.close();
        }
        self.scheduler.close();
        self.ended = None;
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.volume = 0.0;
    }
}

/// Next item from an optional receiver; never resolves when there is none.
async fn next_or_pending<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// A running session task.
struct ActiveSession {
    session_id: String,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Starts and stops the one streaming session the service runs at a time.
///
/// ## Thread Safety:
/// The active handle sits behind an async mutex so concurrent start/stop requests are
/// serialized; the session state itself lives inside the task.
pub struct SessionManager {
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn LiveConnector>,
    active: Mutex<Option<ActiveSession>>,
    publisher: Arc<watch::Sender<SessionSnapshot>>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn AudioBackend>, connector: Arc<dyn LiveConnector>) -> Self {
        let (publisher, _) = watch::channel(SessionSnapshot::idle());
        Self {
            backend,
            connector,
            active: Mutex::new(None),
            publisher: Arc::new(publisher),
        }
    }

    /// Acquire the devices and start connecting.
    ///
    /// ## Returns:
    /// - **Ok(snapshot)**: status `Connecting`; the task moves on to `Live` once acknowledged
    /// - **Err(SessionConflict)**: a session is already connecting or live
    /// - **Err(PermissionDenied)**: microphone or speaker unavailable; status becomes `Error`
    pub async fn start(&self, config: &AppConfig) -> AppResult<SessionSnapshot> {
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_ref() {
            // A task that already published a terminal status is only winding down
            if self.publisher.borrow().status.is_active() && !current.task.is_finished() {
                return Err(AppError::SessionConflict(format!(
                    "session {} is already running",
                    current.session_id
                )));
            }
        }
        if let Some(finished) = active.take() {
            let _ = finished.task.await;
        }

        let session_id = Uuid::new_v4().to_string();
        let backend = self.backend.clone();
        let audio = config.audio.clone();
        let devices = tokio::task::spawn_blocking(move || open_devices(backend.as_ref(), &audio))
            .await
            .map_err(|e| AppError::Internal(format!("device task failed: {}", e)))
            .and_then(|result| result);

        let devices = match devices {
            Ok(devices) => devices,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "could not acquire audio devices");
                self.publisher.send_replace(SessionSnapshot {
                    session_id: Some(session_id),
                    status: SessionStatus::Error,
                    volume: 0.0,
                    stats: SessionStats::default(),
                    last_error: Some(describe(&err)),
                    updated_at: Utc::now(),
                });
                return Err(err);
            }
        };

        let connecting = SessionSnapshot {
            session_id: Some(session_id.clone()),
            status: SessionStatus::Connecting,
            volume: 0.0,
            stats: SessionStats::default(),
            last_error: None,
            updated_at: Utc::now(),
        };
        self.publisher.send_replace(connecting.clone());
        info!(session_id = %session_id, state = "connecting", "session starting");

        let (stop_tx, stop_rx) = oneshot::channel();
        let session = StreamingSession::new(session_id.clone(), &config.audio, devices, self.publisher.clone());
        let setup = SessionSetup::from_config(config);
        let task = tokio::spawn(session.run(self.connector.clone(), setup, stop_rx));

        *active = Some(ActiveSession {
            session_id,
            stop_tx,
            task,
        });

        Ok(connecting)
    }

    /// Stop whatever is running and end in `Stopped`. Idempotent.
    pub async fn stop(&self) -> SessionSnapshot {
        let mut active = self.active.lock().await;

        if let Some(session) = active.take() {
            let _ = session.stop_tx.send(());
            if let Err(err) = session.task.await {
                error!(session_id = %session.session_id, error = %err, "session task did not finish cleanly");
            }
        }

        self.publisher.send_modify(|snapshot| {
            snapshot.status = SessionStatus::Stopped;
            snapshot.volume = 0.0;
            snapshot.updated_at = Utc::now();
        });
        self.snapshot()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.publisher.borrow().clone()
    }

    /// Receive every snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.publisher.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::encode_base64_pcm16;
    use crate::device::testing::{FakeBackend, FakeDevices};
    use crate::live::channel::testing::{scripted_channel, ScriptedConnector, ScriptedRemote};
    use std::time::Duration;

    struct Harness {
        manager: SessionManager,
        remote: ScriptedRemote,
        devices: FakeDevices,
        output: crate::audio::playback::testing::ManualClockOutput,
        updates: watch::Receiver<SessionSnapshot>,
    }

    fn harness() -> Harness {
        let (channel, remote) = scripted_channel();
        harness_with(ScriptedConnector::new(channel), remote)
    }

    fn harness_with(connector: ScriptedConnector, remote: ScriptedRemote) -> Harness {
        let (backend, devices) = FakeBackend::new();
        let output = backend.output.clone();
        let manager = SessionManager::new(Arc::new(backend), Arc::new(connector));
        let updates = manager.subscribe();
        Harness {
            manager,
            remote,
            devices,
            output,
            updates,
        }
    }

    async fn wait_until<F>(updates: &mut watch::Receiver<SessionSnapshot>, condition: F) -> SessionSnapshot
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let snapshot = tokio::time::timeout(Duration::from_secs(2), updates.wait_for(condition))
            .await
            .expect("timed out waiting for session update")
            .expect("session publisher dropped");
        (*snapshot).clone()
    }

    fn half_second_of_audio() -> String {
        encode_base64_pcm16(&vec![0.25; 12_000])
    }

    #[tokio::test]
    async fn test_start_goes_live_and_streams_windows() {
        let mut h = harness();
        let started = h.manager.start(&AppConfig::default()).await.unwrap();
        assert_eq!(started.status, SessionStatus::Connecting);
        wait_until(&mut h.updates, |s| s.status == SessionStatus::Live).await;

        h.devices.microphone.send(vec![0.0; 4096]).unwrap();
        h.devices.microphone.send(vec![0.1; 4096]).unwrap();
        let snapshot = wait_until(&mut h.updates, |s| s.stats.frames_sent == 2).await;

        assert_eq!(snapshot.stats.bytes_sent, 2 * 8192);
        assert!((snapshot.volume - 50.0).abs() < 1e-2);

        let sent = h.remote.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|f| f.mime_type == "audio/pcm;rate=16000"));
        assert_eq!(sent[0].data, encode_base64_pcm16(&vec![0.0; 4096]));
    }

    #[tokio::test]
    async fn test_inbound_audio_is_scheduled_back_to_back() {
        let mut h = harness();
        h.output.set_time(10.0);
        h.manager.start(&AppConfig::default()).await.unwrap();
        wait_until(&mut h.updates, |s| s.status == SessionStatus::Live).await;

        h.remote.push(ServerEvent::Audio(half_second_of_audio()));
        h.remote.push(ServerEvent::Audio(half_second_of_audio()));
        wait_until(&mut h.updates, |s| s.stats.buffers_scheduled == 2).await;

        let started = h.output.started();
        assert_eq!(started.len(), 2);
        assert_eq!(started[0].1, 10.0);
        assert_eq!(started[1].1, 10.5);
    }

    #[tokio::test]
    async fn test_interrupt_stops_every_scheduled_buffer() {
        let mut h = harness();
        h.output.set_time(1.0);
        h.manager.start(&AppConfig::default()).await.unwrap();
        wait_until(&mut h.updates, |s| s.status == SessionStatus::Live).await;

        for _ in 0..3 {
            h.remote.push(ServerEvent::Audio(half_second_of_audio()));
        }
        h.remote.push(ServerEvent::Interrupted);
        wait_until(&mut h.updates, |s| s.stats.interruptions == 1).await;

        let mut stopped = h.output.stopped();
        stopped.sort_unstable();
        assert_eq!(stopped, vec![0, 1, 2]);

        // The next buffer starts from the clock, not from the old cursor at 2.5
        h.output.set_time(1.2);
        h.remote.push(ServerEvent::Audio(half_second_of_audio()));
        wait_until(&mut h.updates, |s| s.stats.buffers_scheduled == 4).await;
        assert_eq!(h.output.started().last().unwrap().1, 1.2);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_and_session_continues() {
        let mut h = harness();
        h.output.set_time(5.0);
        h.manager.start(&AppConfig::default()).await.unwrap();
        wait_until(&mut h.updates, |s| s.status == SessionStatus::Live).await;

        h.remote.push(ServerEvent::Audio("AAE".to_string()));
        h.remote.push(ServerEvent::Audio(half_second_of_audio()));
        let snapshot = wait_until(&mut h.updates, |s| s.stats.buffers_scheduled == 1).await;

        assert_eq!(snapshot.status, SessionStatus::Live);
        assert_eq!(snapshot.stats.decode_failures, 1);
        assert_eq!(snapshot.stats.frames_received, 2);
        // Decoded PCM bytes of the good frame only, comparable with bytes_sent
        assert_eq!(snapshot.stats.bytes_received, 24_000);
        assert_eq!(h.output.started()[0].1, 5.0);
    }

    #[tokio::test]
    async fn test_unreadable_part_is_counted_and_session_continues() {
        let mut h = harness();
        h.manager.start(&AppConfig::default()).await.unwrap();
        wait_until(&mut h.updates, |s| s.status == SessionStatus::Live).await;

        h.remote.push(ServerEvent::Malformed("inline data without a payload".to_string()));
        h.remote.push(ServerEvent::Audio(half_second_of_audio()));
        let snapshot = wait_until(&mut h.updates, |s| s.stats.buffers_scheduled == 1).await;

        assert_eq!(snapshot.status, SessionStatus::Live);
        assert_eq!(snapshot.stats.decode_failures, 1);
        assert_eq!(h.remote.close_calls(), 0);
    }

    #[tokio::test]
    async fn test_finished_buffer_leaves_the_active_set() {
        let mut h = harness();
        h.manager.start(&AppConfig::default()).await.unwrap();
        wait_until(&mut h.updates, |s| s.status == SessionStatus::Live).await;

        h.remote.push(ServerEvent::Audio(half_second_of_audio()));
        h.remote.push(ServerEvent::Audio(half_second_of_audio()));
        wait_until(&mut h.updates, |s| s.stats.buffers_scheduled == 2).await;

        h.devices.ended.send(0).unwrap();
        wait_until(&mut h.updates, |s| s.stats.buffers_played == 1).await;

        // Only the buffer still playing is stopped
        h.remote.push(ServerEvent::Interrupted);
        wait_until(&mut h.updates, |s| s.stats.interruptions == 1).await;
        assert_eq!(h.output.stopped(), vec![1]);
    }

    #[tokio::test]
    async fn test_speaker_loss_ends_session() {
        let mut h = harness();
        h.manager.start(&AppConfig::default()).await.unwrap();
        wait_until(&mut h.updates, |s| s.status == SessionStatus::Live).await;

        drop(h.devices.ended);
        let snapshot = wait_until(&mut h.updates, |s| s.status == SessionStatus::Error).await;

        assert_eq!(
            snapshot.last_error.as_deref(),
            Some("permission_denied: speaker stopped responding")
        );
        assert!(h.devices.microphone.is_closed());
        assert_eq!(h.output.close_calls(), 1);
        assert_eq!(h.remote.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_remote_close_disconnects_and_releases_devices() {
        let mut h = harness();
        h.manager.start(&AppConfig::default()).await.unwrap();
        wait_until(&mut h.updates, |s| s.status == SessionStatus::Live).await;

        h.remote.hang_up();
        let snapshot = wait_until(&mut h.updates, |s| s.status == SessionStatus::Disconnected).await;

        assert_eq!(snapshot.last_error, None);
        assert!(h.devices.microphone.is_closed());
        assert_eq!(h.output.close_calls(), 1);
        assert_eq!(h.remote.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_channel_fault_surfaces_as_error_status() {
        let mut h = harness();
        h.manager.start(&AppConfig::default()).await.unwrap();
        wait_until(&mut h.updates, |s| s.status == SessionStatus::Live).await;

        h.remote.fault(AppError::ChannelFault("connection reset".to_string()));
        let snapshot = wait_until(&mut h.updates, |s| s.status == SessionStatus::Error).await;

        assert_eq!(snapshot.last_error.as_deref(), Some("channel_fault: connection reset"));
        assert!(h.devices.microphone.is_closed());
        assert_eq!(h.output.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut h = harness();
        h.manager.start(&AppConfig::default()).await.unwrap();
        wait_until(&mut h.updates, |s| s.status == SessionStatus::Live).await;

        let first = h.manager.stop().await;
        let second = h.manager.stop().await;

        assert_eq!(first.status, SessionStatus::Stopped);
        assert_eq!(second.status, SessionStatus::Stopped);
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(second.volume, 0.0);
        assert!(h.devices.microphone.is_closed());
        assert_eq!(h.output.close_calls(), 1);
        assert_eq!(h.remote.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_without_session_still_ends_stopped() {
        let h = harness();
        assert_eq!(h.manager.snapshot().status, SessionStatus::Idle);
        assert_eq!(h.manager.stop().await.status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_second_start_conflicts() {
        let mut h = harness();
        h.manager.start(&AppConfig::default()).await.unwrap();
        wait_until(&mut h.updates, |s| s.status == SessionStatus::Live).await;

        let err = h.manager.start(&AppConfig::default()).await.unwrap_err();
        assert!(matches!(err, AppError::SessionConflict(_)));
        assert_eq!(h.manager.snapshot().status, SessionStatus::Live);
    }

    #[tokio::test]
    async fn test_denied_microphone_fails_start() {
        let (channel, _remote) = scripted_channel();
        let manager = SessionManager::new(
            Arc::new(FakeBackend::denying_microphone()),
            Arc::new(ScriptedConnector::new(channel)),
        );

        let err = manager.start(&AppConfig::default()).await.unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Error);
        assert!(snapshot.last_error.unwrap().starts_with("permission_denied"));
    }

    #[tokio::test]
    async fn test_denied_speaker_releases_microphone() {
        let (backend, devices) = FakeBackend::denying_speaker();
        let (channel, _remote) = scripted_channel();
        let manager = SessionManager::new(Arc::new(backend), Arc::new(ScriptedConnector::new(channel)));

        let err = manager.start(&AppConfig::default()).await.unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));
        assert!(devices.microphone.is_closed());
        assert_eq!(manager.snapshot().status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn test_open_failure_ends_in_error() {
        let (_channel, remote) = scripted_channel();
        let connector = ScriptedConnector::failing(AppError::ChannelOpenFailed("handshake rejected".to_string()));
        let mut h = harness_with(connector, remote);

        h.manager.start(&AppConfig::default()).await.unwrap();
        let snapshot = wait_until(&mut h.updates, |s| s.status == SessionStatus::Error).await;

        assert_eq!(snapshot.last_error.as_deref(), Some("channel_open_failed: handshake rejected"));
        assert!(h.devices.microphone.is_closed());
        assert_eq!(h.output.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_while_connecting() {
        let (channel, remote) = scripted_channel();
        let (connector, _gate) = ScriptedConnector::gated(channel);
        let h = harness_with(connector, remote);

        h.manager.start(&AppConfig::default()).await.unwrap();
        let snapshot = h.manager.stop().await;

        assert_eq!(snapshot.status, SessionStatus::Stopped);
        assert_eq!(h.output.close_calls(), 1);
        assert_eq!(h.remote.close_calls(), 0);
    }

    #[tokio::test]
    async fn test_windows_before_acknowledgement_are_discarded() {
        let (channel, remote) = scripted_channel();
        let (connector, gate) = ScriptedConnector::gated(channel);
        let mut h = harness_with(connector, remote);

        h.manager.start(&AppConfig::default()).await.unwrap();
        h.devices.microphone.send(vec![0.5; 4096]).unwrap();
        gate.send(()).unwrap();
        wait_until(&mut h.updates, |s| s.status == SessionStatus::Live).await;

        h.devices.microphone.send(vec![0.0; 4096]).unwrap();
        wait_until(&mut h.updates, |s| s.stats.frames_sent == 1).await;

        let sent = h.remote.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, encode_base64_pcm16(&vec![0.0; 4096]));
    }

    #[tokio::test]
    async fn test_restart_after_disconnect() {
        let mut h = harness();
        h.manager.start(&AppConfig::default()).await.unwrap();
        wait_until(&mut h.updates, |s| s.status == SessionStatus::Live).await;
        h.remote.hang_up();
        wait_until(&mut h.updates, |s| s.status == SessionStatus::Disconnected).await;

        // The fake devices and channel are single use, so the restart fails on the
        // microphone, but it is no longer a conflict
        let err = h.manager.start(&AppConfig::default()).await.unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));
    }
}
