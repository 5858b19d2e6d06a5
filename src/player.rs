use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::bridge::{spawn_poll_loop, Bridge};
use crate::cache::DownloadCache;
use crate::driver::SessionDriver;
use crate::fetcher::{FetchError, MediaFetcher, TrackMeta};
use crate::messages::{
    ClientCommand, PlaybackState, ServerEvent, SessionStatus, Track, VolumeTarget,
};
use crate::queue::{Removed, TrackQueue};
use crate::session;

/// How many consecutive unfetchable tracks an automatic advance will step
/// over before parking the player idle.
const MAX_FAILURE_SKIPS: usize = 5;
/// How far ahead of the playhead files are fetched speculatively.
const PREFETCH_COUNT: usize = 2;
/// Default level for both mixer gains, in percent.
const DEFAULT_VOLUME: u8 = 80;

// ---------------------------------------------------------------------------
// Channel messages
// ---------------------------------------------------------------------------

/// Requests from websocket connection tasks to the orchestrator.
#[derive(Debug)]
pub enum ControlRequest {
    Subscribe {
        id: Uuid,
        tx: mpsc::Sender<String>,
    },
    Unsubscribe {
        id: Uuid,
    },
    Command {
        from: Uuid,
        cmd: ClientCommand,
    },
}

/// Completions from background tasks (fetches, session automation, the
/// bridge poll loop) back to the orchestrator.
#[derive(Debug)]
pub enum InternalEvent {
    MetadataResolved {
        from: Uuid,
        locator: String,
        requested_by: String,
        result: Result<TrackMeta, FetchError>,
    },
    FetchFinished {
        track_id: u64,
        result: Result<PathBuf, FetchError>,
    },
    Ended {
        token: u64,
    },
    Progress {
        current: f64,
        total: f64,
    },
    SessionJoined {
        link: String,
    },
    SessionFailed {
        message: String,
    },
    SessionClosed,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Owns every piece of playback state: the queue, the current track, volumes,
/// session status and the subscriber set. All mutation happens on the one
/// task that drives `handle_request` / `handle_event`, so published snapshots
/// are always internally consistent without any locking.
pub struct Player<D, F> {
    cache: Arc<DownloadCache<F>>,
    driver: Arc<D>,
    bridge: Bridge<D>,
    events_tx: mpsc::Sender<InternalEvent>,
    shutdown: watch::Receiver<bool>,
    /// Origin serving /downloads, as seen from the session page.
    base_url: String,

    queue: TrackQueue,
    current: Option<Track>,
    state: PlaybackState,
    loop_enabled: bool,
    music_volume: u8,
    mic_volume: u8,
    mic_muted: bool,
    session_link: Option<String>,
    session_status: SessionStatus,

    /// Tracks removed while their fetch was still in flight; kept so the
    /// completion can release the file.
    tombstoned: Vec<Track>,
    next_track_id: u64,
    /// Correlation token for ended markers; bumped on every play issued.
    play_seq: u64,

    subscribers: HashMap<Uuid, mpsc::Sender<String>>,
    poll_task: Option<tokio::task::JoinHandle<()>>,
}

impl<D: SessionDriver, F: MediaFetcher> Player<D, F> {
    pub fn new(
        cache: Arc<DownloadCache<F>>,
        driver: Arc<D>,
        events_tx: mpsc::Sender<InternalEvent>,
        shutdown: watch::Receiver<bool>,
        base_url: String,
    ) -> Self {
        Self {
            cache,
            bridge: Bridge::new(driver.clone()),
            driver,
            events_tx,
            shutdown,
            base_url,
            queue: TrackQueue::new(),
            current: None,
            state: PlaybackState::Idle,
            loop_enabled: false,
            music_volume: DEFAULT_VOLUME,
            mic_volume: DEFAULT_VOLUME,
            mic_muted: false,
            session_link: None,
            session_status: SessionStatus::Disconnected,
            tombstoned: Vec::new(),
            next_track_id: 1,
            play_seq: 0,
            subscribers: HashMap::new(),
            poll_task: None,
        }
    }

    // -- inbound ------------------------------------------------------------

    pub async fn handle_request(&mut self, req: ControlRequest) {
        match req {
            ControlRequest::Subscribe { id, tx } => {
                // Snapshot first, then register: the client always sees a
                // full state_sync before any incremental update.
                if tx.try_send(self.snapshot().encode()).is_ok() {
                    self.subscribers.insert(id, tx);
                    tracing::info!(
                        "[player] client {id} subscribed ({} connected)",
                        self.subscribers.len()
                    );
                }
            }
            ControlRequest::Unsubscribe { id } => {
                self.subscribers.remove(&id);
                tracing::info!(
                    "[player] client {id} gone ({} connected)",
                    self.subscribers.len()
                );
            }
            ControlRequest::Command { from, cmd } => self.handle_command(from, cmd).await,
        }
    }

    async fn handle_command(&mut self, from: Uuid, cmd: ClientCommand) {
        match cmd {
            ClientCommand::Enqueue {
                locator,
                requested_by,
            } => self.enqueue(from, locator, requested_by),
            ClientCommand::Skip => {
                if let Err(e) = self.bridge.stop().await {
                    tracing::warn!("[player] stop before skip failed: {e}");
                }
                self.advance().await;
            }
            ClientCommand::Stop => {
                if let Err(e) = self.bridge.stop().await {
                    tracing::warn!("[player] stop failed: {e}");
                }
                if let Some(prev) = self.current.take() {
                    self.release(&prev);
                }
                self.state = PlaybackState::Idle;
                self.publish_playback();
            }
            ClientCommand::Pause => {
                if self.state == PlaybackState::Playing {
                    if let Err(e) = self.bridge.pause().await {
                        tracing::warn!("[player] pause failed: {e}");
                    }
                    self.state = PlaybackState::Paused;
                    self.publish_playback();
                }
            }
            ClientCommand::Resume => match self.state {
                PlaybackState::Paused => {
                    if let Err(e) = self.bridge.resume().await {
                        tracing::warn!("[player] resume failed: {e}");
                    }
                    self.state = PlaybackState::Playing;
                    self.publish_playback();
                }
                // Resuming an idle player starts the queue.
                PlaybackState::Idle => self.advance().await,
                PlaybackState::Playing => {}
            },
            ClientCommand::ToggleLoop => {
                self.loop_enabled = !self.loop_enabled;
                self.publish_playback();
            }
            ClientCommand::Reorder { ordered_ids } => {
                self.queue.reorder(&ordered_ids);
                self.prefetch_next();
                self.publish_queue();
            }
            ClientCommand::ToggleMic => {
                self.mic_muted = !self.mic_muted;
                let driver = self.driver.clone();
                let muted = self.mic_muted;
                tokio::spawn(async move {
                    if let Err(e) = session::set_mic_muted(driver.as_ref(), muted).await {
                        tracing::warn!("[player] mic toggle failed: {e}");
                    }
                });
                self.publish(&ServerEvent::MicStatus {
                    muted: self.mic_muted,
                });
            }
            ClientCommand::SetVolume { target, value } => {
                let value = value.clamp(0, 100) as u8;
                let result = match target {
                    VolumeTarget::Music => {
                        self.music_volume = value;
                        self.bridge.set_music_volume(value).await
                    }
                    VolumeTarget::Mic => {
                        self.mic_volume = value;
                        self.bridge.set_mic_volume(value).await
                    }
                };
                if let Err(e) = result {
                    tracing::warn!("[player] volume command failed: {e}");
                }
                self.publish(&ServerEvent::VolumeUpdate {
                    music_volume: self.music_volume,
                    mic_volume: self.mic_volume,
                });
            }
            ClientCommand::JoinSession { link } => self.join_session(from, link),
            ClientCommand::LeaveSession => {
                self.session_link = None;
                let driver = self.driver.clone();
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = session::leave_meeting(driver.as_ref()).await {
                        tracing::warn!("[player] leave failed: {e}");
                    }
                    events.send(InternalEvent::SessionClosed).await.ok();
                });
            }
            ClientCommand::RemoveTrack { id } => match self.queue.remove(id) {
                Removed::Gone(track) => {
                    tracing::info!("[player] removed '{}' from queue", track.title);
                    self.release(&track);
                    self.publish_queue();
                }
                Removed::Tombstoned(track) => {
                    tracing::info!(
                        "[player] removed '{}' (fetch still running)",
                        track.title
                    );
                    self.tombstoned.push(track);
                    self.publish_queue();
                }
                Removed::NotFound => {
                    tracing::debug!("[player] remove for unknown track {id}");
                }
            },
        }
    }

    pub async fn handle_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::MetadataResolved {
                from,
                locator,
                requested_by,
                result,
            } => self.on_metadata(from, locator, requested_by, result).await,
            InternalEvent::FetchFinished { track_id, result } => {
                self.on_fetch_finished(track_id, result)
            }
            InternalEvent::Ended { token } => self.on_ended(token).await,
            InternalEvent::Progress { current, total } => {
                if self.state == PlaybackState::Playing {
                    self.publish(&ServerEvent::ProgressUpdate { current, total });
                }
            }
            InternalEvent::SessionJoined { link } => {
                tracing::info!("[player] session joined: {link}");
                self.session_status = SessionStatus::Connected;
                self.session_link = Some(link);
                self.publish_session_status();
                if let Some(task) = self.poll_task.take() {
                    task.abort();
                }
                self.poll_task = Some(spawn_poll_loop(
                    self.driver.clone(),
                    self.events_tx.clone(),
                    self.shutdown.clone(),
                ));
            }
            InternalEvent::SessionFailed { message } => {
                tracing::warn!("[player] session join failed: {message}");
                self.session_status = SessionStatus::Disconnected;
                self.session_link = None;
                self.publish_session_status();
                self.publish(&ServerEvent::Error {
                    message: format!("Could not join session: {message}"),
                });
            }
            InternalEvent::SessionClosed => {
                self.session_status = SessionStatus::Disconnected;
                self.session_link = None;
                self.publish_session_status();
                if let Some(task) = self.poll_task.take() {
                    task.abort();
                }
            }
        }
    }

    // -- enqueue ------------------------------------------------------------

    /// Kick off the metadata probe off-task; the track joins the queue when
    /// `MetadataResolved` comes back.
    fn enqueue(&mut self, from: Uuid, locator: String, requested_by: String) {
        let locator = locator.trim().to_string();
        if locator.is_empty() {
            self.publish_to(
                &from,
                &ServerEvent::Error {
                    message: "Empty track locator".into(),
                },
            );
            return;
        }

        tracing::info!("[player] resolving '{locator}' for {requested_by}");
        let cache = self.cache.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = cache.metadata(&locator).await;
            events
                .send(InternalEvent::MetadataResolved {
                    from,
                    locator,
                    requested_by,
                    result,
                })
                .await
                .ok();
        });
    }

    async fn on_metadata(
        &mut self,
        from: Uuid,
        locator: String,
        requested_by: String,
        result: Result<TrackMeta, FetchError>,
    ) {
        let meta = match result {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("[player] metadata for '{locator}' failed: {e}");
                // Only the requester hears about their bad link.
                self.publish_to(
                    &from,
                    &ServerEvent::Error {
                        message: format!("Could not add \"{locator}\": {e}"),
                    },
                );
                return;
            }
        };

        let id = self.next_track_id;
        self.next_track_id += 1;
        let track = Track {
            id,
            title: meta.title,
            duration_seconds: meta.duration_seconds,
            source_locator: locator,
            requested_by,
            added_at: chrono::Local::now().format("%H:%M").to_string(),
            local_file_path: None,
            fetch_in_flight: false,
            tombstoned: false,
        };

        tracing::info!("[player] queued '{}' (#{})", track.title, track.id);
        self.publish(&ServerEvent::TrackAdded {
            track: track.clone(),
        });
        self.queue.enqueue(track);
        self.publish_queue();

        if self.state == PlaybackState::Idle && self.current.is_none() {
            self.advance().await;
        } else {
            self.prefetch_next();
        }
    }

    // -- playback progression -----------------------------------------------

    /// Move the playhead to the next playable track, releasing the previous
    /// one. Unfetchable tracks are skipped with an error broadcast, up to
    /// `MAX_FAILURE_SKIPS` in one advance; past that the player parks idle
    /// rather than churn through a long broken queue.
    async fn advance(&mut self) {
        if let Some(prev) = self.current.take() {
            self.release(&prev);
        }

        let mut skips = 0usize;
        loop {
            let Some(track) = self.queue.pop_front() else {
                self.state = PlaybackState::Idle;
                self.publish_playback();
                self.publish_queue();
                return;
            };

            let locator = track.source_locator.clone();
            let title = track.title.clone();
            self.current = Some(track);
            self.state = PlaybackState::Playing;
            self.publish_queue();
            self.prefetch_next();

            // A prefetch may already be running for this locator; the cache
            // joins it instead of fetching twice.
            match self.cache.fetch(&locator).await {
                Ok(path) => {
                    if let Some(current) = self.current.as_mut() {
                        current.fetch_in_flight = false;
                        current.set_file_path(path);
                    }
                    self.play_current().await;
                    self.publish_playback();
                    return;
                }
                Err(e) => {
                    tracing::warn!("[player] cannot play '{title}': {e}");
                    self.publish(&ServerEvent::Error {
                        message: format!("Skipping \"{title}\": {e}"),
                    });
                    if let Some(broken) = self.current.take() {
                        self.release(&broken);
                    }
                    skips += 1;
                    if skips >= MAX_FAILURE_SKIPS {
                        tracing::warn!(
                            "[player] {skips} tracks failed in a row, going idle"
                        );
                        self.publish(&ServerEvent::Error {
                            message: format!(
                                "{skips} tracks failed in a row; playback stopped"
                            ),
                        });
                        self.state = PlaybackState::Idle;
                        self.publish_playback();
                        return;
                    }
                }
            }
        }
    }

    /// Issue the play command for the current track under a fresh token.
    async fn play_current(&mut self) {
        let url = {
            let Some(track) = &self.current else { return };
            let Some(path) = &track.local_file_path else {
                return;
            };
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                return;
            };
            format!("{}/downloads/{}", self.base_url, name)
        };

        self.play_seq += 1;
        tracing::info!("[player] play {url} (token {})", self.play_seq);
        if let Err(e) = self.bridge.play(&url, self.play_seq).await {
            tracing::warn!("[player] play command failed: {e}");
            self.publish(&ServerEvent::Error {
                message: format!("Playback start failed: {e}"),
            });
        }
    }

    /// An ended marker from the poll loop. Tokens from plays that were since
    /// superseded are dropped, so a marker raced by a skip cannot double-
    /// advance the queue.
    async fn on_ended(&mut self, token: u64) {
        if token != self.play_seq {
            tracing::debug!(
                "[player] stale ended marker (token {token}, current {})",
                self.play_seq
            );
            return;
        }
        if self.loop_enabled && self.current.is_some() {
            tracing::info!("[player] looping current track");
            self.play_current().await;
            return;
        }
        self.advance().await;
    }

    // -- fetch completions ---------------------------------------------------

    fn on_fetch_finished(&mut self, track_id: u64, result: Result<PathBuf, FetchError>) {
        let path = match result {
            Ok(path) => path,
            Err(e) => {
                // Prefetch failures are not fatal here; the advance that
                // eventually reaches the track reports the error.
                tracing::warn!("[player] prefetch for track {track_id} failed: {e}");
                self.tombstoned.retain(|t| t.id != track_id);
                if let Some(track) = self.current.as_mut().filter(|t| t.id == track_id) {
                    track.fetch_in_flight = false;
                } else if let Some(track) = self.queue.get_mut(track_id) {
                    track.fetch_in_flight = false;
                }
                return;
            }
        };

        // A tombstoned track's fetch completing is the deferred removal.
        if let Some(pos) = self.tombstoned.iter().position(|t| t.id == track_id) {
            let mut track = self.tombstoned.remove(pos);
            track.fetch_in_flight = false;
            track.set_file_path(path);
            self.release(&track);
            return;
        }

        if let Some(track) = self.current.as_mut().filter(|t| t.id == track_id) {
            track.fetch_in_flight = false;
            track.set_file_path(path);
        } else if let Some(track) = self.queue.get_mut(track_id) {
            track.fetch_in_flight = false;
            track.set_file_path(path);
        } else if !self.file_in_use(&path, track_id) {
            // Completion for a track nobody knows anymore.
            self.cache.delete(&path);
        }
    }

    fn join_session(&mut self, from: Uuid, link: String) {
        let Some(link) = session::normalize_meet_link(&link) else {
            self.publish_to(
                &from,
                &ServerEvent::Error {
                    message: format!("Not a valid session link: {link}"),
                },
            );
            return;
        };

        self.session_link = Some(link.clone());
        self.session_status = SessionStatus::Connecting;
        self.publish_session_status();

        let driver = self.driver.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let message = match session::join_meeting(driver.as_ref(), &link).await {
                Ok(()) => {
                    events.send(InternalEvent::SessionJoined { link }).await.ok();
                    return;
                }
                Err(e) => e.to_string(),
            };
            events
                .send(InternalEvent::SessionFailed { message })
                .await
                .ok();
        });
    }

    // -- file lifetime -------------------------------------------------------

    /// Drop a track's claim on its cached file, deleting the file once no
    /// current or queued track references it.
    fn release(&self, track: &Track) {
        let Some(path) = &track.local_file_path else {
            return;
        };
        if self.file_in_use(path, track.id) {
            tracing::debug!("[player] keeping {} (still referenced)", path.display());
            return;
        }
        self.cache.delete(path);
    }

    fn file_in_use(&self, path: &Path, excluding_id: u64) -> bool {
        self.current
            .iter()
            .chain(self.queue.iter())
            .any(|t| t.id != excluding_id && t.local_file_path.as_deref() == Some(path))
    }

    /// Speculatively fetch files for the first few queued tracks.
    fn prefetch_next(&mut self) {
        let cache = self.cache.clone();
        let events = self.events_tx.clone();
        for track in self.queue.prefetch_candidates_mut(PREFETCH_COUNT) {
            if track.local_file_path.is_some() || track.fetch_in_flight {
                continue;
            }
            track.fetch_in_flight = true;

            let cache = cache.clone();
            let events = events.clone();
            let locator = track.source_locator.clone();
            let track_id = track.id;
            tracing::debug!("[player] prefetching track {track_id}");
            tokio::spawn(async move {
                let result = cache.fetch(&locator).await;
                events
                    .send(InternalEvent::FetchFinished { track_id, result })
                    .await
                    .ok();
            });
        }
    }

    // -- broadcast -----------------------------------------------------------

    fn snapshot(&self) -> ServerEvent {
        ServerEvent::StateSync {
            queue: self.queue.tracks().to_vec(),
            current_track: self.current.clone(),
            playback_state: self.state,
            loop_enabled: self.loop_enabled,
            music_volume: self.music_volume,
            mic_volume: self.mic_volume,
            mic_muted: self.mic_muted,
            session_link: self.session_link.clone(),
            session_status: self.session_status,
        }
    }

    /// Fan an event out to every subscriber. Slow consumers lose events
    /// rather than stall the orchestrator; they resync from the next
    /// snapshot on reconnect.
    fn publish(&mut self, event: &ServerEvent) {
        let text = event.encode();
        let mut dead = Vec::new();
        for (id, tx) in &self.subscribers {
            match tx.try_send(text.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("[player] client {id} is slow, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }

    fn publish_to(&self, id: &Uuid, event: &ServerEvent) {
        if let Some(tx) = self.subscribers.get(id) {
            tx.try_send(event.encode()).ok();
        }
    }

    fn publish_queue(&mut self) {
        self.publish(&ServerEvent::QueueUpdate {
            queue: self.queue.tracks().to_vec(),
        });
    }

    fn publish_playback(&mut self) {
        self.publish(&ServerEvent::PlaybackUpdate {
            current_track: self.current.clone(),
            playback_state: self.state,
            loop_enabled: self.loop_enabled,
        });
    }

    fn publish_session_status(&mut self) {
        self.publish(&ServerEvent::SessionStatus {
            status: self.session_status,
            link: self.session_link.clone(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::fetcher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Instant in-process fetcher: metadata always resolves, fetch writes
    /// `<stem>.mp3` (or fails when told to) and counts invocations.
    #[derive(Clone)]
    struct InstantFetcher {
        fetches: Arc<AtomicUsize>,
        fail: bool,
    }

    impl MediaFetcher for InstantFetcher {
        async fn metadata(&self, locator: &str) -> fetcher::Result<TrackMeta> {
            Ok(TrackMeta {
                title: format!("title of {locator}"),
                duration_seconds: 60,
            })
        }

        async fn fetch(&self, _locator: &str, output_stem: &Path) -> fetcher::Result<PathBuf> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FetchError::Source("stub failure".into()));
            }
            let path = output_stem.with_extension("mp3");
            std::fs::write(&path, b"audio").unwrap();
            Ok(path)
        }
    }

    struct Rig {
        player: Player<MockDriver, InstantFetcher>,
        events_rx: mpsc::Receiver<InternalEvent>,
        driver: Arc<MockDriver>,
        fetches: Arc<AtomicUsize>,
        dir: PathBuf,
        _shutdown_tx: watch::Sender<bool>,
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    fn rig(fail: bool) -> Rig {
        let dir = std::env::temp_dir().join(format!("meetjam-player-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let fetches = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(
            DownloadCache::new(
                dir.clone(),
                InstantFetcher {
                    fetches: fetches.clone(),
                    fail,
                },
            )
            .unwrap(),
        );
        let driver = Arc::new(MockDriver::new());
        let (events_tx, events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let player = Player::new(
            cache,
            driver.clone(),
            events_tx,
            shutdown_rx,
            "http://127.0.0.1:8000".into(),
        );
        Rig {
            player,
            events_rx,
            driver,
            fetches,
            dir,
            _shutdown_tx: shutdown_tx,
        }
    }

    /// Run the full enqueue flow: command, then feed the resulting metadata
    /// event back like the orchestrator loop would.
    async fn enqueue(rig: &mut Rig, locator: &str) {
        rig.player
            .handle_command(
                Uuid::new_v4(),
                ClientCommand::Enqueue {
                    locator: locator.into(),
                    requested_by: "test".into(),
                },
            )
            .await;
        let event = rig.events_rx.recv().await.expect("metadata event");
        assert!(matches!(event, InternalEvent::MetadataResolved { .. }));
        rig.player.handle_event(event).await;
    }

    /// Let spawned fetch tasks run, then deliver their completions.
    async fn drain_fetches(rig: &mut Rig) {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        while let Ok(event) = rig.events_rx.try_recv() {
            rig.player.handle_event(event).await;
        }
    }

    fn current_path(rig: &Rig) -> PathBuf {
        rig.player
            .current
            .as_ref()
            .and_then(|t| t.local_file_path.clone())
            .expect("current track with file")
    }

    #[tokio::test]
    async fn test_enqueue_starts_playback_when_idle() {
        let mut rig = rig(false);
        enqueue(&mut rig, "https://example.com/a").await;

        assert_eq!(rig.player.state, PlaybackState::Playing);
        assert_eq!(rig.player.current.as_ref().unwrap().id, 1);
        assert!(current_path(&rig).is_file());
        assert!(rig
            .driver
            .scripts()
            .iter()
            .any(|s| s.contains("__jam.play(")));
    }

    #[tokio::test]
    async fn test_ended_goes_idle_and_releases_file() {
        let mut rig = rig(false);
        enqueue(&mut rig, "https://example.com/a").await;
        let path = current_path(&rig);
        let token = rig.player.play_seq;

        rig.player
            .handle_event(InternalEvent::Ended { token })
            .await;

        assert_eq!(rig.player.state, PlaybackState::Idle);
        assert!(rig.player.current.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stale_ended_token_is_ignored() {
        let mut rig = rig(false);
        enqueue(&mut rig, "https://example.com/a").await;

        rig.player
            .handle_event(InternalEvent::Ended { token: 999 })
            .await;

        assert_eq!(rig.player.state, PlaybackState::Playing);
        assert!(rig.player.current.is_some());
    }

    #[tokio::test]
    async fn test_loop_replays_without_advancing() {
        let mut rig = rig(false);
        enqueue(&mut rig, "https://example.com/a").await;
        rig.player
            .handle_command(Uuid::new_v4(), ClientCommand::ToggleLoop)
            .await;
        let path = current_path(&rig);
        let first_seq = rig.player.play_seq;

        rig.player
            .handle_event(InternalEvent::Ended { token: first_seq })
            .await;

        assert_eq!(rig.player.state, PlaybackState::Playing);
        assert_eq!(rig.player.current.as_ref().unwrap().id, 1);
        assert_eq!(rig.player.play_seq, first_seq + 1);
        assert!(path.exists());
        assert_eq!(rig.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_skip_advances_to_next_track() {
        let mut rig = rig(false);
        enqueue(&mut rig, "https://example.com/a").await;
        enqueue(&mut rig, "https://example.com/b").await;
        let path_a = current_path(&rig);
        drain_fetches(&mut rig).await; // b's prefetch completion

        rig.player
            .handle_command(Uuid::new_v4(), ClientCommand::Skip)
            .await;

        assert_eq!(rig.player.state, PlaybackState::Playing);
        assert_eq!(rig.player.current.as_ref().unwrap().id, 2);
        assert!(!path_a.exists());
        // b was fetched once by the prefetch; the advance was a disk hit.
        assert_eq!(rig.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_advance_skips_at_most_five_broken_tracks() {
        let mut rig = rig(true);
        for id in 1..=7 {
            rig.player.queue.enqueue(Track {
                id,
                title: format!("broken {id}"),
                duration_seconds: 10,
                source_locator: format!("https://example.com/broken/{id}"),
                requested_by: "test".into(),
                added_at: "10:00".into(),
                local_file_path: None,
                fetch_in_flight: false,
                tombstoned: false,
            });
        }

        rig.player.advance().await;

        assert_eq!(rig.player.state, PlaybackState::Idle);
        assert!(rig.player.current.is_none());
        assert_eq!(rig.player.queue.len(), 2);
    }

    #[tokio::test]
    async fn test_shared_file_survives_until_last_reference_drops() {
        let mut rig = rig(false);
        // Same locator twice: one cached file, two queue entries.
        enqueue(&mut rig, "https://example.com/same").await;
        enqueue(&mut rig, "https://example.com/same").await;
        let path = current_path(&rig);
        drain_fetches(&mut rig).await;

        let token = rig.player.play_seq;
        rig.player
            .handle_event(InternalEvent::Ended { token })
            .await;
        // Second entry still references the file.
        assert_eq!(rig.player.current.as_ref().unwrap().id, 2);
        assert!(path.exists());

        let token = rig.player.play_seq;
        rig.player
            .handle_event(InternalEvent::Ended { token })
            .await;
        assert!(rig.player.current.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_tombstoned_removal_releases_file_after_fetch() {
        let mut rig = rig(false);
        enqueue(&mut rig, "https://example.com/a").await;
        enqueue(&mut rig, "https://example.com/b").await;
        // b's prefetch is in flight and deliberately not drained yet.
        assert!(rig.player.queue.tracks()[0].fetch_in_flight);

        rig.player
            .handle_command(Uuid::new_v4(), ClientCommand::RemoveTrack { id: 2 })
            .await;
        assert!(rig.player.queue.is_empty());
        assert_eq!(rig.player.tombstoned.len(), 1);

        drain_fetches(&mut rig).await;

        assert!(rig.player.tombstoned.is_empty());
        let b_stem = rig.player.cache.dir().join(crate::cache::cache_key("https://example.com/b"));
        assert!(!b_stem.with_extension("mp3").exists());
    }

    #[tokio::test]
    async fn test_subscribe_receives_snapshot_first() {
        let mut rig = rig(false);
        enqueue(&mut rig, "https://example.com/a").await;

        let (tx, mut rx) = mpsc::channel(8);
        rig.player
            .handle_request(ControlRequest::Subscribe {
                id: Uuid::new_v4(),
                tx,
            })
            .await;

        let first = rx.recv().await.unwrap();
        assert!(first.contains(r#""type":"state_sync""#));
        assert!(first.contains(r#""playback_state":"playing""#));
    }

    #[tokio::test]
    async fn test_set_volume_clamps_and_reaches_bridge() {
        let mut rig = rig(false);
        rig.player
            .handle_command(
                Uuid::new_v4(),
                ClientCommand::SetVolume {
                    target: VolumeTarget::Music,
                    value: 250,
                },
            )
            .await;
        rig.player
            .handle_command(
                Uuid::new_v4(),
                ClientCommand::SetVolume {
                    target: VolumeTarget::Mic,
                    value: -10,
                },
            )
            .await;

        assert_eq!(rig.player.music_volume, 100);
        assert_eq!(rig.player.mic_volume, 0);
        let scripts = rig.driver.scripts();
        assert!(scripts.iter().any(|s| s.contains("setMusicVolume(100)")));
        assert!(scripts.iter().any(|s| s.contains("setMicVolume(0)")));
    }

    #[tokio::test]
    async fn test_pause_resume_cycle() {
        let mut rig = rig(false);
        enqueue(&mut rig, "https://example.com/a").await;

        rig.player
            .handle_command(Uuid::new_v4(), ClientCommand::Pause)
            .await;
        assert_eq!(rig.player.state, PlaybackState::Paused);

        rig.player
            .handle_command(Uuid::new_v4(), ClientCommand::Resume)
            .await;
        assert_eq!(rig.player.state, PlaybackState::Playing);
    }

    #[tokio::test]
    async fn test_resume_on_idle_starts_queue() {
        let mut rig = rig(false);
        enqueue(&mut rig, "https://example.com/a").await;
        enqueue(&mut rig, "https://example.com/b").await;

        // Stop with b still queued: idle player, non-empty queue.
        rig.player
            .handle_command(Uuid::new_v4(), ClientCommand::Stop)
            .await;
        assert_eq!(rig.player.state, PlaybackState::Idle);
        assert_eq!(rig.player.queue.len(), 1);
        drain_fetches(&mut rig).await;

        rig.player
            .handle_command(Uuid::new_v4(), ClientCommand::Resume)
            .await;
        assert_eq!(rig.player.state, PlaybackState::Playing);
        assert_eq!(rig.player.current.as_ref().unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_invalid_session_link_only_answers_requester() {
        let mut rig = rig(false);
        let requester = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        rig.player
            .handle_request(ControlRequest::Subscribe { id: requester, tx })
            .await;
        rx.recv().await.unwrap(); // snapshot

        rig.player
            .handle_command(
                requester,
                ClientCommand::JoinSession {
                    link: "https://evil.example.com/abc".into(),
                },
            )
            .await;

        let reply = rx.recv().await.unwrap();
        assert!(reply.contains(r#""type":"error""#));
        assert_eq!(rig.player.session_status, SessionStatus::Disconnected);
    }
}
