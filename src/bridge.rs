use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::driver::{self, DriverError, SessionDriver};
use crate::player::InternalEvent;

/// Cadence of the remote-state reconciliation poll.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Injected mixing graph
// ---------------------------------------------------------------------------

/// Script installed into the session page before it loads. Builds the Web
/// Audio mixing graph and patches getUserMedia so the conference captures
/// the graph's output as the microphone.
///
/// Command surface exposed as `window.__jam`; completion is signalled by
/// writing a `{token}` record to `window.__jam_ended`, which the host
/// consumes on its next poll. The page never calls back into the host.
pub const GRAPH_INIT_SCRIPT: &str = r#"
(() => {
  if (window.__jam_injected) return;
  window.__jam_injected = true;

  const ctx = new AudioContext({ sampleRate: 48000 });
  const dest = ctx.createMediaStreamDestination();
  const musicGain = ctx.createGain();
  const micGain = ctx.createGain();
  musicGain.gain.value = 0.8;
  micGain.gain.value = 0.8;
  musicGain.connect(micGain);
  micGain.connect(dest);

  let audio = null;
  let source = null;

  window.__jam_ended = null;

  window.__jam = {
    play: async (url, token) => {
      if (audio) {
        audio.pause();
        audio.src = "";
      }
      if (source) {
        source.disconnect();
        source = null;
      }
      window.__jam_ended = null;

      audio = new Audio();
      audio.crossOrigin = "anonymous";
      audio.src = url;

      await new Promise((resolve, reject) => {
        const timer = setTimeout(
          () => reject(new Error("media not playable within 30s")),
          30000
        );
        audio.addEventListener("canplaythrough", () => {
          clearTimeout(timer);
          resolve();
        }, { once: true });
        audio.addEventListener("error", () => {
          clearTimeout(timer);
          reject(new Error("media failed to load"));
        }, { once: true });
        audio.load();
      });

      source = ctx.createMediaElementSource(audio);
      source.connect(musicGain);
      audio.onended = () => {
        window.__jam_ended = { token: token };
      };

      if (ctx.state === "suspended") await ctx.resume();
      await audio.play();
      return true;
    },
    stop: () => {
      if (audio) {
        audio.pause();
        audio.currentTime = 0;
      }
      window.__jam_ended = null;
    },
    pause: () => {
      if (audio) audio.pause();
    },
    resume: async () => {
      if (ctx.state === "suspended") await ctx.resume();
      if (audio) await audio.play();
    },
    setMusicVolume: (v) => {
      musicGain.gain.setTargetAtTime(v / 100, ctx.currentTime, 0.01);
    },
    setMicVolume: (v) => {
      micGain.gain.setTargetAtTime(v / 100, ctx.currentTime, 0.01);
    },
    position: () => ({
      current: audio ? audio.currentTime : 0,
      total: audio && isFinite(audio.duration) ? audio.duration : 0,
    }),
  };

  // The conference must capture the graph output, not the real device.
  // Camera video tracks (if any) pass through untouched.
  const realGetUserMedia = navigator.mediaDevices.getUserMedia.bind(
    navigator.mediaDevices
  );
  Object.defineProperty(navigator.mediaDevices, "getUserMedia", {
    value: async (constraints) => {
      if (constraints && constraints.audio) {
        const mixed = new MediaStream(dest.stream.getAudioTracks());
        if (constraints.video) {
          try {
            const cam = await realGetUserMedia({ video: constraints.video });
            cam.getVideoTracks().forEach((t) => mixed.addTrack(t));
          } catch (e) {
            // No camera is fine.
          }
        }
        return mixed;
      }
      return realGetUserMedia(constraints);
    },
  });
})()
"#;

/// One reconciliation poll: drains the pending ended marker (if any) and
/// reports playback position.
const POLL_SCRIPT: &str = r#"
(() => {
  if (!window.__jam) return { ended: null, current: 0, total: 0 };
  const ended = window.__jam_ended;
  window.__jam_ended = null;
  const pos = window.__jam.position();
  return {
    ended: ended ? ended.token : null,
    current: pos.current,
    total: pos.total,
  };
})()
"#;

// ---------------------------------------------------------------------------
// Command side
// ---------------------------------------------------------------------------

/// Thin command facade over the injected graph. One call per command; no
/// state is kept here — the orchestrator owns all playback state and treats
/// the remote side as eventually consistent.
pub struct Bridge<D> {
    driver: Arc<D>,
}

impl<D: SessionDriver> Bridge<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self { driver }
    }

    /// Start playback of a local file URL, tagging the play with a token the
    /// page echoes back when the media ends.
    pub async fn play(&self, url: &str, token: u64) -> driver::Result<()> {
        // Re-issue the graph script first: a page reload since the last play
        // (or a pre-injection join) leaves the window without the graph.
        self.driver.execute(GRAPH_INIT_SCRIPT).await?;

        let url_json = serde_json::to_string(url)
            .map_err(|e| DriverError::Execution(e.to_string()))?;
        let script =
            format!("window.__jam ? window.__jam.play({url_json}, {token}) : false");
        self.driver.execute(&script).await?;
        Ok(())
    }

    pub async fn stop(&self) -> driver::Result<()> {
        self.fire("window.__jam && window.__jam.stop()").await
    }

    pub async fn pause(&self) -> driver::Result<()> {
        self.fire("window.__jam && window.__jam.pause()").await
    }

    pub async fn resume(&self) -> driver::Result<()> {
        self.fire("window.__jam && window.__jam.resume()").await
    }

    pub async fn set_music_volume(&self, value: u8) -> driver::Result<()> {
        self.fire(&format!(
            "window.__jam && window.__jam.setMusicVolume({value})"
        ))
        .await
    }

    pub async fn set_mic_volume(&self, value: u8) -> driver::Result<()> {
        self.fire(&format!(
            "window.__jam && window.__jam.setMicVolume({value})"
        ))
        .await
    }

    async fn fire(&self, script: &str) -> driver::Result<()> {
        self.driver.execute(script).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Poll side
// ---------------------------------------------------------------------------

/// Decoded result of one poll round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSample {
    pub ended: Option<u64>,
    pub current: f64,
    pub total: f64,
}

impl PollSample {
    pub fn from_value(value: &Value) -> Self {
        Self {
            ended: value["ended"].as_u64(),
            current: value["current"].as_f64().unwrap_or(0.0),
            total: value["total"].as_f64().unwrap_or(0.0),
        }
    }
}

/// Poll the session page once per second, translating ended markers and
/// playback position into orchestrator events. Runs until shutdown or until
/// the event channel closes.
pub fn spawn_poll_loop<D: SessionDriver>(
    driver: Arc<D>,
    events: mpsc::Sender<InternalEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        tracing::debug!("[bridge] poll loop stopping");
                        return;
                    }
                    continue;
                }
            }

            let value = match driver.execute(POLL_SCRIPT).await {
                Ok(v) => v,
                Err(DriverError::NotReady) => continue,
                Err(e) => {
                    tracing::debug!("[bridge] poll failed: {e}");
                    continue;
                }
            };
            let sample = PollSample::from_value(&value);

            if let Some(token) = sample.ended {
                if events
                    .send(InternalEvent::Ended { token })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            if sample.total > 0.0 {
                if events
                    .send(InternalEvent::Progress {
                        current: sample.current,
                        total: sample.total,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use serde_json::json;

    #[test]
    fn test_poll_sample_from_value() {
        let sample = PollSample::from_value(&json!({
            "ended": 7, "current": 12.5, "total": 180.0
        }));
        assert_eq!(
            sample,
            PollSample {
                ended: Some(7),
                current: 12.5,
                total: 180.0
            }
        );

        let quiet = PollSample::from_value(&json!({
            "ended": null, "current": 0, "total": 0
        }));
        assert_eq!(quiet.ended, None);
        assert_eq!(quiet.total, 0.0);
    }

    #[test]
    fn test_poll_sample_tolerates_garbage() {
        let sample = PollSample::from_value(&json!("nonsense"));
        assert_eq!(sample.ended, None);
        assert_eq!(sample.current, 0.0);
    }

    #[tokio::test]
    async fn test_play_reinjects_graph_and_passes_token() {
        let driver = Arc::new(MockDriver::new());
        let bridge = Bridge::new(driver.clone());

        bridge.play("http://127.0.0.1:8000/downloads/ab.mp3", 42)
            .await
            .unwrap();

        let scripts = driver.scripts();
        assert_eq!(scripts.len(), 2);
        assert!(scripts[0].contains("__jam_injected"));
        assert!(scripts[1].contains(r#"play("http://127.0.0.1:8000/downloads/ab.mp3", 42)"#));
    }

    #[tokio::test]
    async fn test_volume_commands_scale_to_unit_range_in_page() {
        let driver = Arc::new(MockDriver::new());
        let bridge = Bridge::new(driver.clone());

        bridge.set_music_volume(35).await.unwrap();
        bridge.set_mic_volume(90).await.unwrap();

        let scripts = driver.scripts();
        assert!(scripts[0].contains("setMusicVolume(35)"));
        assert!(scripts[1].contains("setMicVolume(90)"));
    }
}
