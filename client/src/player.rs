use anyhow::{bail, Result};
use parking_lot::Mutex;
use tandem_proto::PlayingState;
use tokio::time::Instant;

/// Local media player driven by the agent
pub trait Player: Send + Sync + 'static {
    /// Open the media at `source`
    fn load(&self, source: &str) -> Result<()>;
    fn close(&self);
    fn play(&self);
    fn pause(&self);
    /// Jump to `position` (ms) without changing the play state
    fn seek(&self, position: i64);
    fn position(&self) -> i64;
    fn state(&self) -> PlayingState;
    fn is_loaded(&self) -> bool;
}

/// Headless player that only keeps time
#[derive(Default)]
pub struct SimulatedPlayer {
    inner: Mutex<SimulatedState>,
}

#[derive(Default)]
struct SimulatedState {
    source: Option<String>,
    state: PlayingState,
    base_position: i64,
    since: Option<Instant>,
}

impl SimulatedState {
    fn position(&self) -> i64 {
        match (self.state, self.since) {
            (PlayingState::Playing, Some(since)) => {
                self.base_position + since.elapsed().as_millis() as i64
            }
            _ => self.base_position,
        }
    }
}

impl SimulatedPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(&self) -> Option<String> {
        self.inner.lock().source.clone()
    }
}

impl Player for SimulatedPlayer {
    fn load(&self, source: &str) -> Result<()> {
        if source.is_empty() {
            bail!("empty media source");
        }
        let mut inner = self.inner.lock();
        *inner = SimulatedState {
            source: Some(source.to_string()),
            state: PlayingState::Paused,
            ..SimulatedState::default()
        };
        tracing::debug!("Opened {}", source);
        Ok(())
    }

    fn close(&self) {
        *self.inner.lock() = SimulatedState::default();
    }

    fn play(&self) {
        let mut inner = self.inner.lock();
        if inner.source.is_none() || inner.state == PlayingState::Playing {
            return;
        }
        inner.state = PlayingState::Playing;
        inner.since = Some(Instant::now());
    }

    fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.source.is_none() || inner.state != PlayingState::Playing {
            return;
        }
        inner.base_position = inner.position();
        inner.since = None;
        inner.state = PlayingState::Paused;
    }

    fn seek(&self, position: i64) {
        let mut inner = self.inner.lock();
        if inner.source.is_none() {
            return;
        }
        inner.base_position = position.max(0);
        if inner.state == PlayingState::Playing {
            inner.since = Some(Instant::now());
        }
    }

    fn position(&self) -> i64 {
        self.inner.lock().position()
    }

    fn state(&self) -> PlayingState {
        self.inner.lock().state
    }

    fn is_loaded(&self) -> bool {
        self.inner.lock().source.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_simulated_player_keeps_time() {
        let player = SimulatedPlayer::new();
        player.load("http://localhost:3005/media").unwrap();
        assert_eq!(player.state(), PlayingState::Paused);

        player.seek(5_000);
        player.play();
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(player.position(), 6_500);

        player.pause();
        tokio::time::advance(Duration::from_millis(3_000)).await;
        assert_eq!(player.position(), 6_500);
    }

    #[tokio::test]
    async fn test_controls_ignored_without_media() {
        let player = SimulatedPlayer::new();
        player.play();
        player.seek(1_000);
        assert_eq!(player.state(), PlayingState::Stopped);
        assert_eq!(player.position(), 0);
        assert!(player.load("").is_err());
    }

    #[tokio::test]
    async fn test_close_resets() {
        let player = SimulatedPlayer::new();
        player.load("file.mkv").unwrap();
        player.seek(42_000);
        player.close();
        assert!(!player.is_loaded());
        assert_eq!(player.position(), 0);
    }
}
