use tandem_proto::{PlayingState, StatusReport};
use tokio::time::Instant;

/// Authoritative playback timer for the loaded media.
///
/// The position is derived from wall-clock arithmetic only: while playing it
/// is `base_position + (now - base_timestamp)`, otherwise `base_position`,
/// clamped to `0..=duration`. Nothing has to poll it to keep it correct.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    state: PlayingState,
    base_position: i64,
    base_timestamp: Option<Instant>,
    duration: i64,
}

impl PlaybackClock {
    pub fn new(duration: i64) -> Self {
        Self {
            state: PlayingState::Stopped,
            base_position: 0,
            base_timestamp: None,
            duration: duration.max(0),
        }
    }

    pub fn state(&self) -> PlayingState {
        self.state
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn clamp(&self, position: i64) -> i64 {
        position.clamp(0, self.duration)
    }

    pub fn position(&self) -> i64 {
        self.position_at(Instant::now())
    }

    pub fn position_at(&self, now: Instant) -> i64 {
        let raw = match (self.state, self.base_timestamp) {
            (PlayingState::Playing, Some(since)) => {
                self.base_position + now.saturating_duration_since(since).as_millis() as i64
            }
            _ => self.base_position,
        };
        self.clamp(raw)
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::now(self.state, self.position())
    }

    /// Start playing at `position`. Returns false if already playing.
    pub fn play(&mut self, position: i64) -> bool {
        if self.state == PlayingState::Playing {
            return false;
        }
        self.base_position = self.clamp(position);
        self.base_timestamp = Some(Instant::now());
        self.state = PlayingState::Playing;
        true
    }

    /// Freeze at `position`. Returns false if already paused.
    pub fn pause(&mut self, position: i64) -> bool {
        if self.state == PlayingState::Paused {
            return false;
        }
        self.base_position = self.clamp(position);
        self.base_timestamp = None;
        self.state = PlayingState::Paused;
        true
    }

    /// Move to `position` without touching the play state.
    pub fn seek(&mut self, position: i64) {
        self.base_position = self.clamp(position);
        if self.state == PlayingState::Playing {
            self.base_timestamp = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        self.state = PlayingState::Stopped;
        self.base_position = 0;
        self.base_timestamp = None;
    }

    /// Stop the clock once it has run to the end. True only on the transition.
    pub fn check_eof(&mut self) -> bool {
        if self.state == PlayingState::Stopped || self.position() < self.duration {
            return false;
        }
        self.stop();
        true
    }
}
