/*!
Audible call feedback: ring tones while an invite is pending.
*/

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Tone {
    /// Played on the callee while an invite rings.
    Incoming,
    /// Played on the caller while waiting for the callee.
    Ringback,
}

pub trait TonePlayer: Send + Sync {
    fn play(&self, tone: Tone);

    fn silence(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogTonePlayer;

impl TonePlayer for LogTonePlayer {
    fn play(&self, tone: Tone) {
        info!("playing {tone:?} tone");
    }

    fn silence(&self) {
        info!("tone stopped");
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ToneAction {
    Play(Tone),
    Silence,
}

/// Remembers every call made to it.
#[derive(Debug, Default)]
pub struct RecordingTonePlayer {
    actions: Mutex<Vec<ToneAction>>,
}

impl RecordingTonePlayer {
    #[must_use]
    pub fn actions(&self) -> Vec<ToneAction> {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, action: ToneAction) {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action);
    }
}

impl TonePlayer for RecordingTonePlayer {
    fn play(&self, tone: Tone) {
        self.record(ToneAction::Play(tone));
    }

    fn silence(&self) {
        self.record(ToneAction::Silence);
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RingerState {
    Idle,
    Playing(Tone),
    Disposed,
}

/// Single tone output with an explicit lifecycle.
pub struct Ringer {
    player: Arc<dyn TonePlayer>,
    state: RingerState,
}

impl Ringer {
    #[must_use]
    pub fn new(player: Arc<dyn TonePlayer>) -> Self {
        Self {
            player,
            state: RingerState::Idle,
        }
    }

    #[must_use]
    pub const fn state(&self) -> RingerState {
        self.state
    }

    /// Starts `tone`, replacing whatever was playing. Refused once disposed.
    pub fn start(&mut self, tone: Tone) -> bool {
        match self.state {
            RingerState::Disposed => {
                debug!("ringer disposed, not playing {tone:?}");
                false
            }
            RingerState::Playing(current) if current == tone => true,
            RingerState::Playing(_) | RingerState::Idle => {
                self.player.play(tone);
                self.state = RingerState::Playing(tone);
                true
            }
        }
    }

    pub fn stop(&mut self) {
        if let RingerState::Playing(_) = self.state {
            self.player.silence();
            self.state = RingerState::Idle;
        }
    }

    pub fn dispose(&mut self) {
        self.stop();
        self.state = RingerState::Disposed;
    }
}
