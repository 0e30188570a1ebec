//! Playback state machine and control-command grammar.
//!
//! One `ControlState` owns the catalog, the per-buzzer players, the volume
//! and the generation temperature. Every mutation path — WebSocket command,
//! stop button, generation result, main-loop tick — funnels through here.
//! Methods return the frames to broadcast so the transport stays out of the
//! state logic.

use log::{info, warn};

use crate::catalog::Catalog;
use crate::config::{
    DEFAULT_VOLUME, GEN_TEMP_DEFAULT, GEN_TEMP_MAX, GEN_TEMP_MIN, NUM_BUZZERS, STATE_SETTLE_MS,
};
use crate::player::{
    any_active, assign_tracks, stop_all, try_loop_restart, volume_duty, AudioBackend, MelodyPlayer,
};
use crate::songs::SongDef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Playing,
}

/// A parsed WebSocket text frame. Anything else is dropped silently.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Play(usize),
    Stop,
    Volume(u8),
    Gen,
    GenTemp(f32),
    GenStop,
}

impl Command {
    /// Parse one frame of the control grammar.
    pub fn parse(frame: &str) -> Option<Self> {
        if let Some(idx) = frame.strip_prefix("play:") {
            return idx.parse().ok().map(Command::Play);
        }
        if frame == "stop" {
            return Some(Command::Stop);
        }
        if let Some(v) = frame.strip_prefix("vol:") {
            return v.parse().ok().filter(|v| *v <= 100).map(Command::Volume);
        }
        if frame == "gen" {
            return Some(Command::Gen);
        }
        if let Some(t) = frame.strip_prefix("gen:temp:") {
            return t
                .parse()
                .ok()
                .filter(|t: &f32| (GEN_TEMP_MIN..=GEN_TEMP_MAX).contains(t))
                .map(Command::GenTemp);
        }
        if frame == "gen:stop" {
            return Some(Command::GenStop);
        }
        None
    }
}

pub struct ControlState {
    state: PlayerState,
    entered_at: u32,
    current_song: Option<usize>,
    volume: u8,
    temperature: f32,
    players: Vec<MelodyPlayer>,
    pub catalog: Catalog,
}

impl ControlState {
    pub fn new(defs: &[SongDef]) -> Self {
        Self {
            state: PlayerState::Idle,
            entered_at: 0,
            current_song: None,
            volume: DEFAULT_VOLUME,
            temperature: GEN_TEMP_DEFAULT,
            players: (0..NUM_BUZZERS).map(MelodyPlayer::new).collect(),
            catalog: Catalog::new(defs),
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn set_temperature(&mut self, temp: f32) {
        self.temperature = temp.clamp(GEN_TEMP_MIN, GEN_TEMP_MAX);
    }

    /// Name of the currently playing song, for connect-time status.
    pub fn playing_name(&self) -> Option<&str> {
        match self.state {
            PlayerState::Playing => self
                .current_song
                .and_then(|i| self.catalog.entry(i))
                .map(|e| e.name.as_str()),
            PlayerState::Idle => None,
        }
    }

    /// Start the song at `index`, evicting whatever played before. Also the
    /// PLAYING → PLAYING path for a new `play:` while a song runs.
    /// Returns the frames to broadcast.
    pub fn start_song(
        &mut self,
        index: usize,
        now: u32,
        audio: &mut dyn AudioBackend,
    ) -> Vec<String> {
        if index >= self.catalog.len() {
            return Vec::new();
        }

        // Refresh the settle window first so the auto-stop check cannot fire
        // between the player stop below and the new song's first note.
        self.entered_at = now;

        stop_all(&mut self.players, audio);
        if let Some(prev) = self.current_song {
            if prev != index {
                self.catalog.evict(prev);
            }
        }

        // Parse failures evict but do not transition; if a song was playing,
        // the players are now silent and the auto-stop check reaps the
        // PLAYING state after the settle window.
        if !self.catalog.parse(index) {
            self.catalog.evict(index);
            return Vec::new();
        }

        let duty = volume_duty(self.volume);
        let entry = self.catalog.entry(index).expect("index checked above");
        let started = assign_tracks(&mut self.players, entry, now, duty, audio);
        if started == 0 {
            warn!("song '{}' has no playable tracks", entry.name);
            self.catalog.evict(index);
            return Vec::new();
        }

        self.current_song = Some(index);
        if self.state != PlayerState::Playing {
            self.state = PlayerState::Playing;
            audio.start();
        }
        self.entered_at = now;

        let name = &self.catalog.entry(index).expect("just parsed").name;
        info!("playing '{name}' on {started} buzzers");
        vec![format!("playing:{name}")]
    }

    /// Install a generated MML and start it like any other song.
    pub fn start_generated(
        &mut self,
        mml_text: String,
        now: u32,
        audio: &mut dyn AudioBackend,
    ) -> Vec<String> {
        self.catalog.install_generated(mml_text);
        self.start_song(self.catalog.generated_index(), now, audio)
    }

    /// Stop playback and return to IDLE. Returns the frames to broadcast.
    pub fn enter_idle(&mut self, now: u32, audio: &mut dyn AudioBackend) -> Vec<String> {
        stop_all(&mut self.players, audio);
        audio.stop();
        // The parse stays cached for a replay; eviction happens on the next
        // start_song.
        self.state = PlayerState::Idle;
        self.entered_at = now;
        vec!["stopped".to_string()]
    }

    /// Change the volume, retuning any sounding channels in place.
    pub fn set_volume(&mut self, percent: u8, audio: &mut dyn AudioBackend) -> Vec<String> {
        self.volume = percent.min(100);
        let duty = volume_duty(self.volume);
        for p in self.players.iter().filter(|p| p.in_tone()) {
            audio.set_duty(p.channel(), duty);
        }
        vec![format!("vol:{}", self.volume)]
    }

    /// One main-loop iteration: advance players, run the synchronized loop
    /// restart, and auto-stop when nothing is left playing.
    pub fn tick(&mut self, now: u32, audio: &mut dyn AudioBackend) -> Vec<String> {
        if self.state != PlayerState::Playing {
            return Vec::new();
        }

        let duty = volume_duty(self.volume);
        for p in self.players.iter_mut() {
            p.tick(now, duty, audio);
        }

        if any_active(&self.players) {
            try_loop_restart(&mut self.players, now, duty, audio);
            return Vec::new();
        }

        if now.wrapping_sub(self.entered_at) >= STATE_SETTLE_MS {
            info!("no active players, stopping");
            return self.enter_idle(now, audio);
        }
        Vec::new()
    }

    /// Stop-button edge: a debounced LOW while playing stops the song.
    pub fn button_pressed(&mut self, now: u32, audio: &mut dyn AudioBackend) -> Vec<String> {
        if self.state == PlayerState::Playing {
            info!("stop button pressed");
            return self.enter_idle(now, audio);
        }
        Vec::new()
    }
}
