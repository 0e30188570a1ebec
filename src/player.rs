//! Millisecond note scheduler and track assignment.
//!
//! Each buzzer has a `MelodyPlayer` polled from the main loop. A note of
//! duration D splits into a tone window and a trailing articulation gap
//! (`D/10`, at least 20 ms, suppressed when it would swallow the note).
//! Advancing accumulates `note_started_at += D` in absolute time so long
//! songs do not drift. Players that run past their last note park in a loop
//! pause; the whole group restarts together, never individually.

use std::sync::Arc;

use crate::catalog::SongEntry;
use crate::config::{FREQ_MAX_HZ, FREQ_MIN_HZ, MELODY_LOOP_PAUSE_MS, MONO_OCTAVE_SHIFTS};
use crate::notes::Note;

/// Hardware seam between the scheduler and the PWM engine. The real
/// implementation drives the 40 kHz ISR state; tests substitute a recorder.
pub trait AudioBackend {
    /// Enable the sample timer and drive the buzzer pins.
    fn start(&mut self);
    /// Disable the sample timer and float every buzzer pin.
    fn stop(&mut self);
    /// Begin a tone: program the channel frequency, reset its phase for a
    /// clean attack, and set the duty.
    fn set_tone(&mut self, channel: usize, freq_hz: u16, duty: u16);
    /// Change duty only (no phase reset, no frequency change).
    fn set_duty(&mut self, channel: usize, duty: u16);
    /// Stop a channel's output entirely.
    fn silence(&mut self, channel: usize);
}

/// PWM duty for a volume percent. Full volume is a 50% square (256 of 512),
/// the loudest drive for a passive piezo.
pub fn volume_duty(percent: u8) -> u16 {
    (u32::from(percent.min(100)) * 256 / 100) as u16
}

/// Octave-shift a frequency then clamp into the buzzers' usable band.
fn shifted_freq(freq_hz: u16, shift: i8) -> u16 {
    let f = u32::from(freq_hz);
    let f = if shift >= 0 { f << shift } else { f >> -shift };
    f.clamp(u32::from(FREQ_MIN_HZ), u32::from(FREQ_MAX_HZ)) as u16
}

/// Articulation gap for a note of duration `d`: `d/10` clamped up to 20 ms,
/// suppressed entirely when that would reach the whole note.
fn gap_for(d: u16) -> u16 {
    let gap = (d / 10).max(20);
    if gap >= d {
        0
    } else {
        gap
    }
}

pub struct MelodyPlayer {
    channel: usize,
    track: Option<Arc<[Note]>>,
    octave_shift: i8,
    note_index: usize,
    note_started_at: u32,
    gap_duration: u16,
    playing: bool,
    in_gap: bool,
    in_loop_pause: bool,
}

impl MelodyPlayer {
    pub fn new(channel: usize) -> Self {
        Self {
            channel,
            track: None,
            octave_shift: 0,
            note_index: 0,
            note_started_at: 0,
            gap_duration: 0,
            playing: false,
            in_gap: false,
            in_loop_pause: false,
        }
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn in_loop_pause(&self) -> bool {
        self.in_loop_pause
    }

    pub fn note_index(&self) -> usize {
        self.note_index
    }

    pub fn note_started_at(&self) -> u32 {
        self.note_started_at
    }

    /// Whether the channel is currently sounding a tone (for live volume
    /// changes).
    pub fn in_tone(&self) -> bool {
        self.playing
            && !self.in_gap
            && !self.in_loop_pause
            && self
                .current_note()
                .map(|n| !n.is_rest())
                .unwrap_or(false)
    }

    fn current_note(&self) -> Option<Note> {
        let track = self.track.as_ref()?;
        track.get(self.note_index).copied()
    }

    /// Detach from any track and stop output on this channel.
    pub fn stop(&mut self, audio: &mut dyn AudioBackend) {
        self.playing = false;
        self.track = None;
        self.note_index = 0;
        self.in_gap = false;
        self.in_loop_pause = false;
        audio.silence(self.channel);
    }

    /// Begin playing `track` from its first note at `now`.
    fn start(
        &mut self,
        track: Arc<[Note]>,
        octave_shift: i8,
        now: u32,
        duty: u16,
        audio: &mut dyn AudioBackend,
    ) {
        self.track = Some(track);
        self.octave_shift = octave_shift;
        self.playing = true;
        self.restart(now, duty, audio);
    }

    /// Rewind to note 0 at `now`. Used for the initial start and every
    /// synchronized loop restart.
    fn restart(&mut self, now: u32, duty: u16, audio: &mut dyn AudioBackend) {
        self.note_index = 0;
        self.note_started_at = now;
        self.in_gap = false;
        self.in_loop_pause = false;
        self.setup_note(duty, audio);
    }

    /// Program the PWM channel for the note at `note_index`.
    fn setup_note(&mut self, duty: u16, audio: &mut dyn AudioBackend) {
        let Some(note) = self.current_note() else {
            return;
        };
        if note.is_rest() {
            self.gap_duration = 0;
            audio.silence(self.channel);
        } else {
            self.gap_duration = gap_for(note.duration_ms);
            let freq = shifted_freq(note.freq_hz, self.octave_shift);
            audio.set_tone(self.channel, freq, duty);
        }
    }

    /// Advance this player's schedule to `now`.
    pub fn tick(&mut self, now: u32, duty: u16, audio: &mut dyn AudioBackend) {
        if !self.playing || self.in_loop_pause {
            return;
        }
        let Some(note) = self.current_note() else {
            return;
        };

        let duration = u32::from(note.duration_ms);
        let elapsed = now.wrapping_sub(self.note_started_at);

        if elapsed >= duration {
            // Accumulate in absolute time so rounding never drifts between
            // tracks.
            self.note_started_at = self.note_started_at.wrapping_add(duration);
            self.note_index += 1;
            self.in_gap = false;
            if self.note_index >= self.track.as_ref().map_or(0, |t| t.len()) {
                self.in_loop_pause = true;
                audio.silence(self.channel);
            } else {
                self.setup_note(duty, audio);
            }
            return;
        }

        if !self.in_gap && self.gap_duration > 0 {
            let tone_duration = duration - u32::from(self.gap_duration);
            if elapsed >= tone_duration {
                self.in_gap = true;
                audio.set_duty(self.channel, 0);
            }
        }
    }
}

/// True when any player is mid-song.
pub fn any_active(players: &[MelodyPlayer]) -> bool {
    players.iter().any(|p| p.playing)
}

/// Stop every player and release their track references.
pub fn stop_all(players: &mut [MelodyPlayer], audio: &mut dyn AudioBackend) {
    for p in players.iter_mut() {
        p.stop(audio);
    }
}

/// Distribute a parsed song across the buzzers and start all chosen players
/// with an identical `note_started_at`.
///
/// One non-empty track octave-spreads over the static mono table; two or
/// more map to buzzers in track order at natural pitch. Returns the number
/// of players started.
pub fn assign_tracks(
    players: &mut [MelodyPlayer],
    song: &SongEntry,
    now: u32,
    duty: u16,
    audio: &mut dyn AudioBackend,
) -> usize {
    stop_all(players, audio);

    let tracks: Vec<&Arc<[Note]>> = song.active_tracks().collect();
    match tracks.len() {
        0 => 0,
        1 => {
            let track = tracks[0];
            let mut started = 0;
            for &(buzzer, shift) in MONO_OCTAVE_SHIFTS.iter() {
                if let Some(p) = players.get_mut(buzzer) {
                    p.start(track.clone(), shift, now, duty, audio);
                    started += 1;
                }
            }
            started
        }
        _ => {
            let mut started = 0;
            for (p, track) in players.iter_mut().zip(tracks) {
                p.start(track.clone(), 0, now, duty, audio);
                started += 1;
            }
            started
        }
    }
}

/// Restart the whole group when every active player has parked in loop
/// pause for at least `MELODY_LOOP_PAUSE_MS`. Returns true on restart.
pub fn try_loop_restart(
    players: &mut [MelodyPlayer],
    now: u32,
    duty: u16,
    audio: &mut dyn AudioBackend,
) -> bool {
    let mut shortest_pause = u32::MAX;
    for p in players.iter().filter(|p| p.playing) {
        if !p.in_loop_pause {
            return false;
        }
        shortest_pause = shortest_pause.min(now.wrapping_sub(p.note_started_at));
    }
    if shortest_pause == u32::MAX || shortest_pause < MELODY_LOOP_PAUSE_MS {
        return false;
    }

    for p in players.iter_mut().filter(|p| p.playing) {
        p.restart(now, duty, audio);
    }
    true
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::NUM_BUZZERS;
    use crate::notes::SongFormat;
    use crate::songs::SongDef;

    /// Records the most recent command per channel.
    #[derive(Default)]
    pub struct MockAudio {
        pub running: bool,
        pub tones: [Option<(u16, u16)>; NUM_BUZZERS],
        pub start_calls: usize,
        pub stop_calls: usize,
    }

    impl AudioBackend for MockAudio {
        fn start(&mut self) {
            self.running = true;
            self.start_calls += 1;
        }
        fn stop(&mut self) {
            self.running = false;
            self.stop_calls += 1;
        }
        fn set_tone(&mut self, channel: usize, freq_hz: u16, duty: u16) {
            self.tones[channel] = Some((freq_hz, duty));
        }
        fn set_duty(&mut self, channel: usize, duty: u16) {
            if let Some(t) = self.tones[channel].as_mut() {
                t.1 = duty;
            }
        }
        fn silence(&mut self, channel: usize) {
            self.tones[channel] = None;
        }
    }

    pub fn players() -> Vec<MelodyPlayer> {
        (0..NUM_BUZZERS).map(MelodyPlayer::new).collect()
    }

    fn parsed_entry(defs: &'static [SongDef], index: usize) -> Catalog {
        let mut cat = Catalog::new(defs);
        assert!(cat.parse(index));
        cat
    }

    const MONO: &[SongDef] = &[SongDef {
        name: "Mono",
        format: SongFormat::Rtttl,
        text: "Mono:d=4,o=5,b=125:8c5,8e5,8g5,c6",
    }];

    const QUAD: &[SongDef] = &[SongDef {
        name: "Quad",
        format: SongFormat::Mml,
        text: "MML@t120 cdef,t120 efga,t120 gabc,t120 rccc;",
    }];

    #[test]
    fn volume_duty_scale() {
        assert_eq!(volume_duty(100), 256);
        assert_eq!(volume_duty(50), 128);
        assert_eq!(volume_duty(0), 0);
    }

    #[test]
    fn shifted_freq_clamps() {
        assert_eq!(shifted_freq(523, 0), 523);
        assert_eq!(shifted_freq(523, 1), 1046);
        assert_eq!(shifted_freq(523, -1), 261);
        assert_eq!(shifted_freq(3000, 1), 4000);
        assert_eq!(shifted_freq(100, -1), 65);
    }

    #[test]
    fn gap_rules() {
        assert_eq!(gap_for(500), 50);
        assert_eq!(gap_for(300), 30);
        assert_eq!(gap_for(100), 20); // clamped up
        assert_eq!(gap_for(15), 0); // would swallow the note
        assert_eq!(gap_for(20), 0);
        assert_eq!(gap_for(21), 20);
    }

    #[test]
    fn mono_song_spreads_three_octaves() {
        let cat = parsed_entry(MONO, 0);
        let mut players = players();
        let mut audio = MockAudio::default();

        let started = assign_tracks(&mut players, cat.entry(0).unwrap(), 1000, 256, &mut audio);
        assert_eq!(started, 3);

        // Buzzer 0 natural, 1 an octave up, 2 an octave down; rest idle.
        assert_eq!(audio.tones[0], Some((523, 256)));
        assert_eq!(audio.tones[1], Some((1046, 256)));
        assert_eq!(audio.tones[2], Some((261, 256)));
        assert_eq!(audio.tones[3], None);
        assert_eq!(audio.tones[4], None);

        // All started players share a start instant.
        for p in players.iter().filter(|p| p.is_playing()) {
            assert_eq!(p.note_started_at(), 1000);
        }
    }

    #[test]
    fn multi_track_maps_in_order_at_pitch() {
        let cat = parsed_entry(QUAD, 0);
        let mut players = players();
        let mut audio = MockAudio::default();

        let started = assign_tracks(&mut players, cat.entry(0).unwrap(), 0, 200, &mut audio);
        assert_eq!(started, 4);
        assert_eq!(audio.tones[0], Some((261, 200))); // c4
        assert_eq!(audio.tones[1], Some((329, 200))); // e4
        assert_eq!(audio.tones[2], Some((392, 200))); // g4
        assert_eq!(audio.tones[3], None); // track 3 leads with a rest
        assert!(players[3].is_playing());
        assert!(!players[4].is_playing()); // surplus buzzer stays idle
    }

    #[test]
    fn tone_gap_advance_cycle() {
        let cat = parsed_entry(MONO, 0);
        let mut players = players();
        let mut audio = MockAudio::default();
        assign_tracks(&mut players, cat.entry(0).unwrap(), 0, 256, &mut audio);

        let p = &mut players[0];
        // 240 ms note, 24 ms gap → tone until 216 ms.
        p.tick(215, 256, &mut audio);
        assert!(p.in_tone());

        p.tick(216, 256, &mut audio);
        assert!(!p.in_tone());
        assert_eq!(audio.tones[0], Some((523, 0)));

        // Cross into the second note: absolute-time accumulation.
        p.tick(243, 256, &mut audio);
        assert_eq!(p.note_index(), 1);
        assert_eq!(p.note_started_at(), 240);
        assert_eq!(audio.tones[0], Some((659, 256)));
    }

    #[test]
    fn players_stay_aligned_through_a_full_loop() {
        let cat = parsed_entry(QUAD, 0);
        let mut players = players();
        let mut audio = MockAudio::default();
        assign_tracks(&mut players, cat.entry(0).unwrap(), 0, 256, &mut audio);

        // Four 500 ms notes per track; walk in 10 ms steps.
        let mut now = 0;
        while now <= 2040 {
            now += 10;
            for p in players.iter_mut() {
                p.tick(now, 256, &mut audio);
            }
        }
        for p in players.iter().filter(|p| p.is_playing()) {
            assert!(p.in_loop_pause(), "all tracks parked at 2050");
            assert_eq!(p.note_started_at(), 2000);
        }

        // Not yet: pause must last MELODY_LOOP_PAUSE_MS.
        assert!(!try_loop_restart(&mut players, 2050, 256, &mut audio));

        let restart_at = 2000 + MELODY_LOOP_PAUSE_MS;
        assert!(try_loop_restart(&mut players, restart_at, 256, &mut audio));
        for p in players.iter().filter(|p| p.is_playing()) {
            assert_eq!(p.note_index(), 0);
            assert!(!p.in_loop_pause());
            assert_eq!(p.note_started_at(), restart_at);
        }
    }

    #[test]
    fn no_restart_while_any_player_still_sounding() {
        let cat = parsed_entry(QUAD, 0);
        let mut players = players();
        let mut audio = MockAudio::default();
        assign_tracks(&mut players, cat.entry(0).unwrap(), 0, 256, &mut audio);

        // Park only player 0.
        for t in (0..=2010).step_by(10) {
            players[0].tick(t, 256, &mut audio);
        }
        assert!(players[0].in_loop_pause());
        assert!(!try_loop_restart(&mut players, 10_000, 256, &mut audio));
    }

    #[test]
    fn rest_holds_silence_without_gap() {
        let cat = parsed_entry(QUAD, 0);
        let mut players = players();
        let mut audio = MockAudio::default();
        assign_tracks(&mut players, cat.entry(0).unwrap(), 0, 256, &mut audio);

        // Track 3 is r,c,c,c — silent through the whole first 500 ms.
        players[3].tick(499, 256, &mut audio);
        assert_eq!(audio.tones[3], None);
        players[3].tick(500, 256, &mut audio);
        assert_eq!(players[3].note_index(), 1);
        assert!(audio.tones[3].is_some());
    }

    #[test]
    fn stop_releases_track_references() {
        let mut cat = parsed_entry(MONO, 0);
        let mut players = players();
        let mut audio = MockAudio::default();
        assign_tracks(&mut players, cat.entry(0).unwrap(), 0, 256, &mut audio);

        stop_all(&mut players, &mut audio);
        assert!(!any_active(&players));
        assert!(audio.tones.iter().all(|t| t.is_none()));

        // With players detached, eviction leaves no live references.
        let track = cat.entry(0).unwrap().tracks[0].as_ref().unwrap().clone();
        cat.evict(0);
        assert_eq!(Arc::strong_count(&track), 1);
    }
}
