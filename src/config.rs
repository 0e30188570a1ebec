//! Compile-time configuration for the music buzzer.
//!
//! Pin numbers follow the left-edge header of the ESP32-S3 38-pin devkit:
//! five passive piezos on GPIO 4..8 and the stop button module on GPIO 15
//! (active LOW, internal pullup).

/// Number of buzzer players / software-PWM channels.
pub const NUM_BUZZERS: usize = 5;

/// Buzzer GPIO numbers, player index order. All must be < 32 so a single
/// `GPIO_OUT_W1TS`/`W1TC` word covers every pin mask.
pub const BUZZER_PINS: [u8; NUM_BUZZERS] = [4, 5, 6, 7, 8];

/// Stop button GPIO (active LOW, pullup).
pub const PIN_STOP_BTN: u8 = 15;

/// HTTP + WebSocket port.
pub const SERVER_PORT: u16 = 80;

/// Silence between synchronized loop iterations of a song.
pub const MELODY_LOOP_PAUSE_MS: u32 = 400;

/// Guard window after entering PLAYING before auto-stop may fire.
pub const STATE_SETTLE_MS: u32 = 200;

/// Wi-Fi reconnect check cadence.
pub const WIFI_CHECK_INTERVAL_MS: u32 = 10_000;

/// Scratch note buffer bound; parsers stop emitting at this count.
pub const MAX_NOTES_PER_SONG: usize = 256;

/// Upper bound on tracks per song (and per MML definition).
pub const MAX_TRACKS: usize = 4;

/// Longest accepted raw song text, in bytes.
pub const SONG_TEXT_MAX: usize = 6144;

/// Startup volume percent.
pub const DEFAULT_VOLUME: u8 = 70;

/// Software PWM sample rate driven by the timer ISR.
pub const SAMPLE_RATE_HZ: u32 = 40_000;

/// Mono-song octave spread: (buzzer index, octave shift). Channels that
/// would share a PWM timer on the target must appear here with identical
/// shifts; with one software channel per pin the table is unconstrained.
pub const MONO_OCTAVE_SHIFTS: [(usize, i8); 3] = [(0, 0), (1, 1), (2, -1)];

/// Frequency clamp applied after octave shifting, in Hz.
pub const FREQ_MIN_HZ: u16 = 65;
pub const FREQ_MAX_HZ: u16 = 4000;

/// Model file on the SPIFFS `storage` partition.
pub const MODEL_PATH: &str = "/spiffs/model.bin";

/// Token budget for one generation run.
pub const GEN_MAX_TOKENS: usize = 900;

/// Free PSRAM floor required before starting a generation.
pub const GEN_MIN_FREE_PSRAM: usize = 512 * 1024;

/// Temperature bounds and default for the `gen:temp:` command.
pub const GEN_TEMP_MIN: f32 = 0.1;
pub const GEN_TEMP_MAX: f32 = 1.5;
pub const GEN_TEMP_DEFAULT: f32 = 0.9;

/// Generation worker stack size. The forward pass itself heap-allocates its
/// scratch, so this only has to cover call depth and formatting.
pub const GEN_TASK_STACK: usize = 24 * 1024;

/// Capacity of the worker → main broadcast-string queue.
pub const GEN_MSG_QUEUE: usize = 32;
