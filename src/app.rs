//! Process-wide state, owned by one `Arc<App>` passed into every handler.
//!
//! The control mutex serializes the main loop and the HTTP server task; the
//! generation worker never takes it and talks to the main loop only through
//! the two bounded queues created in `main`.

use std::sync::atomic::AtomicBool;
use std::sync::mpsc::SyncSender;
use std::sync::Mutex;
use std::time::Instant;

use crate::control::ControlState;
use crate::gpt::MiniGpt;
use crate::player::AudioBackend;
use crate::web::WsHub;

/// Control state plus the audio backend it drives. Kept under one mutex so
/// a command handler can run a full transition atomically.
pub struct Shared {
    pub control: ControlState,
    pub audio: Box<dyn AudioBackend + Send>,
}

/// Generation lifecycle flags shared across tasks.
#[derive(Default)]
pub struct GenFlags {
    /// Model file present and valid; never set after boot.
    pub loaded: AtomicBool,
    /// A worker is running. Guards the single-worker invariant.
    pub generating: AtomicBool,
    /// `gen:stop` was received; the worker exits at its next step.
    pub abort: AtomicBool,
}

pub struct App {
    pub shared: Mutex<Shared>,
    pub model: Mutex<Option<MiniGpt>>,
    pub gen: GenFlags,
    pub hub: WsHub,
    /// Worker → main: broadcast frames (capacity `GEN_MSG_QUEUE`). Frames
    /// that do not fit are dropped by the producer.
    pub gen_tx: SyncSender<String>,
    /// Worker → main: the finished MML buffer, ownership moved (capacity 1).
    pub result_tx: SyncSender<String>,
    boot: Instant,
}

impl App {
    pub fn new(
        shared: Shared,
        model: Option<MiniGpt>,
        gen_tx: SyncSender<String>,
        result_tx: SyncSender<String>,
    ) -> Self {
        let gen = GenFlags::default();
        gen.loaded
            .store(model.is_some(), std::sync::atomic::Ordering::Relaxed);
        Self {
            shared: Mutex::new(shared),
            model: Mutex::new(model),
            gen,
            hub: WsHub::new(),
            gen_tx,
            result_tx,
            boot: Instant::now(),
        }
    }

    /// Milliseconds since boot; the time base for every scheduler decision.
    pub fn now_ms(&self) -> u32 {
        self.boot.elapsed().as_millis() as u32
    }
}
