//! Background generation worker.
//!
//! Spawned per `gen` command onto the second core. All output flows through
//! the app's bounded queues: short status frames on the string queue, the
//! finished MML (ownership moved) on the single-slot result queue. The
//! worker never touches the catalog, the players or the WebSocket server.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use esp_idf_svc::hal::cpu::Core;
use esp_idf_svc::hal::task::thread::ThreadSpawnConfiguration;
use esp_idf_svc::sys;
use log::{info, warn};

use crate::app::App;
use crate::config::{GEN_MAX_TOKENS, GEN_MIN_FREE_PSRAM, GEN_TASK_STACK};
use crate::gpt::GenError;

/// Spawn a generation run. The caller must have won the `generating` flag;
/// the worker clears it on exit.
pub fn spawn(app: Arc<App>, temperature: f32) -> Result<()> {
    ThreadSpawnConfiguration {
        name: Some(b"gen-worker\0"),
        stack_size: GEN_TASK_STACK,
        priority: 5,
        pin_to_core: Some(Core::Core1),
        ..Default::default()
    }
    .set()?;

    let spawned = thread::Builder::new()
        .stack_size(GEN_TASK_STACK)
        .spawn(move || run(app, temperature));

    ThreadSpawnConfiguration::default().set()?;
    spawned?;
    Ok(())
}

fn run(app: Arc<App>, temperature: f32) {
    generate(&app, temperature);
    app.gen.generating.store(false, Ordering::Relaxed);
}

fn generate(app: &Arc<App>, temperature: f32) {
    let free_psram = unsafe { sys::heap_caps_get_free_size(sys::MALLOC_CAP_SPIRAM) };
    if free_psram < GEN_MIN_FREE_PSRAM {
        warn!("generation refused: {free_psram} bytes PSRAM free");
        post(app, "gen:err:low memory".to_string());
        return;
    }

    post(app, "gen:start".to_string());

    let mut model_guard = app.model.lock().unwrap();
    let Some(model) = model_guard.as_mut() else {
        post(app, "gen:err:failed".to_string());
        return;
    };

    let abort = &app.gen.abort;
    let result = model.generate("MML@", GEN_MAX_TOKENS, temperature, abort, |token| {
        // Nothing streams after an abort request.
        if !abort.load(Ordering::Relaxed) {
            post(app, format!("gen:t:{token}"));
        }
    });

    match result {
        Ok(mml) => {
            info!("generated {} bytes of MML", mml.len());
            post(app, format!("gen:done:{mml}"));
            // Ownership of the buffer moves to the main loop; if the slot is
            // somehow still occupied the buffer is simply dropped here.
            if app.result_tx.try_send(mml).is_err() {
                warn!("result queue full, melody dropped");
            }
        }
        Err(GenError::Aborted) => {
            info!("generation aborted");
            post(app, "gen:err:aborted".to_string());
        }
    }
}

/// Enqueue a broadcast frame; on a full queue the frame is dropped.
fn post(app: &Arc<App>, msg: String) {
    let _ = app.gen_tx.try_send(msg);
}
