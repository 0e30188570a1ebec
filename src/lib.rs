//! Wi-Fi multi-buzzer music box.
//!
//! Five passive piezos driven by a 40 kHz software-PWM ISR, a catalog of
//! RTTTL and multi-track MML songs parsed lazily out of flash, a WebSocket
//! control surface, and an on-device INT8 transformer that generates new
//! melodies as MML. See `main.rs` for the boot sequence and main loop.

pub mod app;
pub mod button;
pub mod catalog;
pub mod config;
pub mod control;
pub mod gpt;
pub mod mml;
pub mod notes;
pub mod player;
pub mod pwm;
pub mod rtttl;
pub mod songs;
pub mod web;
pub mod worker;
