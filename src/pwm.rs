//! Software PWM: a 40 kHz timer ISR clocks one phase accumulator per buzzer
//! straight onto the GPIO set/clear registers.
//!
//! The main loop owns `phase_increment` and `duty_on` (word-sized relaxed
//! atomics); the ISR only read-modify-writes `phase` and composes one set
//! mask and one clear mask per tick. It takes no locks, allocates nothing
//! and never logs. The timer runs only while a song is playing; outside
//! playback the buzzer pins float as inputs for true electrical silence.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use esp_idf_svc::hal::timer::{config::Config as TimerConfig, TimerDriver, TIMER00};
use esp_idf_svc::sys;
use log::warn;

use crate::config::{BUZZER_PINS, NUM_BUZZERS, SAMPLE_RATE_HZ};
use crate::player::AudioBackend;

/// GPIO output set/clear registers (ESP32-S3 TRM, GPIO base 0x6000_4000).
/// All buzzer pins are below GPIO32, so one 32-bit word covers them.
const GPIO_OUT_W1TS_REG: *mut u32 = 0x6000_4008 as *mut u32;
const GPIO_OUT_W1TC_REG: *mut u32 = 0x6000_400C as *mut u32;

/// Per-buzzer audio state shared with the timer ISR.
struct PwmChannel {
    phase: AtomicU32,
    phase_increment: AtomicU32,
    /// Duty threshold against the top 9 phase bits, 0..=512.
    duty_on: AtomicU32,
    pin_mask: u32,
}

impl PwmChannel {
    fn new(pin: u8) -> Self {
        assert!(pin < 32, "buzzer pins must live in the low GPIO word");
        Self {
            phase: AtomicU32::new(0),
            phase_increment: AtomicU32::new(0),
            duty_on: AtomicU32::new(0),
            pin_mask: 1u32 << pin,
        }
    }
}

pub struct PwmEngine {
    channels: [PwmChannel; NUM_BUZZERS],
}

impl PwmEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: core::array::from_fn(|i| PwmChannel::new(BUZZER_PINS[i])),
        })
    }

    /// One 40 kHz sample: advance every sounding channel's phase and emit
    /// the two mask writes. Runs in ISR context.
    #[inline]
    pub fn isr_tick(&self) {
        let mut set_mask: u32 = 0;
        let mut clear_mask: u32 = 0;

        for ch in &self.channels {
            let inc = ch.phase_increment.load(Ordering::Relaxed);
            if inc == 0 {
                continue;
            }
            let phase = ch.phase.load(Ordering::Relaxed).wrapping_add(inc);
            ch.phase.store(phase, Ordering::Relaxed);

            // Top 9 bits give the duty position 0..511.
            if phase >> 23 < ch.duty_on.load(Ordering::Relaxed) {
                set_mask |= ch.pin_mask;
            } else {
                clear_mask |= ch.pin_mask;
            }
        }

        unsafe {
            if set_mask != 0 {
                GPIO_OUT_W1TS_REG.write_volatile(set_mask);
            }
            if clear_mask != 0 {
                GPIO_OUT_W1TC_REG.write_volatile(clear_mask);
            }
        }
    }

    /// Program a channel for a fresh tone. The phase reset gives every note
    /// a clean attack; the increment is stored last because it gates the
    /// channel in the ISR.
    fn program_tone(&self, channel: usize, freq_hz: u16, duty: u16) {
        let ch = &self.channels[channel];
        let increment = ((u64::from(freq_hz) << 32) / u64::from(SAMPLE_RATE_HZ)) as u32;
        ch.phase.store(0, Ordering::Relaxed);
        ch.duty_on.store(u32::from(duty), Ordering::Relaxed);
        ch.phase_increment.store(increment, Ordering::Relaxed);
    }

    fn set_duty(&self, channel: usize, duty: u16) {
        self.channels[channel].duty_on.store(u32::from(duty), Ordering::Relaxed);
    }

    /// Mute a channel and pull its pin low (the ISR skips idle channels, so
    /// the level must be cleared here).
    fn mute(&self, channel: usize) {
        let ch = &self.channels[channel];
        ch.phase_increment.store(0, Ordering::Relaxed);
        ch.duty_on.store(0, Ordering::Relaxed);
        unsafe { GPIO_OUT_W1TC_REG.write_volatile(ch.pin_mask) };
    }

    fn mute_all(&self) {
        for i in 0..NUM_BUZZERS {
            self.mute(i);
        }
    }
}

/// The real audio backend: the shared engine plus the hardware timer and
/// pin-direction control.
pub struct AudioOut {
    engine: Arc<PwmEngine>,
    timer: TimerDriver<'static>,
}

impl AudioOut {
    /// Claim the timer, hook the ISR, and float every buzzer pin.
    pub fn new(timer: TIMER00, engine: Arc<PwmEngine>) -> Result<Self> {
        let mut driver = TimerDriver::new(timer, &TimerConfig::new())?;
        driver.set_alarm(driver.tick_hz() / u64::from(SAMPLE_RATE_HZ))?;
        driver.set_auto_reload(true)?;

        let isr_engine = engine.clone();
        unsafe {
            driver.subscribe(move || isr_engine.isr_tick())?;
        }

        for &pin in &BUZZER_PINS {
            unsafe {
                sys::esp!(sys::gpio_reset_pin(pin as i32))?;
                sys::esp!(sys::gpio_set_direction(
                    pin as i32,
                    sys::gpio_mode_t_GPIO_MODE_INPUT
                ))?;
            }
        }

        Ok(Self { engine, timer: driver })
    }

    fn set_pin_directions(&self, mode: sys::gpio_mode_t) {
        for &pin in &BUZZER_PINS {
            if let Err(e) = unsafe { sys::esp!(sys::gpio_set_direction(pin as i32, mode)) } {
                warn!("gpio_set_direction({pin}): {e}");
            }
        }
    }
}

impl AudioBackend for AudioOut {
    fn start(&mut self) {
        // Channels keep whatever tones were just programmed; only the pins
        // and the sample clock change state here.
        self.set_pin_directions(sys::gpio_mode_t_GPIO_MODE_OUTPUT);
        let armed = self
            .timer
            .set_counter(0)
            .and_then(|_| self.timer.enable_interrupt())
            .and_then(|_| self.timer.enable_alarm(true))
            .and_then(|_| self.timer.enable(true));
        if let Err(e) = armed {
            warn!("audio timer start failed: {e}");
        }
    }

    fn stop(&mut self) {
        if let Err(e) = self.timer.enable(false) {
            warn!("audio timer stop failed: {e}");
        }
        self.engine.mute_all();
        self.set_pin_directions(sys::gpio_mode_t_GPIO_MODE_INPUT);
    }

    fn set_tone(&mut self, channel: usize, freq_hz: u16, duty: u16) {
        self.engine.program_tone(channel, freq_hz, duty);
    }

    fn set_duty(&mut self, channel: usize, duty: u16) {
        self.engine.set_duty(channel, duty);
    }

    fn silence(&mut self, channel: usize) {
        self.engine.mute(channel);
    }
}
