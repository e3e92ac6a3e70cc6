//! Background polling of the gauge.
//!
//! The gauge lives behind an async mutex shared with the property readers;
//! [`poll`] refreshes its snapshot on a fixed cadence so change
//! notification keeps working even when nobody asks for properties. A
//! [`PollController`] lets the host force an immediate poll (e.g. when
//! external power comes or goes) and tear the loop down cleanly.

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use embedded_hal_async::delay::DelayNs;

use crate::transport::Bus;
use crate::{Bq27x00, Platform};

/// Default time between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(360);

/// Handle for nudging and stopping a running [`poll`] loop.
pub struct PollController<M: RawMutex> {
    wake: Signal<M, ()>,
    stop: Signal<M, ()>,
    stopped: Signal<M, ()>,
}

impl<M: RawMutex> PollController<M> {
    pub const fn new() -> Self {
        Self {
            wake: Signal::new(),
            stop: Signal::new(),
            stopped: Signal::new(),
        }
    }

    /// Requests an immediate poll, cutting the current interval short.
    pub fn request_poll(&self) {
        self.wake.signal(());
    }

    /// Stops the loop and waits until it has wound down. The gauge mutex
    /// is free once this returns.
    pub async fn stop(&self) {
        self.stop.signal(());
        self.stopped.wait().await;
    }
}

impl<M: RawMutex> Default for PollController<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls the gauge every `interval` until [`PollController::stop`] is
/// called. An interval of zero disables the timer; the loop then only runs
/// when poked through [`PollController::request_poll`].
pub async fn poll<M, GM, B, D, P>(
    gauge: &Mutex<GM, Bq27x00<B, D, P>>,
    control: &PollController<M>,
    interval: Duration,
) where
    M: RawMutex,
    GM: RawMutex,
    B: Bus,
    D: DelayNs,
    P: Platform,
{
    loop {
        gauge.lock().await.refresh().await;

        let idle = async {
            if interval.as_ticks() == 0 {
                control.wake.wait().await;
            } else {
                select(Timer::after(interval), control.wake.wait()).await;
            }
        };

        if let Either::Second(()) = select(idle, control.stop.wait()).await {
            break;
        }
    }

    control.stopped.signal(());
}
