//! Periodic telemetry polling
//! Reads LED, temperature, battery and RFID characteristics on fixed
//! intervals. Read failures are logged and polling carries on.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::{MissedTickBehavior, interval};

use crate::config::SessionConfig;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::peripheral::PeripheralHandle;
use crate::core::bluetooth::subscription::{Subscription, SubscriptionKind};
use crate::core::bluetooth::types::BatteryStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryUpdate {
    LedVoltage(i16),
    LedCurrent(i16),
    Temperature(i32),
    Battery(BatteryStatus),
    RfidEnabled(bool),
    RfidPairedTagId(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub led: Duration,
    pub temperature: Duration,
    pub battery: Duration,
    pub rfid: Duration,
}

impl From<&SessionConfig> for PollIntervals {
    fn from(config: &SessionConfig) -> Self {
        Self {
            led: Duration::from_millis(config.led_poll_interval_ms),
            temperature: Duration::from_millis(config.temperature_poll_interval_ms),
            battery: Duration::from_millis(config.battery_poll_interval_ms),
            rfid: Duration::from_millis(config.rfid_poll_interval_ms),
        }
    }
}

fn log_read_error(field: &str, e: &BleError) {
    if e.is_feature_unsupported() {
        debug!("{} not supported by this device: {}", field, e);
    } else {
        warn!("Error in reading {}: {}", field, e);
    }
}

/// Starts polling `handle`. Every interval fires once immediately.
pub fn start_telemetry_polling(
    handle: PeripheralHandle,
    intervals: PollIntervals,
    on_update: impl Fn(TelemetryUpdate) + Send + Sync + 'static,
) -> Subscription {
    let subscription = Subscription::new(SubscriptionKind::Polling);
    handle.track(&subscription);
    let token = subscription.token();

    tokio::spawn(async move {
        let mut led_tick = interval(intervals.led);
        let mut temperature_tick = interval(intervals.temperature);
        let mut battery_tick = interval(intervals.battery);
        let mut rfid_tick = interval(intervals.rfid);
        for tick in [&mut led_tick, &mut temperature_tick, &mut battery_tick, &mut rfid_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        info!("Telemetry polling of {} started", handle.address());

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = led_tick.tick() => {
                    if !handle.is_connected() { continue; }
                    match handle.read_led_voltage().await {
                        Ok(mv) => on_update(TelemetryUpdate::LedVoltage(mv)),
                        Err(e) => log_read_error("VLED", &e),
                    }
                    match handle.read_led_current().await {
                        Ok(ma) => on_update(TelemetryUpdate::LedCurrent(ma)),
                        Err(e) => log_read_error("ISNS", &e),
                    }
                }
                _ = temperature_tick.tick() => {
                    if !handle.is_connected() { continue; }
                    match handle.read_temperature().await {
                        Ok(t) => on_update(TelemetryUpdate::Temperature(t)),
                        Err(e) => log_read_error("temperature", &e),
                    }
                }
                _ = battery_tick.tick() => {
                    if !handle.is_connected() { continue; }
                    match handle.read_battery().await {
                        Ok(status) => on_update(TelemetryUpdate::Battery(status)),
                        Err(e) => log_read_error("battery level", &e),
                    }
                }
                _ = rfid_tick.tick() => {
                    if !handle.is_connected() { continue; }
                    match handle.read_rfid_enabled().await {
                        Ok(enabled) => on_update(TelemetryUpdate::RfidEnabled(enabled)),
                        Err(e) => log_read_error("RFID enabled", &e),
                    }
                    match handle.read_rfid_paired_tag_id().await {
                        Ok(tag) => on_update(TelemetryUpdate::RfidPairedTagId(tag)),
                        Err(e) => log_read_error("RFID paired tag id", &e),
                    }
                }
            }
        }
        info!("Telemetry polling of {} stopped", handle.address());
    });

    subscription
}
