use std::sync::Mutex;

use anyhow::Context;
use chrono::{Datelike, NaiveDate, Timelike};
use esp_idf_hal::{
    delay::BLOCK,
    gpio::{InputPin, OutputPin},
    i2c::{I2c, I2cConfig, I2cDriver},
    peripheral::Peripheral,
    units::FromValueType,
};
use log::warn;

use lightwave_common::{sentinel, HardwareClock, TimeSource, Timestamp};

const DS3231_ADDR: u8 = 0x68;
const REG_SECONDS: u8 = 0x00;
const REG_STATUS: u8 = 0x0f;
const STATUS_OSF: u8 = 0x80;
const I2C_BAUDRATE_KHZ: u32 = 100;

enum RtcBackend {
    I2c(Mutex<I2cDriver<'static>>),
    Disabled,
}

/// DS3231 battery-backed clock on the I2C bus. Register layout per the
/// datasheet: seconds/minutes/hours/day/date/month/year in BCD starting at
/// 0x00, oscillator-stop flag in the status register.
pub struct Ds3231Clock {
    backend: RtcBackend,
    running: bool,
}

impl Ds3231Clock {
    pub fn new<I, SDA, SCL>(
        i2c: impl Peripheral<P = I> + 'static,
        sda: impl Peripheral<P = SDA> + 'static,
        scl: impl Peripheral<P = SCL> + 'static,
    ) -> anyhow::Result<Self>
    where
        I: I2c,
        SDA: InputPin + OutputPin,
        SCL: InputPin + OutputPin,
    {
        let config = I2cConfig::new().baudrate(I2C_BAUDRATE_KHZ.kHz().into());
        let driver = I2cDriver::new(i2c, sda, scl, &config).context("failed to init RTC I2C bus")?;

        Ok(Self {
            backend: RtcBackend::I2c(Mutex::new(driver)),
            running: false,
        })
    }

    pub fn disabled() -> Self {
        Self {
            backend: RtcBackend::Disabled,
            running: false,
        }
    }

    fn read_registers(&self, start: u8, buffer: &mut [u8]) -> bool {
        let RtcBackend::I2c(driver) = &self.backend else {
            return false;
        };
        let Ok(mut driver) = driver.lock() else {
            return false;
        };
        driver
            .write_read(DS3231_ADDR, &[start], buffer, BLOCK)
            .is_ok()
    }

    fn write_registers(&self, start: u8, payload: &[u8]) -> bool {
        let RtcBackend::I2c(driver) = &self.backend else {
            return false;
        };
        let Ok(mut driver) = driver.lock() else {
            return false;
        };

        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(start);
        frame.extend_from_slice(payload);
        driver.write(DS3231_ADDR, &frame, BLOCK).is_ok()
    }
}

impl TimeSource for Ds3231Clock {
    fn probe(&mut self) -> bool {
        let mut status = [0_u8; 1];
        if !self.read_registers(REG_STATUS, &mut status) {
            warn!("DS3231 not responding on I2C");
            self.running = false;
            return false;
        }

        if status[0] & STATUS_OSF != 0 {
            warn!("DS3231 oscillator was stopped; stored time is stale");
        }

        self.running = true;
        true
    }

    fn read(&self) -> Timestamp {
        if !self.running {
            return sentinel();
        }

        let mut raw = [0_u8; 7];
        if !self.read_registers(REG_SECONDS, &mut raw) {
            return sentinel();
        }

        let second = bcd_to_dec(raw[0] & 0x7f);
        let minute = bcd_to_dec(raw[1] & 0x7f);
        let hour = bcd_to_dec(raw[2] & 0x3f);
        let day = bcd_to_dec(raw[4] & 0x3f);
        let month = bcd_to_dec(raw[5] & 0x1f);
        let year = 2000 + bcd_to_dec(raw[6]) as i32;

        NaiveDate::from_ymd_opt(year, month as u32, day as u32)
            .and_then(|date| date.and_hms_opt(hour as u32, minute as u32, second as u32))
            .unwrap_or_else(sentinel)
    }
}

impl HardwareClock for Ds3231Clock {
    fn adjust(&mut self, now: Timestamp) {
        let payload = [
            dec_to_bcd(now.second() as u8),
            dec_to_bcd(now.minute() as u8),
            dec_to_bcd(now.hour() as u8),
            dec_to_bcd(now.weekday().number_from_monday() as u8),
            dec_to_bcd(now.day() as u8),
            dec_to_bcd(now.month() as u8),
            dec_to_bcd((now.year() - 2000).clamp(0, 99) as u8),
        ];

        if !self.write_registers(REG_SECONDS, &payload) {
            warn!("failed to write DS3231 time registers");
            return;
        }

        // Clear the oscillator-stop flag so the next boot trusts the clock.
        let mut status = [0_u8; 1];
        if self.read_registers(REG_STATUS, &mut status) {
            let _ = self.write_registers(REG_STATUS, &[status[0] & !STATUS_OSF]);
        }
    }
}

fn bcd_to_dec(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0f)
}

fn dec_to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}
