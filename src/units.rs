use std::fmt;
use std::ops::{Div, Mul};
use std::time::Duration;

/// A data rate expressed as bits per second (bps).
///
/// Internally the value is tracked as a floating point number for accuracy in
/// the presence of repeated calculations that can yield decimal values.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Bitrate(f64);

impl Bitrate {
    pub const ZERO: Self = Self::new(0);

    pub const fn new(bps: u64) -> Self {
        Bitrate(bps as f64)
    }

    pub const fn kbps(kbps: u64) -> Self {
        Self::new(kbps * 10_u64.pow(3))
    }

    pub const fn mbps(mbps: u64) -> Self {
        Self::new(mbps * 10_u64.pow(6))
    }

    pub fn as_f64(&self) -> f64 {
        self.0
    }

    pub fn as_u64(&self) -> u64 {
        self.0.ceil() as u64
    }

    /// The rate in kilobits per second, the unit the metric CSV uses.
    pub fn as_kbps_f64(&self) -> f64 {
        self.0 / 1000.0
    }

    pub fn clamp(&self, min: Self, max: Self) -> Self {
        Self(self.0.clamp(min.0, max.0))
    }
}

impl From<u64> for Bitrate {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<f64> for Bitrate {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl Mul<Duration> for Bitrate {
    type Output = DataSize;

    fn mul(self, rhs: Duration) -> Self::Output {
        let bits = self.0 * rhs.as_secs_f64();
        DataSize::bits(bits.round() as u64)
    }
}

impl Mul<f64> for Bitrate {
    type Output = Bitrate;

    fn mul(self, rhs: f64) -> Self::Output {
        Bitrate(self.0 * rhs)
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rate = self.0;
        let log = rate.log10().floor() as u64;

        match log {
            0..=2 => write!(f, "{rate}bit/s"),
            3..=5 => write!(f, "{:.3}kbit/s", rate / 10.0_f64.powf(3.0)),
            6..=8 => write!(f, "{:.3}Mbit/s", rate / 10.0_f64.powf(6.0)),
            _ => write!(f, "{:.3}Gbit/s", rate / 10.0_f64.powf(9.0)),
        }
    }
}

/// An amount of data, tracked in bits since frame budgets are expressed in
/// bits rather than bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DataSize(u64);

impl DataSize {
    pub const ZERO: Self = DataSize::bits(0);

    pub const fn bits(bits: u64) -> DataSize {
        Self(bits)
    }

    pub const fn bytes(bytes: u64) -> DataSize {
        Self(bytes * 8)
    }

    pub fn as_bits_u64(&self) -> u64 {
        self.0
    }

    pub fn as_bits_f64(&self) -> f64 {
        self.0 as f64
    }
}

impl Div<Duration> for DataSize {
    type Output = Bitrate;

    fn div(self, rhs: Duration) -> Self::Output {
        let bps = self.as_bits_f64() / rhs.as_secs_f64();
        bps.into()
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = (self.0 / 8) as f64;
        let log = bytes.log10().floor() as u64;

        match log {
            0..=2 => write!(f, "{bytes}B"),
            3..=5 => write!(f, "{:.3}kB", bytes / 10.0_f64.powf(3.0)),
            _ => write!(f, "{:.3}MB", bytes / 10.0_f64.powf(6.0)),
        }
    }
}
