//! Exponential moving average of a timing quantity.

use core::fmt;

/// Running average, average deviation and deviation ratio of one quantity.
///
/// The deviation ratio is `|avg_dev / avg|`, a unitless measure of how noisy
/// the quantity currently is.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Stat {
    pub avg: f64,
    pub avg_dev: f64,
    pub dev_ratio: f64,
}

impl Stat {
    /// Folds one sample in, weighting it with `alpha`.
    pub fn update(&mut self, sample: f64, alpha: f64) {
        self.avg = alpha * sample + (1.0 - alpha) * self.avg;
        self.avg_dev = alpha * (self.avg - sample).abs() + (1.0 - alpha) * self.avg_dev;
        self.dev_ratio = if self.avg == 0.0 {
            0.0
        } else {
            (self.avg_dev / self.avg).abs()
        };
    }

    /// Human-readable one-line rendering, e.g. for log output.
    #[must_use]
    pub const fn display<'a>(&'a self, name: &'a str, unit: &'a str) -> StatDisplay<'a> {
        StatDisplay {
            stat: self,
            name,
            unit,
        }
    }
}

#[derive(Debug)]
pub struct StatDisplay<'a> {
    stat: &'a Stat,
    name: &'a str,
    unit: &'a str,
}

impl fmt::Display for StatDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<17}: {{ avg = {:5.0}{unit}, avg_dev = {:5.0}{unit}, dev_ratio = {:.2} }}",
            self.name,
            self.stat.avg,
            self.stat.avg_dev,
            self.stat.dev_ratio,
            unit = self.unit,
        )
    }
}
