use std::fmt;

const BYTE_UNITS: &[&str] = &["kB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// A byte count shown with the largest decimal unit that keeps the value above 1.
pub struct DisplayBytes {
    unit: Option<&'static str>,
    value: f64,
    padded: bool,
}

impl fmt::Display for DisplayBytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.unit {
            Some(unit) => write!(f, "{:.2} {}", self.value, unit),
            // "B " lines up with the two-letter units
            None if self.padded => write!(f, "{:.0} B ", self.value),
            None => write!(f, "{:.0} B", self.value),
        }
    }
}

impl DisplayBytes {
    fn with_padding(value: u64, padded: bool) -> Self {
        let bytes = value as f64;
        let (value, unit) = BYTE_UNITS
            .iter()
            .enumerate()
            .map(|(i, u)| (bytes / 1000_f64.powi(i as i32 + 1), Some(*u)))
            .take_while(|(x, _)| *x > 1.0)
            .last()
            .unwrap_or((bytes, None));

        Self {
            unit,
            value,
            padded,
        }
    }

    pub fn new(value: u64) -> Self {
        Self::with_padding(value, false)
    }

    pub fn new_padded(value: u64) -> Self {
        Self::with_padding(value, true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn units() {
        assert_eq!(DisplayBytes::new(999).to_string(), "999 B");
        assert_eq!(DisplayBytes::new_padded(999).to_string(), "999 B ");
        assert_eq!(DisplayBytes::new(2_097_152).to_string(), "2.10 MB");
        assert_eq!(DisplayBytes::new(512 * 204_800).to_string(), "104.86 MB");
    }
}
