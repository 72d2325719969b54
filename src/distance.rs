/// Log-distance path loss model mapping RSSI to an estimated distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceEstimator {
    /// Measured power at one unit of distance, in dBm.
    pub reference_power: f64,
    pub path_loss_exponent: f64,
}

impl Default for DistanceEstimator {
    fn default() -> Self {
        DistanceEstimator {
            reference_power: -69.0,
            path_loss_exponent: 2.0,
        }
    }
}

impl DistanceEstimator {
    pub fn new(reference_power: f64, path_loss_exponent: f64) -> Self {
        DistanceEstimator {
            reference_power,
            path_loss_exponent,
        }
    }

    /// Estimated distance rounded to two decimal places.
    pub fn distance(&self, rssi: i16) -> f64 {
        let exponent = (self.reference_power - f64::from(rssi)) / (10.0 * self.path_loss_exponent);
        (10f64.powf(exponent) * 100.0).round() / 100.0
    }
}

/// Renders a distance for the wire, always with a fractional part (`1.0`, `3.16`).
pub fn format_distance(distance: f64) -> String {
    if distance.fract() == 0.0 {
        format!("{distance:.1}")
    } else {
        distance.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_points() {
        let estimator = DistanceEstimator::default();
        assert_eq!(estimator.distance(-69), 1.0);
        assert_eq!(estimator.distance(-89), 10.0);
        assert_eq!(estimator.distance(-79), 3.16);
        assert_eq!(estimator.distance(-59), 0.32);
    }

    #[test]
    fn test_non_increasing_in_rssi() {
        let estimator = DistanceEstimator::default();
        let mut previous = f64::INFINITY;
        for rssi in -127..=20 {
            let d = estimator.distance(rssi);
            assert!(d <= previous, "distance rose at rssi {rssi}");
            previous = d;
        }
    }

    #[test]
    fn test_custom_constants() {
        let estimator = DistanceEstimator::new(-59.0, 3.0);
        assert_eq!(estimator.distance(-59), 1.0);
        assert_eq!(estimator.distance(-89), 10.0);
    }

    #[test]
    fn test_format_distance() {
        assert_eq!(format_distance(1.0), "1.0");
        assert_eq!(format_distance(10.0), "10.0");
        assert_eq!(format_distance(3.16), "3.16");
        assert_eq!(format_distance(0.0), "0.0");
    }
}
