//! Conversion between normalized and domain parameter values.
//!
//! The engine's canonical representation is the unit interval. Domain values
//! (dB, Hz, ...) only exist at the UI boundary and are never stored.

use sushi_console_types::Parameter;

/// Map a normalized value onto `[min, max]`.
pub fn normalized_to_domain(normalized: f64, min: f64, max: f64) -> f64 {
    min + normalized * (max - min)
}

/// Map a domain value back onto the unit interval.
///
/// A degenerate range (`max == min`) maps everything to 0.
pub fn domain_to_normalized(domain: f64, min: f64, max: f64) -> f64 {
    if max == min {
        return 0.0;
    }
    (domain - min) / (max - min)
}

/// Clamp an inbound value into `[0, 1]`. Non-finite input maps to 0.
pub fn clamp_normalized(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl DomainExt for Parameter {
    fn domain_value(&self) -> f64 {
        normalized_to_domain(self.value, self.min_domain, self.max_domain)
    }

    fn normalize(&self, domain: f64) -> f64 {
        domain_to_normalized(domain, self.min_domain, self.max_domain)
    }
}

/// Domain-value view of a stored parameter.
pub trait DomainExt {
    /// Current value in the parameter's domain.
    fn domain_value(&self) -> f64;
    /// Normalize a domain value using this parameter's range.
    fn normalize(&self, domain: f64) -> f64;
}
