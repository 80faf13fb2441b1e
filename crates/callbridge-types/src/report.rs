//! The emergency report submitted by the intake form.

use crate::ServiceType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum description length, in characters, after trimming.
pub const MIN_DESCRIPTION_CHARS: usize = 10;

/// Maximum description length, in characters, after trimming.
pub const MAX_DESCRIPTION_CHARS: usize = 280;

/// Maximum manual address length, in characters.
pub const MAX_MANUAL_ADDRESS_CHARS: usize = 500;

fn default_browser_language() -> String {
    "en".to_string()
}

/// A geographic fix reported by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters, when the browser reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl GeoLocation {
    fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A validated-on-intake description of an emergency.
///
/// Immutable once accepted; the server only ever reads it to compose the
/// briefing spoken to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyReport {
    pub service_needed: ServiceType,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_address: Option<String>,
    #[serde(default = "default_browser_language")]
    pub browser_language: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Reasons a report is refused at intake.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("description must be between {min} and {max} characters (got {actual})")]
    DescriptionLength { min: usize, max: usize, actual: usize },

    #[error("either a location or a manual address is required")]
    MissingLocation,

    #[error("location coordinates are out of range")]
    InvalidLocation,

    #[error("manual address must be at most {max} characters")]
    ManualAddressTooLong { max: usize },

    #[error("browser language must not be empty")]
    MissingLanguage,

    #[error("unknown service type: {0}")]
    UnknownService(String),
}

impl EmergencyReport {
    /// Checks the intake invariants.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule as a [`ValidationError`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        let len = self.description.trim().chars().count();
        if !(MIN_DESCRIPTION_CHARS..=MAX_DESCRIPTION_CHARS).contains(&len) {
            return Err(ValidationError::DescriptionLength {
                min: MIN_DESCRIPTION_CHARS,
                max: MAX_DESCRIPTION_CHARS,
                actual: len,
            });
        }

        if let Some(location) = &self.location {
            if !location.is_valid() {
                return Err(ValidationError::InvalidLocation);
            }
        }

        if let Some(address) = &self.manual_address {
            if address.chars().count() > MAX_MANUAL_ADDRESS_CHARS {
                return Err(ValidationError::ManualAddressTooLong {
                    max: MAX_MANUAL_ADDRESS_CHARS,
                });
            }
        }

        if self.location.is_none() && self.address().is_none() {
            return Err(ValidationError::MissingLocation);
        }

        if self.browser_language.trim().is_empty() {
            return Err(ValidationError::MissingLanguage);
        }

        Ok(())
    }

    /// Returns the manual address if it contains anything but whitespace.
    pub fn address(&self) -> Option<&str> {
        self.manual_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }
}
