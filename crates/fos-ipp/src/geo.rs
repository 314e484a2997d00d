//! Geographic hints
//!
//! Every token batch and proxy list response may carry a coarse location.
//! Token and proxy-chain assignment are kept consistent by comparing the
//! canonical geo id derived from these hints.

use serde::{Deserialize, Serialize};

/// Coarse geographic location associated with an issuance batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeoHint {
    /// ISO 3166-1 country code (e.g. "US")
    pub country_code: String,
    /// ISO 3166-2 region (e.g. "US-CA")
    #[serde(default)]
    pub iso_region: String,
    /// City name (e.g. "Mountain View")
    #[serde(default)]
    pub city_name: String,
}

impl GeoHint {
    /// Create a new geo hint
    pub fn new(
        country_code: impl Into<String>,
        iso_region: impl Into<String>,
        city_name: impl Into<String>,
    ) -> Self {
        Self {
            country_code: country_code.into(),
            iso_region: iso_region.into(),
            city_name: city_name.into(),
        }
    }

    /// Hint carrying only a country code
    pub fn country(country_code: impl Into<String>) -> Self {
        Self::new(country_code, "", "")
    }

    /// Check if no location information is present
    pub fn is_empty(&self) -> bool {
        self.country_code.is_empty() && self.iso_region.is_empty() && self.city_name.is_empty()
    }

    /// Canonical geo identifier
    ///
    /// Parts are joined with commas and trailing empty parts are dropped:
    /// `{US, US-CA, Mountain View}` becomes `"US,US-CA,MOUNTAIN VIEW"` and
    /// `{FR, "", ""}` becomes `"FR"`.
    pub fn geo_id(&self) -> String {
        if self.country_code.is_empty() {
            return String::new();
        }

        let mut id = self.country_code.to_uppercase();
        if self.iso_region.is_empty() {
            return id;
        }
        id.push(',');
        id.push_str(&self.iso_region.to_uppercase());

        if !self.city_name.is_empty() {
            id.push(',');
            id.push_str(&self.city_name.to_uppercase());
        }
        id
    }
}

impl std::fmt::Display for GeoHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.geo_id())
    }
}

/// Receiver of geo changes discovered while fetching tokens or proxy lists
pub trait GeoObserver: Send + Sync {
    /// A fetch revealed a geo different from the one previously cached
    fn geo_observed(&self, geo_id: &str);
}
