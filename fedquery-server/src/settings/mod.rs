//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment
//! variables. An example configuration file can be found in the `configs/`
//! directory located in the repository root.

use std::{fmt, path::Path};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
    Serialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use fedquery_core::{
    bloomfilter::{FieldLengths, FieldWeights, DEFAULT_RECORD_FILTER_LENGTH},
    linkage::DEFAULT_POSITIVE_MATCH_THRESHOLD,
    query::DEFAULT_QUERY_PREFIX,
    study::PARTICIPATING_MEDICS_FLOOR,
};

#[derive(Debug, Error)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named
/// settings field.
pub struct Settings {
    #[validate]
    #[serde(default)]
    pub batch: BatchSettings,
    #[validate]
    #[serde(default)]
    pub linkage: LinkageSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation
    /// failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedquery").separator("__"))?;
        config.try_into()
    }
}

/// Batch orchestration settings.
#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_batch"))]
pub struct BatchSettings {
    /// The minimum number of sites that must contribute to a cohort before
    /// its aggregate may be disclosed.
    ///
    /// Must be 3 or larger, as otherwise a site that already knows its own
    /// cohort size can infer another site's exact count by subtraction.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [batch]
    /// min_participating_medics = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDQUERY_BATCH__MIN_PARTICIPATING_MEDICS=3
    /// ```
    pub min_participating_medics: u64,

    /// The minimum number of cohort definitions a study must carry.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [batch]
    /// min_cohort_definitions = 1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDQUERY_BATCH__MIN_COHORT_DEFINITIONS=1
    /// ```
    pub min_cohort_definitions: usize,

    /// The syntactic prefix (case-insensitive) a cohort query must start
    /// with to be accepted for dispatch.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [batch]
    /// query_prefix = "select count"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDQUERY_BATCH__QUERY_PREFIX="select count"
    /// ```
    pub query_prefix: String,

    /// The number of seconds after which result collection proceeds with
    /// whatever arrived. `0` disables the internal deadline; cancellation is
    /// then entirely up to the embedding scheduler.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [batch]
    /// collect_timeout_secs = 0
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDQUERY_BATCH__COLLECT_TIMEOUT_SECS=0
    /// ```
    pub collect_timeout_secs: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            min_participating_medics: PARTICIPATING_MEDICS_FLOOR,
            min_cohort_definitions: 1,
            query_prefix: DEFAULT_QUERY_PREFIX.to_string(),
            collect_timeout_secs: 0,
        }
    }
}

impl BatchSettings {
    fn validate_batch(&self) -> Result<(), ValidationError> {
        // the validate attribute only accepts literals, therefore we check
        // the invariants here
        if self.min_participating_medics < PARTICIPATING_MEDICS_FLOOR {
            return Err(ValidationError::new(
                "min_participating_medics below k-anonymity floor",
            ));
        }
        if self.min_cohort_definitions < 1 {
            return Err(ValidationError::new("min_cohort_definitions below 1"));
        }
        if self.query_prefix.is_empty() {
            return Err(ValidationError::new("empty query_prefix"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_batch(s: &BatchSettings) -> Result<(), ValidationError> {
    s.validate_batch()
}

/// Record-linkage settings.
#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_linkage"))]
pub struct LinkageSettings {
    /// The record Bloom filter length in bits.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [linkage]
    /// record_filter_length = 3000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDQUERY_LINKAGE__RECORD_FILTER_LENGTH=3000
    /// ```
    pub record_filter_length: usize,

    /// The per-field sampling weights of the record Bloom filter.
    #[serde(default)]
    pub field_weights: FieldWeights,

    /// The per-field Bloom filter lengths in bits.
    #[serde(default)]
    pub field_lengths: FieldLengths,

    /// The similarity score above which two records are matched to the same
    /// person. Must lie in `(0, 1]`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [linkage]
    /// match_threshold = 0.8
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDQUERY_LINKAGE__MATCH_THRESHOLD=0.8
    /// ```
    pub match_threshold: f64,
}

impl Default for LinkageSettings {
    fn default() -> Self {
        Self {
            record_filter_length: DEFAULT_RECORD_FILTER_LENGTH,
            field_weights: FieldWeights::default(),
            field_lengths: FieldLengths::default(),
            match_threshold: DEFAULT_POSITIVE_MATCH_THRESHOLD,
        }
    }
}

impl LinkageSettings {
    fn validate_linkage(&self) -> Result<(), ValidationError> {
        if self.record_filter_length == 0 {
            return Err(ValidationError::new("record_filter_length is zero"));
        }
        let lengths = [
            self.field_lengths.first_name,
            self.field_lengths.last_name,
            self.field_lengths.birthday,
            self.field_lengths.sex,
            self.field_lengths.street,
            self.field_lengths.zip_code,
            self.field_lengths.city,
            self.field_lengths.country,
            self.field_lengths.insurance_number,
        ];
        if lengths.iter().any(|&length| length == 0) {
            return Err(ValidationError::new("zero-length field filter"));
        }
        if !(self.match_threshold > 0. && self.match_threshold <= 1.) {
            return Err(ValidationError::new("match_threshold outside (0, 1]"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_linkage(s: &LinkageSettings) -> Result<(), ValidationError> {
    s.validate_linkage()
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about
    /// logging directives can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDQUERY_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loading_the_example_config_works() {
        assert!(Settings::new("../configs/config.toml").is_ok());
    }

    #[test]
    fn test_default_batch_settings_are_valid() {
        assert!(BatchSettings::default().validate().is_ok());
        assert!(LinkageSettings::default().validate().is_ok());
    }

    #[test]
    fn test_k_anonymity_floor_is_enforced() {
        let settings = BatchSettings {
            min_participating_medics: 2,
            ..BatchSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = BatchSettings {
            min_participating_medics: 1,
            ..BatchSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = BatchSettings {
            min_participating_medics: 3,
            ..BatchSettings::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_cohort_minimum_is_rejected() {
        let settings = BatchSettings {
            min_cohort_definitions: 0,
            ..BatchSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_match_threshold_bounds() {
        let settings = LinkageSettings {
            match_threshold: 0.,
            ..LinkageSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = LinkageSettings {
            match_threshold: 1.2,
            ..LinkageSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
