use crate::error::Fault;
use anyhow::{Context, Result, bail};
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Course of the disease and quarantine.
    pub disease: DiseaseConfig,
    /// Contact categories of the network.
    pub contacts: ContactConfig,
    /// Parameters of every agent type present in the network.
    pub types: BTreeMap<String, TypeConfig>,
    /// Testing and contact tracing policy.
    #[serde(default)]
    pub testing: TestingConfig,
    /// Initial condition.
    #[serde(default)]
    pub init: InitConfig,
    /// Output parameters.
    pub output: OutputConfig,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct DiseaseConfig {
    /// Days after transmission until an agent becomes infectious.
    pub exposure_duration: Days,
    /// Days after transmission until a symptomatic agent shows symptoms.
    pub time_until_symptoms: Days,
    /// Days after transmission until an agent recovers.
    pub infection_duration: Days,
    /// Transmission risk multiplier of agents with an asymptomatic course.
    #[serde(default = "unit_modifier")]
    pub subclinical_modifier: f64,
    /// Age dependence of the transmission risk.
    #[serde(default)]
    pub age_transmission_discount: Discount,
    /// Age dependence of the probability of a symptomatic course.
    pub age_symptom_discount: Discount,
    /// Days an agent stays in quarantine.
    pub quarantine_duration: u32,
}

/// A duration in days, either fixed or drawn once per agent from an inclusive range.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Days {
    Fixed(u32),
    Range { min: u32, max: u32 },
}

impl Days {
    pub fn min(&self) -> u32 {
        match *self {
            Days::Fixed(days) => days,
            Days::Range { min, .. } => min,
        }
    }

    pub fn max(&self) -> u32 {
        match *self {
            Days::Fixed(days) => days,
            Days::Range { max, .. } => max,
        }
    }

    /// Draw a duration. Fixed durations do not consume random numbers.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<u32> {
        match *self {
            Days::Fixed(days) => Ok(days),
            Days::Range { min, max } => Ok(Uniform::new_inclusive(min, max)?.sample(rng)),
        }
    }
}

/// Linear age discount, clamped to `[0, 1]`.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct Discount {
    pub intercept: f64,
    #[serde(default)]
    pub slope: Option<f64>,
}

impl Default for Discount {
    fn default() -> Self {
        Self {
            intercept: 1.0,
            slope: None,
        }
    }
}

impl Discount {
    /// Evaluate the discount for an agent.
    ///
    /// The slope only applies when both the slope and the age are known.
    pub fn evaluate(&self, age: Option<f64>) -> f64 {
        let val = match (self.slope, age) {
            (Some(slope), Some(age)) => self.intercept + slope * age,
            _ => self.intercept,
        };
        val.clamp(0.0, 1.0)
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ContactConfig {
    /// Base transmission modifier of every contact type (e.g. `close = 3.0`).
    pub weights: BTreeMap<String, f64>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TypeConfig {
    pub transmission_risk: f64,
    pub reception_risk: f64,
    /// Daily probability of an infection from outside the community.
    #[serde(default)]
    pub index_probability: f64,
    #[serde(default)]
    pub mask: bool,
    /// Days between preventive screens, if any.
    #[serde(default)]
    pub screening_interval: Option<u32>,
    /// Screen all agents of this type after a positive result.
    #[serde(default)]
    pub reactive_screening: bool,
    /// Agent types this type can infect. All types when missing.
    #[serde(default)]
    pub transmits_to: Option<Vec<String>>,
}

impl TypeConfig {
    pub fn reaches(&self, kind: &str) -> bool {
        match &self.transmits_to {
            None => true,
            Some(kinds) => kinds.iter().any(|k| k == kind),
        }
    }

    /// Whether agents of this type take part in preventive or reactive screens.
    pub fn is_screened(&self) -> bool {
        self.screening_interval.is_some() || self.reactive_screening
    }
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingConfig {
    pub enabled: bool,
    /// Test used for symptomatic agents and reactive and follow-up screens.
    pub diagnostic_test_type: String,
    /// Test used for preventive screens.
    pub preventive_test_type: String,
    /// Days after the most recent positive result at which everybody is screened again.
    pub follow_up_interval: Option<u32>,
    /// Release quarantined agents on a negative result.
    pub liberating: bool,
    /// Contact types whose contacts are quarantined after a positive result.
    pub k1_contact_types: Vec<String>,
    pub tests: BTreeMap<String, TestType>,
}

impl TestingConfig {
    pub fn test(&self, name: &str) -> Result<&TestType, Fault> {
        self.tests
            .get(name)
            .ok_or_else(|| Fault::UnknownTest(name.to_string()))
    }

    pub fn is_k1(&self, contact_type: &str) -> bool {
        self.k1_contact_types.iter().any(|ct| ct == contact_type)
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TestType {
    pub sensitivity: f64,
    pub specificity: f64,
    /// Days after transmission from which the infection is detectable.
    pub time_until_testable: u32,
    /// Number of days the infection stays detectable.
    pub time_testable: u32,
    /// Days between sampling and result.
    pub turnover: u32,
}

impl TestType {
    pub fn detects(&self, days_since_exposure: u32) -> bool {
        days_since_exposure >= self.time_until_testable
            && days_since_exposure < self.time_until_testable + self.time_testable
    }
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    /// Base seed of the random number generator. Drawn from the OS when missing.
    pub seed: Option<u64>,
    /// Agent type from which a single index case is drawn at the start.
    pub index_case: Option<String>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Number of simulated days per trajectory file.
    pub days_per_file: usize,
}

fn unit_modifier() -> f64 {
    1.0
}

impl Config {
    /// Load a [`Config`] from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    /// Parameters of an agent type.
    pub fn type_config(&self, kind: &str) -> Result<&TypeConfig> {
        self.types
            .get(kind)
            .with_context(|| format!("unknown agent type {kind:?}"))
    }

    /// Base transmission modifier of a contact type.
    pub fn contact_weight(&self, contact_type: &str) -> Result<f64> {
        self.contacts
            .weights
            .get(contact_type)
            .copied()
            .with_context(|| format!("unknown contact type {contact_type:?}"))
    }

    fn validate(&self) -> Result<()> {
        self.validate_disease().context("invalid disease parameters")?;

        if self.contacts.weights.is_empty() {
            bail!("at least one contact type must be defined");
        }
        for (contact_type, &weight) in &self.contacts.weights {
            check_num(weight, 0.0..=100.0)
                .with_context(|| format!("invalid weight of contact type {contact_type:?}"))?;
        }

        if self.types.is_empty() {
            bail!("at least one agent type must be defined");
        }
        for (kind, params) in &self.types {
            self.validate_type(params)
                .with_context(|| format!("invalid parameters of agent type {kind:?}"))?;
        }

        self.validate_testing().context("invalid testing parameters")?;

        if let Some(kind) = &self.init.index_case {
            self.type_config(kind).context("invalid index case")?;
        }

        check_num(self.output.days_per_file, 1..100_000)
            .context("invalid number of days per file")?;

        Ok(())
    }

    fn validate_disease(&self) -> Result<()> {
        let disease = &self.disease;
        check_days(disease.exposure_duration).context("invalid exposure duration")?;
        check_days(disease.time_until_symptoms).context("invalid time until symptoms")?;
        check_days(disease.infection_duration).context("invalid infection duration")?;

        // Every agent must pass through exposure, symptom onset and recovery in this order.
        if disease.exposure_duration.max() > disease.time_until_symptoms.min() {
            bail!("symptoms must not start before the end of the exposure");
        }
        if disease.time_until_symptoms.max() >= disease.infection_duration.min() {
            bail!("symptoms must start before recovery");
        }

        check_num(disease.subclinical_modifier, 0.0..=1.0)
            .context("invalid subclinical modifier")?;
        check_num(disease.age_transmission_discount.intercept, 0.0..=1.0)
            .context("invalid age transmission discount")?;
        check_num(disease.age_symptom_discount.intercept, 0.0..=1.0)
            .context("invalid age symptom discount")?;
        check_num(disease.quarantine_duration, 1..=365).context("invalid quarantine duration")?;

        Ok(())
    }

    fn validate_type(&self, params: &TypeConfig) -> Result<()> {
        check_num(params.transmission_risk, 0.0..=1.0).context("invalid transmission risk")?;
        check_num(params.reception_risk, 0.0..=1.0).context("invalid reception risk")?;
        check_num(params.index_probability, 0.0..=1.0).context("invalid index probability")?;
        if let Some(interval) = params.screening_interval {
            check_num(interval, 1..=365).context("invalid screening interval")?;
        }
        for kind in params.transmits_to.iter().flatten() {
            self.type_config(kind).context("invalid transmission target")?;
        }
        Ok(())
    }

    fn validate_testing(&self) -> Result<()> {
        let testing = &self.testing;
        if !testing.enabled {
            return Ok(());
        }

        for (name, test) in &testing.tests {
            check_test(test).with_context(|| format!("invalid test type {name:?}"))?;
        }
        testing
            .test(&testing.diagnostic_test_type)
            .context("invalid diagnostic test type")?;
        testing
            .test(&testing.preventive_test_type)
            .context("invalid preventive test type")?;

        for contact_type in &testing.k1_contact_types {
            self.contact_weight(contact_type)
                .context("invalid K1 contact type")?;
        }
        if let Some(interval) = testing.follow_up_interval {
            check_num(interval, 1..=365).context("invalid follow-up interval")?;
        }

        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_days(days: Days) -> Result<()> {
    if days.min() > days.max() {
        bail!("range minimum {} exceeds maximum {}", days.min(), days.max());
    }
    check_num(days.max(), 0..=365)
}

fn check_test(test: &TestType) -> Result<()> {
    check_num(test.sensitivity, 0.0..=1.0).context("invalid sensitivity")?;
    check_num(test.specificity, 0.0..=1.0).context("invalid specificity")?;
    check_num(test.time_testable, 1..=365).context("invalid time testable")?;
    check_num(test.turnover, 0..=30).context("invalid turnover")?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    /// Nursing home scenario used across the unit tests.
    pub(crate) const NURSING_HOME: &str = r#"
[disease]
exposure_duration = 4
time_until_symptoms = 6
infection_duration = 11
subclinical_modifier = 1.0
age_symptom_discount = { intercept = 0.6 }
quarantine_duration = 14

[contacts]
weights = { very_far = 0.1, far = 0.5, intermediate = 1.0, close = 3.0 }

[types.resident]
transmission_risk = 0.3
reception_risk = 0.3
reactive_screening = true

[types.employee]
transmission_risk = 0.3
reception_risk = 0.3
screening_interval = 7

[testing]
enabled = true
diagnostic_test_type = "one_day_PCR"
preventive_test_type = "same_day_antigen"
k1_contact_types = ["close"]

[testing.tests.one_day_PCR]
sensitivity = 0.95
specificity = 1.0
time_until_testable = 4
time_testable = 10
turnover = 1

[testing.tests.same_day_antigen]
sensitivity = 0.8
specificity = 0.97
time_until_testable = 5
time_testable = 5
turnover = 0

[init]
seed = 42
index_case = "employee"

[output]
days_per_file = 30
"#;

    pub(crate) fn nursing_home() -> Config {
        Config::from_toml(NURSING_HOME).expect("failed to parse test config")
    }

    #[test]
    fn parses_nursing_home_scenario() {
        let cfg = nursing_home();
        assert_eq!(cfg.disease.exposure_duration, Days::Fixed(4));
        assert_eq!(cfg.types.len(), 2);
        assert_eq!(cfg.types["employee"].screening_interval, Some(7));
        assert!(cfg.types["resident"].reaches("employee"));
        assert_eq!(cfg.contact_weight("close").unwrap(), 3.0);
        assert!(cfg.testing.is_k1("close"));
        assert!(cfg.types["resident"].is_screened());
        assert!(cfg.types["employee"].is_screened());
        assert!(!cfg.testing.is_k1("far"));
        assert_eq!(cfg.init.index_case.as_deref(), Some("employee"));
    }

    #[test]
    fn parses_duration_ranges() {
        let contents = NURSING_HOME.replace(
            "exposure_duration = 4",
            "exposure_duration = { min = 2, max = 5 }",
        );
        let cfg = Config::from_toml(&contents).unwrap();
        let days = cfg.disease.exposure_duration;
        assert_eq!(days, Days::Range { min: 2, max: 5 });

        let mut rng = ChaCha12Rng::seed_from_u64(3);
        for _ in 0..100 {
            let val = days.sample(&mut rng).unwrap();
            assert!((2..=5).contains(&val));
        }
    }

    #[test]
    fn rejects_invalid_values() {
        let contents = NURSING_HOME.replace("reception_risk = 0.3", "reception_risk = 1.3");
        assert!(Config::from_toml(&contents).is_err());

        let contents = NURSING_HOME.replace("time_until_symptoms = 6", "time_until_symptoms = 11");
        assert!(Config::from_toml(&contents).is_err());

        let contents = NURSING_HOME.replace("exposure_duration = 4", "exposure_duration = 7");
        assert!(Config::from_toml(&contents).is_err());

        let contents = NURSING_HOME.replace("k1_contact_types = [\"close\"]", "k1_contact_types = [\"hug\"]");
        assert!(Config::from_toml(&contents).is_err());

        let contents = NURSING_HOME.replace("index_case = \"employee\"", "index_case = \"visitor\"");
        assert!(Config::from_toml(&contents).is_err());

        let contents = NURSING_HOME.replace(
            "diagnostic_test_type = \"one_day_PCR\"",
            "diagnostic_test_type = \"two_day_PCR\"",
        );
        assert!(Config::from_toml(&contents).is_err());
    }

    #[test]
    fn disabled_testing_needs_no_tests() {
        let contents = r#"
[disease]
exposure_duration = 1
time_until_symptoms = 2
infection_duration = 3
age_symptom_discount = { intercept = 0.5 }
quarantine_duration = 10

[contacts]
weights = { close = 1.0 }

[types.student]
transmission_risk = 0.1
reception_risk = 0.1
transmits_to = ["student"]

[output]
days_per_file = 10
"#;
        let cfg = Config::from_toml(contents).unwrap();
        assert!(!cfg.testing.enabled);
        assert_eq!(cfg.disease.subclinical_modifier, 1.0);
        assert_eq!(cfg.disease.age_transmission_discount, Discount::default());
        assert!(cfg.types["student"].reaches("student"));
        assert!(!cfg.types["student"].reaches("visitor"));
        assert!(!cfg.types["student"].is_screened());
    }

    #[test]
    fn discount_uses_slope_only_with_age() {
        let discount = Discount {
            intercept: 0.2,
            slope: Some(0.01),
        };
        assert!((discount.evaluate(Some(40.0)) - 0.6).abs() < 1e-12);
        assert_eq!(discount.evaluate(None), 0.2);
        assert_eq!(discount.evaluate(Some(100.0)), 1.0);

        let flat = Discount {
            intercept: 0.6,
            slope: None,
        };
        assert_eq!(flat.evaluate(Some(80.0)), 0.6);
    }

    #[test]
    fn detectability_window() {
        let test = TestType {
            sensitivity: 1.0,
            specificity: 1.0,
            time_until_testable: 4,
            time_testable: 3,
            turnover: 0,
        };
        assert!(!test.detects(3));
        assert!(test.detects(4));
        assert!(test.detects(6));
        assert!(!test.detects(7));
    }
}
