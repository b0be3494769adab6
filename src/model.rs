//! Agents and their infection state machine.

use crate::config::{Config, TestType, TestingConfig};
use crate::context::{Counters, Screens, SimContext};
use crate::error::Fault;
use crate::network::Node;
use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MASK_TRANSMISSION_FACTOR: f64 = 0.5;
const MASK_RECEPTION_FACTOR: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfectionState {
    Susceptible,
    Exposed,
    Infectious,
    Recovered,
}

impl InfectionState {
    pub fn is_susceptible(&self) -> bool {
        matches!(self, Self::Susceptible)
    }

    pub fn is_recovered(&self) -> bool {
        matches!(self, Self::Recovered)
    }

    /// Whether the agent is or was infected.
    pub fn was_infected(&self) -> bool {
        !self.is_susceptible()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sample {
    Positive,
    Negative,
}

/// Test waiting for its result, together with the biological sample taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTest {
    pub test_type: String,
    pub sample: Sample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    TruePositive,
    FalseNegative,
    FalsePositive,
    TrueNegative,
}

impl TestOutcome {
    pub fn is_positive(&self) -> bool {
        matches!(self, Self::TruePositive | Self::FalsePositive)
    }
}

/// Agent of the simulation.
///
/// Durations and risks are fixed at creation. Everything else is updated by
/// [`Agent::advance`] once per day and by the testing coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    id: String,
    kind: String,
    unit: Option<String>,
    age: Option<f64>,

    exposure_duration: u32,
    time_until_symptoms: u32,
    infection_duration: u32,

    transmission_risk: f64,
    reception_risk: f64,
    index_probability: f64,
    symptom_probability: f64,

    state: InfectionState,
    symptomatic_course: bool,
    symptoms: bool,
    tested: bool,
    pending_test: Option<PendingTest>,
    known_positive: bool,
    quarantined: bool,
    contact_to_infected: bool,

    days_since_exposure: u32,
    days_quarantined: u32,
    days_since_tested: u32,
    transmissions: u32,
    transmission_targets: BTreeMap<String, u32>,
}

impl Agent {
    /// Create a susceptible agent from a network node.
    ///
    /// Durations given as ranges are drawn from `rng`.
    pub fn new<R: Rng + ?Sized>(node: &Node, cfg: &Config, rng: &mut R) -> Result<Self> {
        let params = cfg.type_config(&node.kind)?;
        let disease = &cfg.disease;

        let exposure_duration = disease.exposure_duration.sample(rng)?;
        let time_until_symptoms = disease.time_until_symptoms.sample(rng)?;
        let infection_duration = disease.infection_duration.sample(rng)?;

        let transmission_risk =
            params.transmission_risk * disease.age_transmission_discount.evaluate(node.age);
        let transmission_risk = mask_adjust(transmission_risk, params.mask, MASK_TRANSMISSION_FACTOR);
        let reception_risk = mask_adjust(params.reception_risk, params.mask, MASK_RECEPTION_FACTOR);

        Ok(Self {
            id: node.id.clone(),
            kind: node.kind.clone(),
            unit: node.unit.clone(),
            age: node.age,
            exposure_duration,
            time_until_symptoms,
            infection_duration,
            transmission_risk,
            reception_risk,
            index_probability: params.index_probability,
            symptom_probability: disease.age_symptom_discount.evaluate(node.age),
            state: InfectionState::Susceptible,
            symptomatic_course: false,
            symptoms: false,
            tested: false,
            pending_test: None,
            known_positive: false,
            quarantined: false,
            contact_to_infected: false,
            days_since_exposure: 0,
            days_quarantined: 0,
            days_since_tested: 0,
            transmissions: 0,
            transmission_targets: BTreeMap::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn state(&self) -> InfectionState {
        self.state
    }

    pub fn symptoms(&self) -> bool {
        self.symptoms
    }

    pub fn tested(&self) -> bool {
        self.tested
    }

    pub fn pending_test(&self) -> Option<&PendingTest> {
        self.pending_test.as_ref()
    }

    pub fn known_positive(&self) -> bool {
        self.known_positive
    }

    pub fn quarantined(&self) -> bool {
        self.quarantined
    }

    pub fn contact_to_infected(&self) -> bool {
        self.contact_to_infected
    }

    pub fn days_since_tested(&self) -> u32 {
        self.days_since_tested
    }

    pub fn reception_risk(&self) -> f64 {
        self.reception_risk
    }

    pub fn index_probability(&self) -> f64 {
        self.index_probability
    }

    /// Transmission risk of the agent as a source, lowered for asymptomatic courses.
    pub fn source_risk(&self, subclinical_modifier: f64) -> f64 {
        if self.symptomatic_course {
            self.transmission_risk
        } else {
            self.transmission_risk * subclinical_modifier
        }
    }

    /// Stage an infection, applied by the next [`Agent::advance`].
    pub fn stage_infection(&mut self) -> Result<(), Fault> {
        if !self.state.is_susceptible() {
            return Err(Fault::NotSusceptible(self.id.clone()));
        }
        if self.contact_to_infected {
            return Err(Fault::AlreadyStaged(self.id.clone()));
        }
        self.contact_to_infected = true;
        Ok(())
    }

    /// Book a transmission caused by this agent on the current day.
    pub fn record_transmission(&mut self, target: String, ctx: &mut SimContext) {
        self.transmissions += 1;
        self.transmission_targets.insert(target, ctx.day);

        // Transmissions that a faster test could have prevented.
        if let Some(PendingTest {
            sample: Sample::Positive,
            ..
        }) = self.pending_test
        {
            ctx.counters.pending_test_infections += 1;
        }
    }

    /// Take a sample for a test.
    ///
    /// The sample is positive if the infection is detectable by the test on the
    /// current day. Sensitivity and specificity only apply to the result.
    pub fn receive_test(&mut self, test_type: &str, test: &TestType) -> Result<Sample, Fault> {
        if self.pending_test.is_some() {
            return Err(Fault::PendingTest(self.id.clone()));
        }

        let detectable = matches!(
            self.state,
            InfectionState::Exposed | InfectionState::Infectious
        ) && test.detects(self.days_since_exposure);
        let sample = if detectable {
            Sample::Positive
        } else {
            Sample::Negative
        };

        self.tested = true;
        self.days_since_tested = 0;
        self.pending_test = Some(PendingTest {
            test_type: test_type.to_string(),
            sample,
        });

        Ok(sample)
    }

    /// Act on the result of the pending test.
    ///
    /// Positive results put the agent into quarantine and queue it for contact
    /// tracing under `idx`. Negative results release it from quarantine if
    /// testing is liberating.
    pub fn act_on_test_result(
        &mut self,
        idx: usize,
        testing: &TestingConfig,
        ctx: &mut SimContext,
    ) -> Result<TestOutcome, Fault> {
        let pending = self
            .pending_test
            .as_ref()
            .ok_or_else(|| Fault::NoPendingTest(self.id.clone()))?;
        let test = testing.test(&pending.test_type)?;

        let draw = ctx.draw();
        let outcome = match pending.sample {
            Sample::Positive if draw <= test.sensitivity => TestOutcome::TruePositive,
            Sample::Positive => TestOutcome::FalseNegative,
            Sample::Negative if draw >= test.specificity => TestOutcome::FalsePositive,
            Sample::Negative => TestOutcome::TrueNegative,
        };
        log::debug!("{} {} returned a test result ({outcome:?})", self.kind, self.id);

        if outcome.is_positive() {
            self.known_positive = true;
            ctx.newly_positive.push(idx);
            if self.state == InfectionState::Exposed {
                ctx.counters.predetected_infections += 1;
            }
            self.quarantine();
        } else {
            self.known_positive = false;
            if testing.liberating && self.quarantined {
                log::debug!("{} {} left quarantine prematurely", self.kind, self.id);
                self.leave_quarantine();
            }
        }

        self.days_since_tested = 0;
        self.pending_test = None;

        Ok(outcome)
    }

    /// Put the agent into quarantine. Returns `false` if it already was.
    pub fn quarantine(&mut self) -> bool {
        if self.quarantined {
            return false;
        }
        self.quarantined = true;
        log::debug!("quarantined {} {}", self.kind, self.id);
        true
    }

    /// Advance the agent by one day.
    ///
    /// Applies a staged infection, then the transitions whose thresholds are
    /// reached today, then updates the counters.
    pub fn advance(&mut self, quarantine_duration: u32, ctx: &mut SimContext) {
        if self.contact_to_infected {
            self.become_exposed();
        }

        if self.state == InfectionState::Exposed
            && self.days_since_exposure == self.exposure_duration
        {
            self.become_infectious(ctx);
        }

        if self.state == InfectionState::Infectious
            && self.days_since_exposure == self.time_until_symptoms
        {
            self.show_symptoms();
        }

        if self.state == InfectionState::Infectious
            && self.days_since_exposure == self.infection_duration
        {
            self.recover(&mut ctx.counters);
        }

        if self.quarantined && self.days_quarantined == quarantine_duration {
            self.leave_quarantine();
        }

        if self.pending_test.is_some() {
            self.days_since_tested += 1;
        }

        if self.quarantined {
            self.days_quarantined += 1;
            *ctx.counters
                .quarantine_days
                .entry(self.kind.clone())
                .or_default() += 1;
        }

        if matches!(
            self.state,
            InfectionState::Exposed | InfectionState::Infectious
        ) {
            self.days_since_exposure += 1;
        }

        self.tested = false;
    }

    fn become_exposed(&mut self) {
        log::debug!("{} {} exposed", self.kind, self.id);
        self.state = InfectionState::Exposed;
        self.contact_to_infected = false;
    }

    fn become_infectious(&mut self, ctx: &mut SimContext) {
        self.state = InfectionState::Infectious;

        // The course is fixed now and not at symptom onset because the
        // transmission risk depends on it from here on.
        self.symptomatic_course = ctx.draw() <= self.symptom_probability;
        log::debug!(
            "{} {} infectious (symptomatic course: {})",
            self.kind,
            self.id,
            self.symptomatic_course
        );
    }

    fn show_symptoms(&mut self) {
        if self.symptomatic_course {
            self.symptoms = true;
            log::debug!("{} {} shows symptoms", self.kind, self.id);
        }
    }

    /// Recover from an infection. Returns `false` if the agent already recovered.
    pub fn recover(&mut self, counters: &mut Counters) -> bool {
        if self.state.is_recovered() {
            return false;
        }
        self.state = InfectionState::Recovered;
        self.symptoms = false;
        self.days_since_exposure = 0;
        if !self.known_positive {
            counters.undetected_infections += 1;
        }
        log::debug!("{} {} recovered", self.kind, self.id);
        true
    }

    fn leave_quarantine(&mut self) {
        log::debug!("{} {} released from quarantine", self.kind, self.id);
        self.quarantined = false;
        self.days_quarantined = 0;
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            kind: self.kind.clone(),
            infection_state: self.state,
            quarantine_state: self.quarantined,
            symptomatic_course: self.symptomatic_course,
            transmissions: self.transmissions,
            transmission_targets: self.transmission_targets.clone(),
        }
    }
}

fn mask_adjust(risk: f64, mask: bool, factor: f64) -> f64 {
    if mask { risk * factor } else { risk }
}

/// Agent as seen by data collection at the end of a day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub infection_state: InfectionState,
    pub quarantine_state: bool,
    pub symptomatic_course: bool,
    pub transmissions: u32,
    pub transmission_targets: BTreeMap<String, u32>,
}

/// Record of the simulation at the end of a day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Index of the simulated day, starting at 0.
    pub day: u32,
    pub agents: Vec<AgentSnapshot>,
    pub counters: Counters,
    pub screened: Screens,
}

#[cfg(test)]
impl Agent {
    pub fn symptomatic_course(&self) -> bool {
        self.symptomatic_course
    }

    pub fn days_since_exposure(&self) -> u32 {
        self.days_since_exposure
    }

    pub fn days_quarantined(&self) -> u32 {
        self.days_quarantined
    }

    pub fn transmissions(&self) -> u32 {
        self.transmissions
    }

    pub fn transmission_targets(&self) -> &BTreeMap<String, u32> {
        &self.transmission_targets
    }

    pub fn transmission_risk(&self) -> f64 {
        self.transmission_risk
    }

    pub fn symptom_probability(&self) -> f64 {
        self.symptom_probability
    }

    pub fn exposure_duration(&self) -> u32 {
        self.exposure_duration
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::nursing_home;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    pub(crate) fn node(id: &str, kind: &str) -> Node {
        Node {
            id: id.to_string(),
            kind: kind.to_string(),
            unit: None,
            age: None,
        }
    }

    pub(crate) fn context(cfg: &Config, seed: u64) -> SimContext {
        SimContext::new(ChaCha12Rng::seed_from_u64(seed), cfg.types.keys())
    }

    fn agent(cfg: &Config) -> Agent {
        let mut rng = ChaCha12Rng::seed_from_u64(0);
        Agent::new(&node("r1", "resident"), cfg, &mut rng).unwrap()
    }

    fn n_states(agent: &Agent) -> usize {
        [
            agent.state().is_susceptible(),
            agent.state() == InfectionState::Exposed,
            agent.state() == InfectionState::Infectious,
            agent.state().is_recovered(),
        ]
        .iter()
        .filter(|&&flag| flag)
        .count()
    }

    #[test]
    fn derives_risks_from_type() {
        let mut cfg = nursing_home();
        cfg.types.get_mut("resident").unwrap().mask = true;
        cfg.disease.age_transmission_discount.slope = Some(-0.005);

        let mut rng = ChaCha12Rng::seed_from_u64(0);
        let mut resident = node("r1", "resident");
        resident.age = Some(80.0);
        let masked = Agent::new(&resident, &cfg, &mut rng).unwrap();
        assert!((masked.transmission_risk() - 0.3 * 0.6 * 0.5).abs() < 1e-12);
        assert!((masked.reception_risk() - 0.3 * 0.7).abs() < 1e-12);
        assert_eq!(masked.symptom_probability(), 0.6);

        let employee = Agent::new(&node("e1", "employee"), &cfg, &mut rng).unwrap();
        assert_eq!(employee.transmission_risk(), 0.3);
        assert_eq!(employee.reception_risk(), 0.3);
        assert_eq!(employee.state(), InfectionState::Susceptible);

        assert!(Agent::new(&node("v1", "visitor"), &cfg, &mut rng).is_err());
    }

    #[test]
    fn becomes_infectious_exactly_at_exposure_duration() {
        let cfg = nursing_home();
        let mut ctx = context(&cfg, 1);
        let mut agt = agent(&cfg);
        assert_eq!(agt.exposure_duration(), 4);

        agt.stage_infection().unwrap();
        for day in 0..4 {
            agt.advance(cfg.disease.quarantine_duration, &mut ctx);
            assert_eq!(agt.state(), InfectionState::Exposed, "day {day}");
            assert!(!agt.contact_to_infected());
        }
        agt.advance(cfg.disease.quarantine_duration, &mut ctx);
        assert_eq!(agt.state(), InfectionState::Infectious);
    }

    #[test]
    fn walks_through_every_state_once() {
        let cfg = nursing_home();
        let mut ctx = context(&cfg, 2);
        let mut agt = agent(&cfg);
        agt.stage_infection().unwrap();

        let mut prev_days = 0;
        let mut states = vec![agt.state()];
        for day in 0..20 {
            agt.advance(cfg.disease.quarantine_duration, &mut ctx);
            assert_eq!(n_states(&agt), 1);

            match agt.state() {
                InfectionState::Exposed | InfectionState::Infectious => {
                    assert_eq!(agt.days_since_exposure(), prev_days + 1, "day {day}");
                }
                _ => assert_eq!(agt.days_since_exposure(), 0),
            }
            prev_days = agt.days_since_exposure();

            if states.last() != Some(&agt.state()) {
                states.push(agt.state());
            }
            if day == 6 {
                assert_eq!(agt.symptoms(), agt.symptomatic_course());
            }
        }

        assert_eq!(
            states,
            [
                InfectionState::Susceptible,
                InfectionState::Exposed,
                InfectionState::Infectious,
                InfectionState::Recovered
            ]
        );
        assert!(!agt.symptoms());
        assert_eq!(ctx.counters.undetected_infections, 1);
    }

    #[test]
    fn recovery_is_a_latch() {
        let cfg = nursing_home();
        let mut counters = Counters::default();
        let mut agt = agent(&cfg);

        assert!(agt.recover(&mut counters));
        assert!(!agt.recover(&mut counters));
        assert_eq!(agt.state(), InfectionState::Recovered);
        assert_eq!(counters.undetected_infections, 1);
        assert_eq!(agt.stage_infection(), Err(Fault::NotSusceptible("r1".into())));
    }

    #[test]
    fn staging_twice_is_a_fault() {
        let cfg = nursing_home();
        let mut agt = agent(&cfg);
        agt.stage_infection().unwrap();
        assert_eq!(agt.stage_infection(), Err(Fault::AlreadyStaged("r1".into())));
    }

    #[test]
    fn true_positive_quarantines_and_queues_for_tracing() {
        let mut cfg = nursing_home();
        cfg.testing.tests.get_mut("one_day_PCR").unwrap().sensitivity = 1.0;
        let mut ctx = context(&cfg, 3);
        let mut agt = agent(&cfg);

        agt.stage_infection().unwrap();
        for _ in 0..5 {
            agt.advance(cfg.disease.quarantine_duration, &mut ctx);
        }
        let test = cfg.testing.test("one_day_PCR").unwrap();
        assert_eq!(agt.receive_test("one_day_PCR", test), Ok(Sample::Positive));
        assert!(agt.tested());
        assert!(!agt.quarantined());

        let outcome = agt.act_on_test_result(7, &cfg.testing, &mut ctx).unwrap();
        assert_eq!(outcome, TestOutcome::TruePositive);
        assert!(agt.quarantined());
        assert!(agt.known_positive());
        assert_eq!(ctx.newly_positive, [7]);
        assert!(agt.pending_test().is_none());
        assert_eq!(agt.days_since_tested(), 0);
    }

    #[test]
    fn liberating_false_negative_releases_quarantine() {
        let mut cfg = nursing_home();
        cfg.testing.liberating = true;
        cfg.testing.tests.get_mut("one_day_PCR").unwrap().sensitivity = 0.0;
        let mut ctx = context(&cfg, 4);
        let mut agt = agent(&cfg);

        agt.stage_infection().unwrap();
        for _ in 0..6 {
            agt.advance(cfg.disease.quarantine_duration, &mut ctx);
        }
        agt.quarantine();
        agt.advance(cfg.disease.quarantine_duration, &mut ctx);
        assert_eq!(agt.days_quarantined(), 1);

        let test = cfg.testing.test("one_day_PCR").unwrap();
        assert_eq!(agt.receive_test("one_day_PCR", test), Ok(Sample::Positive));
        let outcome = agt.act_on_test_result(0, &cfg.testing, &mut ctx).unwrap();
        assert_eq!(outcome, TestOutcome::FalseNegative);
        assert!(!agt.quarantined());
        assert_eq!(agt.days_quarantined(), 0);
        assert!(ctx.newly_positive.is_empty());
    }

    #[test]
    fn negative_result_keeps_quarantine_without_liberating_testing() {
        let cfg = nursing_home();
        let mut ctx = context(&cfg, 5);
        let mut agt = agent(&cfg);
        agt.quarantine();

        let test = cfg.testing.test("one_day_PCR").unwrap();
        assert_eq!(agt.receive_test("one_day_PCR", test), Ok(Sample::Negative));
        let outcome = agt.act_on_test_result(0, &cfg.testing, &mut ctx).unwrap();
        assert_eq!(outcome, TestOutcome::TrueNegative);
        assert!(agt.quarantined());
        assert!(!agt.known_positive());
    }

    #[test]
    fn detection_while_exposed_counts_as_predetected() {
        let mut cfg = nursing_home();
        let test = cfg.testing.tests.get_mut("one_day_PCR").unwrap();
        test.sensitivity = 1.0;
        test.time_until_testable = 1;
        let mut ctx = context(&cfg, 6);
        let mut agt = agent(&cfg);

        agt.stage_infection().unwrap();
        agt.advance(cfg.disease.quarantine_duration, &mut ctx);
        agt.advance(cfg.disease.quarantine_duration, &mut ctx);
        assert_eq!(agt.state(), InfectionState::Exposed);

        let test = cfg.testing.test("one_day_PCR").unwrap();
        agt.receive_test("one_day_PCR", test).unwrap();
        agt.act_on_test_result(0, &cfg.testing, &mut ctx).unwrap();
        assert_eq!(ctx.counters.predetected_infections, 1);
    }

    #[test]
    fn second_test_while_pending_is_a_fault() {
        let cfg = nursing_home();
        let mut ctx = context(&cfg, 7);
        let mut agt = agent(&cfg);
        let test = cfg.testing.test("one_day_PCR").unwrap();

        agt.receive_test("one_day_PCR", test).unwrap();
        assert_eq!(
            agt.receive_test("one_day_PCR", test),
            Err(Fault::PendingTest("r1".into()))
        );

        agt.advance(cfg.disease.quarantine_duration, &mut ctx);
        assert_eq!(agt.days_since_tested(), 1);
        agt.act_on_test_result(0, &cfg.testing, &mut ctx).unwrap();
        assert!(agt.receive_test("one_day_PCR", test).is_ok());
    }

    #[test]
    fn result_without_pending_test_is_a_fault() {
        let cfg = nursing_home();
        let mut ctx = context(&cfg, 8);
        let mut agt = agent(&cfg);
        assert_eq!(
            agt.act_on_test_result(0, &cfg.testing, &mut ctx),
            Err(Fault::NoPendingTest("r1".into()))
        );
    }

    #[test]
    fn quarantine_ends_after_its_duration() {
        let cfg = nursing_home();
        let mut ctx = context(&cfg, 9);
        let mut agt = agent(&cfg);
        agt.quarantine();

        for _ in 0..cfg.disease.quarantine_duration {
            agt.advance(cfg.disease.quarantine_duration, &mut ctx);
            assert!(agt.quarantined());
        }
        agt.advance(cfg.disease.quarantine_duration, &mut ctx);
        assert!(!agt.quarantined());
        assert_eq!(agt.days_quarantined(), 0);
        assert_eq!(ctx.counters.quarantine_days["resident"], 14);
    }

    #[test]
    fn pending_positive_sample_counts_transmissions() {
        let cfg = nursing_home();
        let mut ctx = context(&cfg, 10);
        let mut agt = agent(&cfg);

        agt.record_transmission("e1".into(), &mut ctx);
        assert_eq!(ctx.counters.pending_test_infections, 0);

        agt.stage_infection().unwrap();
        for _ in 0..5 {
            agt.advance(cfg.disease.quarantine_duration, &mut ctx);
        }
        let test = cfg.testing.test("one_day_PCR").unwrap();
        agt.receive_test("one_day_PCR", test).unwrap();
        ctx.day = 5;
        agt.record_transmission("r2".into(), &mut ctx);

        assert_eq!(ctx.counters.pending_test_infections, 1);
        assert_eq!(agt.transmissions(), 2);
        assert_eq!(agt.transmission_targets()["r2"], 5);
    }
}
