//! ABX Simulator - seeded end-to-end experiment runs
//!
//! Builds an engine over the in-memory repository and a Bernoulli harness,
//! drives a batch of identical experiments to a terminal state, adopts each
//! winner and checks the finished records:
//! - Every experiment ends COMPLETED
//! - No arm collects more than the target sample size
//! - Per-arm counts stay consistent
//! - The adopted configuration is the reported winner

use crate::harness::{BernoulliHarness, LoggingPublisher};
use abx_core::{
    ArmResult, ConfigId, EngineConfig, Experiment, ExperimentDefinition, ExperimentEngine,
    ExperimentError, ExperimentId, ExperimentStatus, InMemoryExperimentRepository, Outcome,
};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Simulator configuration
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// True success probability of the control configuration
    pub control_rate: f64,
    /// True success probability of the variant configuration
    pub variant_rate: f64,
    /// Target sample size per arm
    pub target_sample_size: u32,
    /// Confidence threshold in percent
    pub confidence: f64,
    /// Fraction of harness calls that fail
    pub failure_rate: f64,
    /// Experiments run side by side
    pub experiments: usize,
    /// Scheduler tick delay; `None` steps iterations directly
    pub tick_ms: Option<u64>,
    /// Engine configuration
    #[serde(skip)]
    pub engine: EngineConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            control_rate: 0.5,
            variant_rate: 0.6,
            target_sample_size: 500,
            confidence: 95.0,
            failure_rate: 0.0,
            experiments: 1,
            tick_ms: None,
            engine: EngineConfig::default(),
        }
    }
}

impl SimulatorConfig {
    /// Check the run can terminate and the rates are probabilities
    ///
    /// # Errors
    /// `Config` describing the first bad field.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        for (name, rate) in [
            ("control rate", self.control_rate),
            ("variant rate", self.variant_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ExperimentError::Config(format!(
                    "{name} must be within [0, 1], got {rate}"
                )));
            }
        }
        if !(0.0..1.0).contains(&self.failure_rate) {
            return Err(ExperimentError::Config(format!(
                "failure rate must be within [0, 1), got {}",
                self.failure_rate
            )));
        }
        if self.experiments == 0 {
            return Err(ExperimentError::Config(
                "at least one experiment is required".into(),
            ));
        }
        Ok(())
    }
}

/// Final state of one arm
#[derive(Debug, Clone, Serialize)]
pub struct ArmSummary {
    /// Configuration under test
    pub config_id: ConfigId,
    /// Rate the harness was told to produce
    pub true_rate: f64,
    /// Counted samples
    pub samples: u64,
    /// Successful samples
    pub successes: u64,
    /// Observed success rate in percent
    pub success_rate: f64,
    /// Latest p-value
    pub p_value: Option<f64>,
}

impl ArmSummary {
    fn new(arm: &ArmResult, true_rate: f64) -> Self {
        Self {
            config_id: arm.config_id.clone(),
            true_rate,
            samples: arm.sample_count(),
            successes: arm.success_count(),
            success_rate: arm.success_rate(),
            p_value: arm.p_value,
        }
    }
}

/// Final state of one experiment
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary {
    /// Experiment id
    pub id: ExperimentId,
    /// Experiment name
    pub name: String,
    /// Terminal status
    pub status: ExperimentStatus,
    /// Control arm
    pub control: ArmSummary,
    /// Variant arm
    pub variant: ArmSummary,
    /// Reported outcome
    pub outcome: Option<Outcome>,
    /// Configuration handed to the publisher
    pub adopted: ConfigId,
}

/// Simulator report
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    /// Configuration the run used
    pub config: SimulatorConfig,
    /// One entry per experiment
    pub experiments: Vec<ExperimentSummary>,
    /// Broken checks, empty on a clean run
    pub violations: Vec<String>,
}

impl SimulatorReport {
    /// Check if all checks held
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Experiments whose variant won
    #[must_use]
    pub fn variant_wins(&self) -> usize {
        self.experiments
            .iter()
            .filter(|e| e.adopted == e.variant.config_id)
            .count()
    }

    /// Generate human-readable report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();

        report.push_str("=== ABX Simulator Report ===\n\n");
        report.push_str(&format!("Seed: {}\n", self.config.seed));
        report.push_str(&format!(
            "True Rates: control {:.3}, variant {:.3}\n",
            self.config.control_rate, self.config.variant_rate
        ));
        report.push_str(&format!(
            "Target Samples: {} per arm\n",
            self.config.target_sample_size
        ));
        report.push_str(&format!("Confidence: {}%\n", self.config.confidence));
        report.push_str(&format!("Failure Rate: {}\n", self.config.failure_rate));
        report.push_str(&format!(
            "Variant Wins: {}/{}\n",
            self.variant_wins(),
            self.experiments.len()
        ));

        for exp in &self.experiments {
            report.push_str(&format!("\n--- {} ({}) ---\n", exp.name, exp.id));
            report.push_str(&format!("Status: {}\n", exp.status));
            for (label, arm) in [("Control", &exp.control), ("Variant", &exp.variant)] {
                report.push_str(&format!(
                    "{label}: {} samples, {} successes ({:.2}%)",
                    arm.samples, arm.successes, arm.success_rate
                ));
                if let Some(p) = arm.p_value {
                    report.push_str(&format!(", p = {p:.6}"));
                }
                report.push('\n');
            }
            if let Some(outcome) = &exp.outcome {
                report.push_str(&format!(
                    "Winner: {} ({})\n",
                    outcome.winner, outcome.winner_config_id
                ));
                report.push_str(&format!(
                    "Confidence: {:.2}% ({})\n",
                    outcome.confidence_level, outcome.confidence_arm
                ));
                if let Some(improvement) = outcome.improvement_percentage {
                    report.push_str(&format!("Improvement: {improvement:.2}%\n"));
                }
                report.push_str(&format!("Recommendation: {}\n", outcome.recommendation));
            }
            report.push_str(&format!("Adopted: {}\n", exp.adopted));
        }

        if !self.violations.is_empty() {
            report.push_str("\n=== Violations ===\n");
            for (i, v) in self.violations.iter().enumerate() {
                report.push_str(&format!("{}. {v}\n", i + 1));
            }
        }

        report.push_str(&format!(
            "\n=== Result: {} ===\n",
            if self.passed() { "PASS" } else { "FAIL" }
        ));
        report
    }
}

/// Run the simulator
///
/// # Errors
/// Bad configuration, or any engine error other than those the run checks
/// for itself.
pub async fn run_simulator(config: SimulatorConfig) -> Result<SimulatorReport, ExperimentError> {
    config.validate()?;

    let mut engine_config = config.engine.clone();
    if let Some(ms) = config.tick_ms {
        engine_config = engine_config.with_tick_delay(Duration::from_millis(ms));
    }

    let mut harness =
        BernoulliHarness::new(config.seed, config.control_rate).with_failure_rate(config.failure_rate);
    let mut definitions = Vec::with_capacity(config.experiments);
    for n in 1..=config.experiments {
        let control = ConfigId::new(format!("control-{n}"));
        let variant = ConfigId::new(format!("variant-{n}"));
        harness = harness
            .with_rate(control.clone(), config.control_rate)
            .with_rate(variant.clone(), config.variant_rate);
        definitions.push(
            ExperimentDefinition::new(format!("simulated experiment {n}"), control, variant)
                .with_backend("simulator", "bernoulli")
                .with_target_sample_size(config.target_sample_size)
                .with_confidence_threshold(config.confidence)
                .with_creator("abx-sim"),
        );
    }

    let publisher = Arc::new(LoggingPublisher::new());
    let engine = ExperimentEngine::new(
        engine_config,
        Arc::new(InMemoryExperimentRepository::new()),
        Arc::new(harness),
        publisher.clone(),
    )?;
    if config.tick_ms.is_none() {
        engine.shutdown();
    }

    tracing::info!(
        seed = config.seed,
        experiments = config.experiments,
        target = config.target_sample_size,
        "simulation started"
    );

    let mut ids = Vec::with_capacity(definitions.len());
    for definition in definitions {
        let experiment = engine.create(definition).await?;
        engine.start(experiment.id).await?;
        ids.push(experiment.id);
    }

    let finished = join_all(ids.iter().map(|&id| drive(&engine, id, config.tick_ms))).await;

    let mut experiments = Vec::with_capacity(finished.len());
    let mut violations = Vec::new();
    for experiment in finished {
        let experiment = experiment?;
        let adopted = engine.apply_winner(experiment.id).await?;
        let report = engine.report(experiment.id).await?;
        check(&experiment, report.outcome.as_ref(), &adopted, &mut violations);
        experiments.push(ExperimentSummary {
            id: experiment.id,
            name: experiment.name.clone(),
            status: experiment.status,
            control: ArmSummary::new(&experiment.arms.control, config.control_rate),
            variant: ArmSummary::new(&experiment.arms.variant, config.variant_rate),
            outcome: report.outcome,
            adopted,
        });
    }
    engine.shutdown();

    if publisher.adopted().len() != experiments.len() {
        violations.push(format!(
            "publisher saw {} adoptions for {} experiments",
            publisher.adopted().len(),
            experiments.len()
        ));
    }

    tracing::info!(violations = violations.len(), "simulation finished");
    Ok(SimulatorReport {
        config,
        experiments,
        violations,
    })
}

/// Step or wait until the experiment is terminal
async fn drive(
    engine: &ExperimentEngine,
    id: ExperimentId,
    tick_ms: Option<u64>,
) -> Result<Experiment, ExperimentError> {
    match tick_ms {
        None => loop {
            let experiment = engine.run_iteration_now(id).await?;
            if experiment.status.is_terminal() {
                return Ok(experiment);
            }
        },
        Some(ms) => {
            let poll = Duration::from_millis(ms.max(1));
            loop {
                let experiment = engine.get(id).await?;
                if experiment.status.is_terminal() {
                    return Ok(experiment);
                }
                tokio::time::sleep(poll).await;
            }
        }
    }
}

fn check(
    experiment: &Experiment,
    outcome: Option<&Outcome>,
    adopted: &ConfigId,
    violations: &mut Vec<String>,
) {
    if experiment.status != ExperimentStatus::Completed {
        violations.push(format!(
            "{} ended {} instead of COMPLETED",
            experiment.id, experiment.status
        ));
    }
    for arm in [&experiment.arms.control, &experiment.arms.variant] {
        if arm.sample_count() > u64::from(experiment.target_sample_size) {
            violations.push(format!(
                "{} arm {} collected {} samples over target {}",
                experiment.id,
                arm.config_id,
                arm.sample_count(),
                experiment.target_sample_size
            ));
        }
        if !arm.counts_consistent() {
            violations.push(format!(
                "{} arm {} has inconsistent counts",
                experiment.id, arm.config_id
            ));
        }
    }
    if let Some(outcome) = outcome {
        if outcome.winner_config_id != *adopted {
            violations.push(format!(
                "{} reported {} but adopted {adopted}",
                experiment.id, outcome.winner_config_id
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_clear_winner_is_adopted() {
        let report = run_simulator(SimulatorConfig {
            control_rate: 0.1,
            variant_rate: 0.9,
            target_sample_size: 200,
            ..SimulatorConfig::default()
        })
        .await
        .unwrap();

        assert!(report.passed(), "{}", report.generate_text());
        let exp = &report.experiments[0];
        assert_eq!(exp.adopted, exp.variant.config_id);
        // significance stops the run well before target
        assert!(exp.variant.samples < 200);
        assert!(report.generate_text().contains("Result: PASS"));
    }

    #[tokio::test]
    async fn test_identical_arms_run_to_target() {
        let report = run_simulator(SimulatorConfig {
            control_rate: 1.0,
            variant_rate: 1.0,
            target_sample_size: 40,
            ..SimulatorConfig::default()
        })
        .await
        .unwrap();

        assert!(report.passed());
        let exp = &report.experiments[0];
        assert_eq!(exp.control.samples, 40);
        assert_eq!(exp.variant.samples, 40);
        assert_eq!(exp.adopted, exp.control.config_id);
    }

    #[tokio::test]
    async fn test_same_seed_same_report() {
        let config = SimulatorConfig {
            target_sample_size: 120,
            failure_rate: 0.2,
            experiments: 3,
            ..SimulatorConfig::default()
        };
        let a = run_simulator(config.clone()).await.unwrap();
        let b = run_simulator(config).await.unwrap();

        assert_eq!(a.experiments.len(), 3);
        for (x, y) in a.experiments.iter().zip(&b.experiments) {
            assert_eq!(x.control.successes, y.control.successes);
            assert_eq!(x.variant.successes, y.variant.successes);
            assert_eq!(x.adopted.as_str(), y.adopted.as_str());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_driven_run() {
        let report = run_simulator(SimulatorConfig {
            target_sample_size: 60,
            experiments: 2,
            tick_ms: Some(10),
            ..SimulatorConfig::default()
        })
        .await
        .unwrap();

        assert!(report.passed(), "{}", report.generate_text());
        assert_eq!(report.experiments.len(), 2);
    }

    #[tokio::test]
    async fn test_bad_config_rejected() {
        for config in [
            SimulatorConfig {
                control_rate: 1.5,
                ..SimulatorConfig::default()
            },
            SimulatorConfig {
                failure_rate: 1.0,
                ..SimulatorConfig::default()
            },
            SimulatorConfig {
                experiments: 0,
                ..SimulatorConfig::default()
            },
        ] {
            assert!(matches!(
                run_simulator(config).await,
                Err(ExperimentError::Config(_))
            ));
        }
    }

    #[test]
    fn test_report_serializes() {
        let report = SimulatorReport {
            config: SimulatorConfig::default(),
            experiments: Vec::new(),
            violations: vec!["broken".into()],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["config"]["seed"], 42);
        assert!(!report.passed());
        assert!(report.generate_text().contains("1. broken"));
    }
}
