//! Outer tuning loop: suggest settings, evaluate them as one batched call,
//! record the results.

use std::collections::BTreeMap;

use ndarray::Axis;
use tracing::{debug, info, warn};

use ef_types::{EfResult, HpoError, StructureError};

use crate::problem::HpoProblem;
use crate::search::{GridSearch, ParameterSet, RandomSearch, SearchStrategy};
use crate::trial::{StrategyKind, Trial, TrialResult, TunerConfig, TuningRun};

/// Drives an [`HpoProblem`] with a search strategy.
///
/// Every evaluation call fills up to `num_instances` slots with suggested
/// settings; unused slots keep the default parameters and are not recorded.
pub struct Tuner {
    problem: HpoProblem,
    strategy: Box<dyn SearchStrategy>,
    run: TuningRun,
    trials: Vec<Trial>,
    batches: usize,
}

impl Tuner {
    pub fn new(problem: HpoProblem, config: TunerConfig) -> EfResult<Self> {
        config.validate()?;
        for path in config.search_space.paths() {
            match problem.parameter_shapes().get(path) {
                None => {
                    return Err(HpoError::UnknownParameter {
                        path: path.to_string(),
                    }
                    .into())
                }
                Some(shape) if !shape.is_empty() => {
                    return Err(HpoError::ParameterShape {
                        path: path.to_string(),
                        expected: vec![],
                        actual: shape.clone(),
                    }
                    .into())
                }
                Some(_) => {}
            }
        }
        let strategy: Box<dyn SearchStrategy> = match config.strategy {
            StrategyKind::Grid => Box::new(GridSearch::new(&config.search_space, config.grid_steps)),
            StrategyKind::Random => Box::new(RandomSearch::new(config.search_space.clone(), config.seed)),
        };
        Ok(Self {
            problem,
            strategy,
            run: TuningRun::new(config),
            trials: Vec::new(),
            batches: 0,
        })
    }

    /// Replace the strategy picked from the configuration.
    pub fn with_strategy(mut self, strategy: impl SearchStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    pub fn status(&self) -> &TuningRun {
        &self.run
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn best(&self) -> Option<&TrialResult> {
        self.run.best_trial.as_ref()
    }

    pub fn problem(&self) -> &HpoProblem {
        &self.problem
    }

    /// Run until `max_trials` settings were evaluated or the strategy is
    /// exhausted.
    pub fn run(&mut self) -> EfResult<&TuningRun> {
        self.run.mark_running();
        info!(
            run = %self.run.config.name,
            strategy = self.strategy.name(),
            max_trials = self.run.config.max_trials,
            instances = self.problem.num_instances(),
            "Starting tuning run"
        );

        loop {
            let remaining = self.run.config.max_trials.saturating_sub(self.trials.len());
            if remaining == 0 {
                break;
            }
            let settings = self.strategy.suggest(remaining.min(self.problem.num_instances()));
            if settings.is_empty() {
                break;
            }
            if let Err(err) = self.evaluate(settings) {
                warn!(run = %self.run.config.name, error = %err, "Tuning run failed");
                self.run.mark_failed(err.to_string());
                return Err(err);
            }
        }

        self.run.mark_completed();
        info!(
            run = %self.run.config.name,
            trials = self.trials.len(),
            best = ?self.run.best_trial.as_ref().map(|t| t.objective),
            "Tuning run complete"
        );
        Ok(&self.run)
    }

    fn evaluate(&mut self, settings: Vec<ParameterSet>) -> EfResult<()> {
        let n = self.problem.num_instances();
        let mut params = self.problem.get_init_params();
        for (instance, setting) in settings.iter().enumerate() {
            for (path, value) in setting {
                let tensor = params
                    .get_mut(path)
                    .ok_or_else(|| HpoError::UnknownParameter { path: path.clone() })?;
                tensor.index_axis_mut(Axis(0), instance).fill(value.as_f64());
            }
        }

        let batch = self.batches;
        self.batches += 1;
        let base = self.trials.len();
        let mut trials: Vec<Trial> = settings
            .into_iter()
            .enumerate()
            .map(|(instance, parameters)| {
                let mut trial = Trial::new(self.run.id, base + instance, batch, instance, parameters);
                trial.mark_running();
                trial
            })
            .collect();
        debug!(run = %self.run.config.name, batch, trials = trials.len(), "Evaluating batch");

        let metric = self.problem.evaluate_batch(&params).and_then(|metric| {
            if metric.shape().first() != Some(&n) {
                return Err(StructureError::ShapeMismatch {
                    context: "tuning metric".into(),
                    expected: vec![n],
                    actual: metric.shape().to_vec(),
                }
                .into());
            }
            Ok(metric)
        });
        let metric = match metric {
            Ok(metric) => metric,
            Err(err) => {
                for trial in &mut trials {
                    trial.mark_failed(err.to_string());
                }
                self.run.trials_failed += trials.len();
                self.trials.extend(trials);
                return Err(err);
            }
        };

        for trial in &mut trials {
            let row = metric.index_axis(Axis(0), trial.instance);
            let objective = row.iter().next().copied().unwrap_or(f64::NAN);
            if !objective.is_finite() {
                trial.mark_failed(format!("objective {objective} is not finite"));
                self.run.trials_failed += 1;
                continue;
            }
            let metrics: BTreeMap<String, f64> = row
                .iter()
                .enumerate()
                .skip(1)
                .map(|(j, v)| (format!("metric_{j}"), *v))
                .collect();
            let result = TrialResult {
                trial_id: trial.id,
                objective,
                metrics,
                parameters: trial.parameters.clone(),
            };
            self.strategy.report(&trial.parameters, objective);
            self.run.update_best(&result);
            trial.mark_completed(result);
            self.run.trials_completed += 1;
        }
        self.trials.extend(trials);
        Ok(())
    }
}
