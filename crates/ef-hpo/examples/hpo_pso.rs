//! Tune PSO on Ackley twice: with an outer PSO driving the HPO problem, and
//! with a random-search tuning run.

use ef_components::{Ackley, Pso};
use ef_engine::{StdWorkflow, WorkflowConfig};
use ef_hpo::{HpoConfig, HpoProblem, SearchSpace, StrategyKind, Tuner, TunerConfig};
use ef_monitor::{EvalMonitor, HpoFitnessMonitor};
use tracing_subscriber::EnvFilter;

const INSTANCES: usize = 8;

fn inner_problem(iterations: usize) -> anyhow::Result<HpoProblem> {
    let mut inner = StdWorkflow::builder(Pso::new(vec![-32.0; 4], vec![32.0; 4], 20)?, Ackley::new())
        .named_monitor("fitness", HpoFitnessMonitor::new())
        .config(WorkflowConfig::new("inner_pso").with_seed(0))
        .build()?;
    let state = inner.init()?;
    Ok(HpoProblem::new(inner, &state, HpoConfig::new(iterations, INSTANCES))?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let problem = inner_problem(30)?;
    let codec = problem.codec();
    println!("tunable parameters: {:?}", codec.paths().collect::<Vec<_>>());

    // Columns follow path order: phi_g, phi_p, w.
    let mut outer = StdWorkflow::builder(Pso::new(vec![0.0, 0.0, 0.0], vec![3.0, 3.0, 1.0], INSTANCES)?, problem)
        .solution_transform(codec)
        .monitor(EvalMonitor::new())
        .config(WorkflowConfig::new("outer_pso").with_seed(1))
        .build()?;
    let mut state = outer.init()?;
    for generation in 0..10 {
        state = outer.step(&state)?;
        let best = outer.monitor_metric(&state, "monitor")?;
        println!("outer generation {generation}: best inner fitness {best}");
    }

    let space = SearchSpace::new()
        .add_float("algorithm.w", 0.1, 0.9)
        .add_log_uniform("algorithm.phi_p", 0.1, 4.0)
        .add_float("algorithm.phi_g", 0.1, 3.0);
    let config = TunerConfig::new("ackley_random", space, StrategyKind::Random)
        .with_max_trials(32)
        .with_seed(7);
    let mut tuner = Tuner::new(inner_problem(30)?, config)?;
    let run = tuner.run()?;
    if let Some(best) = &run.best_trial {
        println!("random search best {:.6} with {:?}", best.objective, best.parameters);
    }
    Ok(())
}
