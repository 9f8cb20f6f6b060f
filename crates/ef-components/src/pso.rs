//! Particle swarm optimization.

use ndarray::{Array1, Array2};
use rand::Rng as _;
use tracing::debug;

use ef_types::{
    argmin_first, as_matrix, as_vector, full, scalar, scalar_value, validation_error, Algorithm, Candidates,
    EfResult, LocalState, Module, NodeContext, Rng, Schema, StepContext, StructureError, Tensor,
};

pub const POPULATION: &str = "population";
pub const VELOCITY: &str = "velocity";
pub const LOCAL_BEST_LOCATION: &str = "local_best_location";
pub const LOCAL_BEST_FITNESS: &str = "local_best_fitness";
pub const GLOBAL_BEST_LOCATION: &str = "global_best_location";
pub const GLOBAL_BEST_FITNESS: &str = "global_best_fitness";

/// Inertia weight.
pub const W: &str = "w";
/// Cognitive coefficient.
pub const PHI_P: &str = "phi_p";
/// Social coefficient.
pub const PHI_G: &str = "phi_g";

/// Canonical PSO over a box `[lb, ub]`.
///
/// `w`, `phi_p` and `phi_g` are parameters: they live in State and are read
/// back on every `tell`, so a batched state can carry a different setting per
/// lane.
#[derive(Debug, Clone)]
pub struct Pso {
    lb: Array1<f64>,
    ub: Array1<f64>,
    pop_size: usize,
    w: f64,
    phi_p: f64,
    phi_g: f64,
}

impl Pso {
    pub fn new(lb: Vec<f64>, ub: Vec<f64>, pop_size: usize) -> EfResult<Self> {
        if lb.is_empty() || lb.len() != ub.len() {
            return Err(validation_error!(
                "bounds must be non-empty and equally long (lb: {}, ub: {})",
                lb.len(),
                ub.len()
            ));
        }
        if let Some(i) = lb.iter().zip(&ub).position(|(l, u)| !(l < u)) {
            return Err(validation_error!("lower bound {} must be below upper bound {} at index {}", lb[i], ub[i], i));
        }
        if pop_size == 0 {
            return Err(validation_error!("population size must be positive"));
        }
        Ok(Self {
            lb: Array1::from(lb),
            ub: Array1::from(ub),
            pop_size,
            w: 0.6,
            phi_p: 2.5,
            phi_g: 0.8,
        })
    }

    pub fn with_w(mut self, w: f64) -> Self {
        self.w = w;
        self
    }

    pub fn with_phi_p(mut self, phi_p: f64) -> Self {
        self.phi_p = phi_p;
        self
    }

    pub fn with_phi_g(mut self, phi_g: f64) -> Self {
        self.phi_g = phi_g;
        self
    }

    pub fn dim(&self) -> usize {
        self.lb.len()
    }

    fn uniform(&self, rng: &mut Rng, low: &Array1<f64>, high: &Array1<f64>) -> Array2<f64> {
        let mut batch = Array2::zeros((self.pop_size, self.dim()));
        for mut row in batch.rows_mut() {
            for ((v, l), h) in row.iter_mut().zip(low).zip(high) {
                *v = l + (h - l) * rng.gen::<f64>();
            }
        }
        batch
    }

    fn clamp(&self, mut batch: Array2<f64>) -> Array2<f64> {
        for mut row in batch.rows_mut() {
            for ((v, l), u) in row.iter_mut().zip(&self.lb).zip(&self.ub) {
                *v = v.clamp(*l, *u);
            }
        }
        batch
    }
}

impl Module for Pso {
    fn schema(&self) -> Schema {
        Schema::new()
            .constant("lb", self.lb.clone().into_dyn())
            .constant("ub", self.ub.clone().into_dyn())
            .constant("pop_size", scalar(self.pop_size as f64))
            .parameter(W, scalar(self.w))
            .parameter(PHI_P, scalar(self.phi_p))
            .parameter(PHI_G, scalar(self.phi_g))
            .population(POPULATION)
            .population(VELOCITY)
            .population(LOCAL_BEST_LOCATION)
            .population(LOCAL_BEST_FITNESS)
            .mutable(GLOBAL_BEST_LOCATION)
            .mutable(GLOBAL_BEST_FITNESS)
    }

    fn init_state(&self, _ctx: &NodeContext, rng: &mut Rng) -> EfResult<LocalState> {
        let span = &self.ub - &self.lb;
        let population = self.uniform(rng, &self.lb, &self.ub);
        let velocity = self.uniform(rng, &span.mapv(|s| -s), &span);
        let global_best_location = population.row(0).to_owned();
        Ok(LocalState::new()
            .with(LOCAL_BEST_LOCATION, population.clone().into_dyn())
            .with(POPULATION, population.into_dyn())
            .with(VELOCITY, velocity.into_dyn())
            .with(LOCAL_BEST_FITNESS, full(&[self.pop_size], f64::INFINITY))
            .with(GLOBAL_BEST_LOCATION, global_best_location.into_dyn())
            .with(GLOBAL_BEST_FITNESS, scalar(f64::INFINITY)))
    }
}

impl Algorithm for Pso {
    fn ask(&self, _ctx: &mut StepContext<'_>, local: &LocalState) -> EfResult<(Candidates, LocalState)> {
        let population = local.tensor(POPULATION)?.clone();
        Ok((Candidates::Dense(population), local.clone()))
    }

    fn tell(&self, ctx: &mut StepContext<'_>, local: &LocalState, fitness: &Tensor) -> EfResult<LocalState> {
        let fitness = as_vector(fitness, "fitness")?;
        if fitness.len() != self.pop_size {
            return Err(StructureError::ShapeMismatch {
                context: "pso fitness".into(),
                expected: vec![self.pop_size],
                actual: vec![fitness.len()],
            }
            .into());
        }
        let w = scalar_value(local.tensor(W)?)?;
        let phi_p = scalar_value(local.tensor(PHI_P)?)?;
        let phi_g = scalar_value(local.tensor(PHI_G)?)?;
        let population = as_matrix(local.tensor(POPULATION)?, POPULATION)?;
        let velocity = as_matrix(local.tensor(VELOCITY)?, VELOCITY)?;
        let mut local_best_location = as_matrix(local.tensor(LOCAL_BEST_LOCATION)?, LOCAL_BEST_LOCATION)?.to_owned();
        let mut local_best_fitness = as_vector(local.tensor(LOCAL_BEST_FITNESS)?, LOCAL_BEST_FITNESS)?.to_owned();
        let mut global_best_location =
            as_vector(local.tensor(GLOBAL_BEST_LOCATION)?, GLOBAL_BEST_LOCATION)?.to_owned();
        let mut global_best_fitness = scalar_value(local.tensor(GLOBAL_BEST_FITNESS)?)?;

        for (i, &f) in fitness.iter().enumerate() {
            if f < local_best_fitness[i] {
                local_best_fitness[i] = f;
                local_best_location.row_mut(i).assign(&population.row(i));
            }
        }

        // The incumbent keeps the global best on ties.
        if let Some(idx) = argmin_first(fitness) {
            if fitness[idx] < global_best_fitness {
                debug!(
                    node = ctx.node.display_path(),
                    generation = ctx.generation,
                    lane = ctx.lane,
                    fitness = fitness[idx],
                    "New global best"
                );
                global_best_fitness = fitness[idx];
                global_best_location = population.row(idx).to_owned();
            }
        }

        let rng = ctx.rng();
        let shape = (self.pop_size, self.dim());
        let rp = Array2::from_shape_simple_fn(shape, || rng.gen::<f64>());
        let rg = Array2::from_shape_simple_fn(shape, || rng.gen::<f64>());

        let cognitive = &(&local_best_location - &population) * &rp * phi_p;
        let social = -(&population - &global_best_location) * &rg * phi_g;
        let velocity = &velocity * w + cognitive + social;
        let population = self.clamp(&population + &velocity);
        let velocity = self.clamp(velocity);

        Ok(local
            .clone()
            .with(POPULATION, population.into_dyn())
            .with(VELOCITY, velocity.into_dyn())
            .with(LOCAL_BEST_LOCATION, local_best_location.into_dyn())
            .with(LOCAL_BEST_FITNESS, local_best_fitness.into_dyn())
            .with(GLOBAL_BEST_LOCATION, global_best_location.into_dyn())
            .with(GLOBAL_BEST_FITNESS, scalar(global_best_fitness)))
    }

    fn pop_size(&self) -> Option<usize> {
        Some(self.pop_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ef_types::{vector, NodeId, RngKey};

    fn node() -> NodeContext {
        NodeContext {
            id: NodeId(1),
            path: "algorithm".into(),
        }
    }

    fn init(pso: &Pso, seed: u64) -> LocalState {
        let mut local = LocalState::new()
            .with(W, scalar(pso.w))
            .with(PHI_P, scalar(pso.phi_p))
            .with(PHI_G, scalar(pso.phi_g));
        let fresh = pso.init_state(&node(), &mut RngKey::new(seed).rng(0)).unwrap();
        for (name, value) in fresh.iter() {
            local.insert(name, value.clone());
        }
        local
    }

    #[test]
    fn rejects_bad_bounds() {
        assert!(Pso::new(vec![], vec![], 4).is_err());
        assert!(Pso::new(vec![0.0], vec![1.0, 2.0], 4).is_err());
        assert!(Pso::new(vec![1.0], vec![1.0], 4).is_err());
        assert!(Pso::new(vec![f64::NAN], vec![1.0], 4).is_err());
        assert!(Pso::new(vec![0.0], vec![1.0], 0).is_err());
    }

    #[test]
    fn schema_declares_roles() {
        let pso = Pso::new(vec![-1.0, -1.0], vec![1.0, 1.0], 8).unwrap();
        let schema = pso.schema();
        assert!(schema.validate().is_ok());
        let params: Vec<_> = schema.parameters().map(|a| a.name.as_str()).collect();
        assert_eq!(params, vec![W, PHI_P, PHI_G]);
        assert_eq!(schema.get(POPULATION).unwrap().population_axis, Some(0));
        assert_eq!(schema.get(GLOBAL_BEST_FITNESS).unwrap().population_axis, None);
        let local = init(&pso, 0);
        assert!(schema.check_local("algorithm", &local).is_ok());
    }

    #[test]
    fn init_stays_in_bounds() {
        let pso = Pso::new(vec![-2.0, 0.0], vec![2.0, 1.0], 50).unwrap();
        let local = init(&pso, 7);
        let population = as_matrix(local.tensor(POPULATION).unwrap(), "p").unwrap();
        assert_eq!(population.shape(), &[50, 2]);
        for row in population.rows() {
            assert!((-2.0..=2.0).contains(&row[0]));
            assert!((0.0..=1.0).contains(&row[1]));
        }
        let velocity = as_matrix(local.tensor(VELOCITY).unwrap(), "v").unwrap();
        for row in velocity.rows() {
            assert!((-4.0..=4.0).contains(&row[0]));
            assert!((-1.0..=1.0).contains(&row[1]));
        }
    }

    #[test]
    fn tell_updates_bests_with_first_occurrence() {
        let pso = Pso::new(vec![-1.0], vec![1.0], 3).unwrap();
        let local = init(&pso, 3);
        let population = local.tensor(POPULATION).unwrap().clone();
        let node = node();
        let mut ctx = StepContext::new(&node, RngKey::new(3), 0, 0, 3);
        let next = pso
            .tell(&mut ctx, &local, &vector(vec![0.5, 0.25, 0.25]))
            .unwrap();
        assert_eq!(scalar_value(next.tensor(GLOBAL_BEST_FITNESS).unwrap()).unwrap(), 0.25);
        let expected = as_matrix(&population, "p").unwrap().row(1).to_owned().into_dyn();
        assert_eq!(next.tensor(GLOBAL_BEST_LOCATION).unwrap(), &expected);
        assert_eq!(next.tensor(LOCAL_BEST_FITNESS).unwrap(), &vector(vec![0.5, 0.25, 0.25]));

        let population = as_matrix(next.tensor(POPULATION).unwrap(), "p").unwrap();
        assert!(population.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn nan_fitness_never_becomes_best() {
        let pso = Pso::new(vec![-1.0], vec![1.0], 2).unwrap();
        let local = init(&pso, 5);
        let node = node();
        let mut ctx = StepContext::new(&node, RngKey::new(5), 0, 0, 3);
        let next = pso.tell(&mut ctx, &local, &vector(vec![f64::NAN, f64::NAN])).unwrap();
        assert!(scalar_value(next.tensor(GLOBAL_BEST_FITNESS).unwrap()).unwrap().is_infinite());
    }

    #[test]
    fn wrong_fitness_length_rejected() {
        let pso = Pso::new(vec![-1.0], vec![1.0], 2).unwrap();
        let local = init(&pso, 5);
        let node = node();
        let mut ctx = StepContext::new(&node, RngKey::new(5), 0, 0, 3);
        assert!(pso.tell(&mut ctx, &local, &vector(vec![1.0])).is_err());
    }

    #[test]
    fn parameters_are_read_from_state() {
        let pso = Pso::new(vec![-1.0], vec![1.0], 4).unwrap();
        let node = node();
        let frozen = init(&pso, 9)
            .with(W, scalar(0.0))
            .with(PHI_P, scalar(0.0))
            .with(PHI_G, scalar(0.0));
        let mut ctx = StepContext::new(&node, RngKey::new(9), 0, 0, 3);
        let next = pso.tell(&mut ctx, &frozen, &vector(vec![1.0, 2.0, 3.0, 4.0])).unwrap();
        assert_eq!(next.tensor(POPULATION).unwrap(), frozen.tensor(POPULATION).unwrap());
        assert!(next.tensor(VELOCITY).unwrap().iter().all(|v| *v == 0.0));
    }
}
