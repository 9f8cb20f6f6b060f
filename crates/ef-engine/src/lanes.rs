//! Lockstep execution over batched states.
//!
//! A state with batch dims `[a, b]` is flattened into `a * b` unbatched lanes
//! in row-major order. Each stage of a step runs across every lane before the
//! next stage starts, and the lanes are restacked afterwards.

use ef_types::{EfResult, State, StructureError};
use rayon::prelude::*;

/// Split a state into unbatched lanes. Returns the lanes and the batch dims
/// needed to restack them.
pub fn flatten(state: &State) -> EfResult<(Vec<State>, Vec<usize>)> {
    let dims = state.batch_dims().to_vec();
    let mut lanes = vec![state.clone()];
    for _ in 0..dims.len() {
        let mut next = Vec::new();
        for lane in &lanes {
            next.extend(lane.unstack()?);
        }
        lanes = next;
    }
    Ok((lanes, dims))
}

/// Inverse of [`flatten`].
pub fn unflatten(lanes: Vec<State>, dims: &[usize]) -> EfResult<State> {
    let expected: usize = dims.iter().product();
    if lanes.is_empty() {
        return Err(StructureError::EmptyStack.into());
    }
    if lanes.len() != expected {
        return Err(StructureError::StackMismatch {
            message: format!("{} lanes cannot fill batch dims {dims:?}", lanes.len()),
        }
        .into());
    }
    match dims.split_first() {
        None => Ok(lanes.into_iter().next().unwrap_or_default()),
        Some((_, inner)) => {
            let chunk: usize = inner.iter().product();
            let groups = lanes
                .chunks(chunk)
                .map(|group| unflatten(group.to_vec(), inner))
                .collect::<EfResult<Vec<State>>>()?;
            State::stack(&groups)
        }
    }
}

/// Run `f` on every lane. Results keep lane order and the first failing lane's
/// error is returned.
pub(crate) fn run_stage<T, F>(lanes: &mut [T], parallel: bool, f: F) -> EfResult<()>
where
    T: Send,
    F: Fn(usize, &mut T) -> EfResult<()> + Sync + Send,
{
    let results: Vec<EfResult<()>> = if parallel && lanes.len() > 1 {
        lanes
            .par_iter_mut()
            .enumerate()
            .map(|(i, lane)| f(i, lane))
            .collect()
    } else {
        lanes
            .iter_mut()
            .enumerate()
            .map(|(i, lane)| f(i, lane))
            .collect()
    };
    results.into_iter().collect()
}
