//! Loop and branch combinators over values and over batches of lanes.
//!
//! The batched forms keep every lane in lockstep: a batched loop runs its
//! body on all lanes each round and keeps the new value only where the lane's
//! condition held, and a batched switch evaluates both branches for every
//! lane before selecting.

use ef_types::{EfResult, State, StructureError};

use crate::lanes;

/// Run `body` while `cond` holds.
pub fn while_loop<T, C, B>(init: T, mut cond: C, mut body: B) -> EfResult<T>
where
    C: FnMut(&T) -> EfResult<bool>,
    B: FnMut(T) -> EfResult<T>,
{
    let mut carry = init;
    while cond(&carry)? {
        carry = body(carry)?;
    }
    Ok(carry)
}

/// Lockstep loop over lanes. Lanes whose condition fails are frozen while the
/// others continue; the loop ends once no lane's condition holds.
pub fn batched_while_loop<T, C, B>(lanes: Vec<T>, mut cond: C, mut body: B) -> EfResult<Vec<T>>
where
    T: Clone,
    C: FnMut(&T) -> EfResult<bool>,
    B: FnMut(T) -> EfResult<T>,
{
    let mut lanes = lanes;
    loop {
        let mask = lanes.iter().map(&mut cond).collect::<EfResult<Vec<bool>>>()?;
        if !mask.iter().any(|m| *m) {
            return Ok(lanes);
        }
        let advanced = lanes
            .iter()
            .cloned()
            .map(&mut body)
            .collect::<EfResult<Vec<T>>>()?;
        lanes = select_lanes(&mask, advanced, lanes)?;
    }
}

/// Take `on_true` when `pred` holds, else `on_false`.
pub fn switch<T, F, G>(pred: bool, carry: T, on_true: F, on_false: G) -> EfResult<T>
where
    F: FnOnce(T) -> EfResult<T>,
    G: FnOnce(T) -> EfResult<T>,
{
    if pred {
        on_true(carry)
    } else {
        on_false(carry)
    }
}

/// Per-lane switch. Both branches run on every lane; each lane keeps the
/// branch its predicate selects.
pub fn batched_switch<T, F, G>(preds: &[bool], lanes: Vec<T>, mut on_true: F, mut on_false: G) -> EfResult<Vec<T>>
where
    T: Clone,
    F: FnMut(T) -> EfResult<T>,
    G: FnMut(T) -> EfResult<T>,
{
    if preds.len() != lanes.len() {
        return Err(StructureError::ShapeMismatch {
            context: "switch predicates".into(),
            expected: vec![lanes.len()],
            actual: vec![preds.len()],
        }
        .into());
    }
    let taken = lanes
        .iter()
        .cloned()
        .map(&mut on_true)
        .collect::<EfResult<Vec<T>>>()?;
    let not_taken = lanes.into_iter().map(&mut on_false).collect::<EfResult<Vec<T>>>()?;
    select_lanes(preds, taken, not_taken)
}

fn select_lanes<T>(mask: &[bool], on_true: Vec<T>, on_false: Vec<T>) -> EfResult<Vec<T>> {
    if on_true.len() != mask.len() || on_false.len() != mask.len() {
        return Err(StructureError::ShapeMismatch {
            context: "lane selection".into(),
            expected: vec![mask.len()],
            actual: vec![on_true.len(), on_false.len()],
        }
        .into());
    }
    Ok(mask
        .iter()
        .zip(on_true.into_iter().zip(on_false))
        .map(|(m, (t, f))| if *m { t } else { f })
        .collect())
}

/// Per-lane select between two batched states with identical batch dims.
pub fn select_state(mask: &[bool], on_true: &State, on_false: &State) -> EfResult<State> {
    if on_true.batch_dims() != on_false.batch_dims() {
        return Err(StructureError::StackMismatch {
            message: format!(
                "cannot select between batch dims {:?} and {:?}",
                on_true.batch_dims(),
                on_false.batch_dims()
            ),
        }
        .into());
    }
    let (taken, dims) = lanes::flatten(on_true)?;
    let (not_taken, _) = lanes::flatten(on_false)?;
    lanes::unflatten(select_lanes(mask, taken, not_taken)?, &dims)
}
