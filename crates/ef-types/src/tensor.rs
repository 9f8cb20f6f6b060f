//! Numeric leaf type and the small set of batch-agnostic helpers the core needs.
//!
//! Every helper treats axis 0 as the batch (population or instance) axis and
//! leaves the trailing axes untouched.

use ndarray::{arr0, Array1, ArrayD, ArrayView1, ArrayView2, Axis, Ix1, Ix2, IxDyn};

use crate::errors::{EfResult, StructureError};

/// Dynamic-rank `f64` array used for every numeric leaf in a [`State`](crate::State).
pub type Tensor = ArrayD<f64>;

pub fn scalar(value: f64) -> Tensor {
    arr0(value).into_dyn()
}

pub fn vector(values: Vec<f64>) -> Tensor {
    Array1::from(values).into_dyn()
}

pub fn matrix(rows: usize, cols: usize, data: Vec<f64>) -> EfResult<Tensor> {
    Ok(ArrayD::from_shape_vec(IxDyn(&[rows, cols]), data)?)
}

pub fn full(shape: &[usize], value: f64) -> Tensor {
    ArrayD::from_elem(IxDyn(shape), value)
}

/// Read a single number out of a rank-0 or one-element tensor.
pub fn scalar_value(tensor: &Tensor) -> EfResult<f64> {
    if tensor.len() != 1 {
        return Err(StructureError::ShapeMismatch {
            context: "scalar".into(),
            expected: vec![],
            actual: tensor.shape().to_vec(),
        }
        .into());
    }
    tensor
        .iter()
        .next()
        .copied()
        .ok_or_else(|| crate::internal_error!("one-element tensor yielded no value"))
}

pub fn as_vector<'a>(tensor: &'a Tensor, context: &str) -> EfResult<ArrayView1<'a, f64>> {
    tensor.view().into_dimensionality::<Ix1>().map_err(|_| {
        StructureError::ShapeMismatch {
            context: format!("{context} (rank 1)"),
            expected: vec![tensor.len()],
            actual: tensor.shape().to_vec(),
        }
        .into()
    })
}

pub fn as_matrix<'a>(tensor: &'a Tensor, context: &str) -> EfResult<ArrayView2<'a, f64>> {
    tensor.view().into_dimensionality::<Ix2>().map_err(|_| {
        StructureError::ShapeMismatch {
            context: format!("{context} (rank 2)"),
            expected: vec![],
            actual: tensor.shape().to_vec(),
        }
        .into()
    })
}

/// Stack equally-shaped tensors along a new leading axis.
pub fn stack_leading(tensors: &[Tensor]) -> EfResult<Tensor> {
    let first = tensors.first().ok_or(StructureError::EmptyStack)?;
    for tensor in tensors.iter().skip(1) {
        if tensor.shape() != first.shape() {
            return Err(StructureError::ShapeMismatch {
                context: "stacked leaf".into(),
                expected: first.shape().to_vec(),
                actual: tensor.shape().to_vec(),
            }
            .into());
        }
    }
    let views: Vec<_> = tensors.iter().map(|t| t.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

/// Split a tensor along its leading axis.
pub fn unstack_leading(tensor: &Tensor) -> EfResult<Vec<Tensor>> {
    if tensor.ndim() == 0 {
        return Err(StructureError::NotBatched.into());
    }
    Ok(tensor
        .axis_iter(Axis(0))
        .map(|view| view.to_owned())
        .collect())
}

/// Broadcast `tensor` to `(n, ...tensor.shape)` by repeating it `n` times.
pub fn repeat_leading(tensor: &Tensor, n: usize) -> Tensor {
    let mut shape = Vec::with_capacity(tensor.ndim() + 1);
    shape.push(n);
    shape.extend_from_slice(tensor.shape());
    let mut out = ArrayD::zeros(IxDyn(&shape));
    for mut row in out.axis_iter_mut(Axis(0)) {
        row.assign(tensor);
    }
    out
}

/// Index of the smallest value; NaN entries are skipped and ties resolve to
/// the first occurrence.
pub fn argmin_first(values: ArrayView1<'_, f64>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v >= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Per-row select along the leading axis: row `i` comes from `on_true` when
/// `mask[i]` holds, else from `on_false`.
pub fn select(mask: &[bool], on_true: &Tensor, on_false: &Tensor) -> EfResult<Tensor> {
    if on_true.shape() != on_false.shape() {
        return Err(StructureError::ShapeMismatch {
            context: "select branches".into(),
            expected: on_true.shape().to_vec(),
            actual: on_false.shape().to_vec(),
        }
        .into());
    }
    if on_true.ndim() == 0 || on_true.shape()[0] != mask.len() {
        return Err(StructureError::ShapeMismatch {
            context: "select mask".into(),
            expected: vec![mask.len()],
            actual: on_true.shape().to_vec(),
        }
        .into());
    }
    let mut out = on_false.clone();
    for (i, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
        if mask[i] {
            row.assign(&on_true.index_axis(Axis(0), i));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn scalar_round_trip() {
        assert_eq!(scalar_value(&scalar(2.5)).unwrap(), 2.5);
        assert_eq!(scalar_value(&vector(vec![7.0])).unwrap(), 7.0);
        assert!(scalar_value(&vector(vec![1.0, 2.0])).is_err());
    }

    #[test]
    fn stack_and_unstack_leading() {
        let a = vector(vec![1.0, 2.0]);
        let b = vector(vec![3.0, 4.0]);
        let stacked = stack_leading(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(stacked.shape(), &[2, 2]);
        assert_eq!(unstack_leading(&stacked).unwrap(), vec![a, b]);
    }

    #[test]
    fn stack_rejects_mismatched_shapes() {
        let err = stack_leading(&[vector(vec![1.0]), vector(vec![1.0, 2.0])]).unwrap_err();
        assert!(err.to_string().contains("stacked leaf"));
    }

    #[test]
    fn repeat_leading_broadcasts() {
        let t = vector(vec![0.5, 1.5]);
        let r = repeat_leading(&t, 3);
        assert_eq!(r.shape(), &[3, 2]);
        for row in r.axis_iter(Axis(0)) {
            assert_eq!(row, t.view());
        }
        assert_eq!(repeat_leading(&scalar(1.0), 4).shape(), &[4]);
    }

    #[test]
    fn argmin_prefers_first_occurrence_and_skips_nan() {
        let values = array![3.0, f64::NAN, 1.0, 1.0, 2.0];
        assert_eq!(argmin_first(values.view()), Some(2));
        let all_nan = array![f64::NAN, f64::NAN];
        assert_eq!(argmin_first(all_nan.view()), None);
    }

    #[test]
    fn select_picks_rows() {
        let a = matrix(2, 2, vec![1.0, 1.0, 2.0, 2.0]).unwrap();
        let b = matrix(2, 2, vec![9.0, 9.0, 8.0, 8.0]).unwrap();
        let out = select(&[false, true], &a, &b).unwrap();
        assert_eq!(out, matrix(2, 2, vec![9.0, 9.0, 2.0, 2.0]).unwrap());
        assert!(select(&[true], &a, &b).is_err());
    }
}
