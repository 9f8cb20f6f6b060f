//! Conversion between dense candidate batches and named parameter batches.

use std::collections::BTreeMap;

use ndarray::{s, Array2, IxDyn};
use serde::{Deserialize, Serialize};

use ef_types::{as_matrix, Candidates, EfResult, SolutionTransform, StructureError, Tensor, WorkflowError};

/// Flattens named per-instance arrays into the columns of an `(N, D)` batch,
/// in path order, and back.
///
/// As a [`SolutionTransform`] it lets any vector-based algorithm drive a
/// problem that takes named parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamCodec {
    fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Field {
    path: String,
    shape: Vec<usize>,
    offset: usize,
    size: usize,
}

impl ParamCodec {
    /// `shapes` maps each path to its per-instance shape.
    pub fn new(shapes: BTreeMap<String, Vec<usize>>) -> Self {
        let mut offset = 0;
        let fields = shapes
            .into_iter()
            .map(|(path, shape)| {
                let size = shape.iter().product();
                let field = Field {
                    path,
                    shape,
                    offset,
                    size,
                };
                offset += size;
                field
            })
            .collect();
        Self { fields }
    }

    /// Derive the layout from a named batch, ignoring its leading axis.
    pub fn from_params(params: &BTreeMap<String, Tensor>) -> EfResult<Self> {
        let mut shapes = BTreeMap::new();
        for (path, value) in params {
            if value.ndim() == 0 {
                return Err(StructureError::ShapeMismatch {
                    context: path.clone(),
                    expected: vec![0],
                    actual: vec![],
                }
                .into());
            }
            shapes.insert(path.clone(), value.shape()[1..].to_vec());
        }
        Ok(Self::new(shapes))
    }

    /// Width of the dense representation.
    pub fn dim(&self) -> usize {
        self.fields.iter().map(|f| f.size).sum()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.path.as_str())
    }

    pub fn encode(&self, params: &BTreeMap<String, Tensor>) -> EfResult<Tensor> {
        let n = match self.fields.first() {
            Some(field) => leading_dim(field, params)?,
            None => 0,
        };
        let mut dense = Array2::zeros((n, self.dim()));
        for field in &self.fields {
            let rows = leading_dim(field, params)?;
            let value = params
                .get(&field.path)
                .ok_or_else(|| missing_field(&field.path))?;
            let mut expected = vec![n];
            expected.extend_from_slice(&field.shape);
            if rows != n || value.shape() != expected.as_slice() {
                return Err(StructureError::ShapeMismatch {
                    context: field.path.clone(),
                    expected,
                    actual: value.shape().to_vec(),
                }
                .into());
            }
            let block = Array2::from_shape_vec((n, field.size), value.iter().copied().collect())?;
            dense
                .slice_mut(s![.., field.offset..field.offset + field.size])
                .assign(&block);
        }
        Ok(dense.into_dyn())
    }

    pub fn decode(&self, dense: &Tensor) -> EfResult<BTreeMap<String, Tensor>> {
        let batch = as_matrix(dense, "encoded parameters")?;
        if batch.ncols() != self.dim() {
            return Err(StructureError::ShapeMismatch {
                context: "encoded parameters".into(),
                expected: vec![batch.nrows(), self.dim()],
                actual: batch.shape().to_vec(),
            }
            .into());
        }
        let n = batch.nrows();
        self.fields
            .iter()
            .map(|field| -> EfResult<(String, Tensor)> {
                let mut shape = vec![n];
                shape.extend_from_slice(&field.shape);
                let block = batch
                    .slice(s![.., field.offset..field.offset + field.size])
                    .to_owned()
                    .into_shape(IxDyn(&shape))?;
                Ok((field.path.clone(), block))
            })
            .collect()
    }
}

fn leading_dim(field: &Field, params: &BTreeMap<String, Tensor>) -> EfResult<usize> {
    params
        .get(&field.path)
        .ok_or_else(|| missing_field(&field.path))?
        .shape()
        .first()
        .copied()
        .ok_or_else(|| ef_types::validation_error!("parameter {} has no instance axis", field.path))
}

fn missing_field(path: &str) -> ef_types::EfError {
    WorkflowError::InputMismatch {
        message: format!("missing parameter {path}"),
    }
    .into()
}

impl SolutionTransform for ParamCodec {
    fn transform(&self, candidates: Candidates) -> EfResult<Candidates> {
        Ok(Candidates::Named(self.decode(candidates.as_dense()?)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ef_types::{matrix, vector};

    fn codec() -> ParamCodec {
        ParamCodec::new(BTreeMap::from([
            ("algorithm.w".to_string(), vec![]),
            ("problem.scale".to_string(), vec![2]),
        ]))
    }

    #[test]
    fn decode_splits_columns_in_path_order() {
        let codec = codec();
        assert_eq!(codec.dim(), 3);
        assert_eq!(codec.paths().collect::<Vec<_>>(), vec!["algorithm.w", "problem.scale"]);

        let dense = matrix(2, 3, vec![0.1, 1.0, 2.0, 0.2, 3.0, 4.0]).unwrap();
        let named = codec.decode(&dense).unwrap();
        assert_eq!(named["algorithm.w"], vector(vec![0.1, 0.2]));
        assert_eq!(named["problem.scale"], matrix(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap());
        assert_eq!(codec.encode(&named).unwrap(), dense);
    }

    #[test]
    fn layout_from_params_matches() {
        let params = BTreeMap::from([
            ("algorithm.w".to_string(), vector(vec![0.1, 0.2])),
            ("problem.scale".to_string(), matrix(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap()),
        ]);
        assert_eq!(ParamCodec::from_params(&params).unwrap(), codec());
    }

    #[test]
    fn wrong_width_or_kind_rejected() {
        let codec = codec();
        assert!(codec.decode(&matrix(2, 2, vec![0.0; 4]).unwrap()).is_err());
        assert!(codec.transform(Candidates::Named(BTreeMap::new())).is_err());

        let short = BTreeMap::from([("algorithm.w".to_string(), vector(vec![0.1]))]);
        assert!(codec.encode(&short).is_err());
    }

    #[test]
    fn transform_produces_named_candidates() {
        let codec = codec();
        let dense = Candidates::Dense(matrix(1, 3, vec![0.5, 1.0, 1.5]).unwrap());
        let named = codec.transform(dense).unwrap();
        assert_eq!(named.len().unwrap(), 1);
        assert_eq!(named.as_named().unwrap()["algorithm.w"], vector(vec![0.5]));
    }
}
