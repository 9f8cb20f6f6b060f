//! Explicit random keys.
//!
//! No component reads a process-wide RNG. A workflow keeps an [`RngKey`] in
//! its root local state, and every random draw comes from a ChaCha stream
//! derived from that key plus the call site (generation, node, lane, stage).

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{EfResult, StructureError};
use crate::tensor::{vector, Tensor};

/// Random number generator handed to components.
pub type Rng = ChaCha8Rng;

/// Stream used when drawing initial state.
pub const INIT_STREAM: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RngKey(u64);

impl RngKey {
    pub fn new(seed: u64) -> Self {
        Self(splitmix64(seed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Derive an independent key from this one and `data`.
    pub fn fold_in(self, data: u64) -> Self {
        Self(splitmix64(self.0 ^ splitmix64(data.wrapping_add(0x9E37_79B9_7F4A_7C15))))
    }

    pub fn rng(self, stream: u64) -> Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.0);
        rng.set_stream(stream);
        rng
    }

    /// Encode as a `[hi, lo]` tensor of 32-bit halves; both halves are exact in `f64`.
    pub fn to_tensor(self) -> Tensor {
        vector(vec![(self.0 >> 32) as f64, (self.0 & 0xFFFF_FFFF) as f64])
    }

    pub fn from_tensor(tensor: &Tensor) -> EfResult<Self> {
        if tensor.shape() != [2] {
            return Err(StructureError::ShapeMismatch {
                context: "rng key".into(),
                expected: vec![2],
                actual: tensor.shape().to_vec(),
            }
            .into());
        }
        let mut halves = [0u64; 2];
        for (slot, &v) in halves.iter_mut().zip(tensor.iter()) {
            if !(0.0..4_294_967_296.0).contains(&v) || v.fract() != 0.0 {
                return Err(crate::validation_error!("rng key half {v} is not a 32-bit integer"));
            }
            *slot = v as u64;
        }
        Ok(Self((halves[0] << 32) | halves[1]))
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
