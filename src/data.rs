/*!
Observation sets fed to the variational models.

An [`Observations`] value is an immutable `N x D` matrix of data points with
optional ground-truth component labels (`zn`) kept around for visualisation.
Data is either loaded from disk (see [`crate::io::csv`]) or generated
synthetically with a seeded RNG.

# Examples

```rust
use mini_cavi::data::Observations;

let data = Observations::synthetic_univariate(100, 7.0, 42).unwrap();
assert_eq!(data.n(), 100);
assert_eq!(data.d(), 1);
```
*/

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::error::{CaviError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Observations {
    xn: Array2<f64>,
    zn: Option<Array1<usize>>,
}

impl Observations {
    /// Wraps an `N x D` data matrix and optional labels after validating them.
    pub fn new(xn: Array2<f64>, zn: Option<Array1<usize>>) -> Result<Self> {
        let (n, d) = xn.dim();
        if n == 0 || d == 0 {
            return Err(CaviError::InvalidData {
                reason: format!("expected a non-empty N x D matrix, got {n} x {d}"),
            });
        }
        if let Some((idx, v)) = xn.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(CaviError::InvalidData {
                reason: format!("non-finite value {v} at row {}, column {}", idx / d, idx % d),
            });
        }
        if let Some(labels) = &zn {
            if labels.len() != n {
                return Err(CaviError::InvalidData {
                    reason: format!("got {} labels for {n} observations", labels.len()),
                });
            }
        }
        Ok(Self { xn, zn })
    }

    /// Builds a one-dimensional observation set from scalar samples.
    pub fn from_scalars(values: Vec<f64>) -> Result<Self> {
        let n = values.len();
        let xn = Array2::from_shape_vec((n, 1), values).map_err(|e| CaviError::InvalidData {
            reason: e.to_string(),
        })?;
        Self::new(xn, None)
    }

    /// Draws `n` points from `Normal(mean, 1)`.
    pub fn synthetic_univariate(n: usize, mean: f64, seed: u64) -> Result<Self> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let normal = Normal::new(mean, 1.0).map_err(|e| CaviError::InvalidData {
            reason: e.to_string(),
        })?;
        Self::from_scalars(normal.sample_iter(&mut rng).take(n).collect())
    }

    /// Draws `n` labelled points from an equally weighted mixture of isotropic
    /// Gaussians with the given `K x D` centers and standard deviation `scale`.
    pub fn synthetic_mixture(
        n: usize,
        centers: ArrayView2<f64>,
        scale: f64,
        seed: u64,
    ) -> Result<Self> {
        let (k, d) = centers.dim();
        if k == 0 {
            return Err(CaviError::InvalidData {
                reason: "at least one mixture center is required".to_string(),
            });
        }
        let noise = Normal::new(0.0, scale).map_err(|e| CaviError::InvalidData {
            reason: e.to_string(),
        })?;
        let mut rng = SmallRng::seed_from_u64(seed);
        let zn: Array1<usize> = (0..n).map(|_| rng.gen_range(0..k)).collect();
        let xn = Array2::from_shape_fn((n, d), |(i, j)| {
            centers[(zn[i], j)] + noise.sample(&mut rng)
        });
        Self::new(xn, Some(zn))
    }

    /// `K x D` centers spread evenly along the main diagonal of `[-spread, spread]^D`,
    /// e.g. `(-5, -5)` and `(5, 5)` for two components in two dimensions.
    pub fn diagonal_centers(k: usize, d: usize, spread: f64) -> Array2<f64> {
        Array2::from_shape_fn((k, d), |(i, _)| {
            if k > 1 {
                spread * (2.0 * i as f64 / (k - 1) as f64 - 1.0)
            } else {
                0.0
            }
        })
    }

    /// Number of observations `N`.
    pub fn n(&self) -> usize {
        self.xn.nrows()
    }

    /// Dimensionality `D`.
    pub fn d(&self) -> usize {
        self.xn.ncols()
    }

    pub fn xn(&self) -> ArrayView2<f64> {
        self.xn.view()
    }

    pub fn zn(&self) -> Option<ArrayView1<usize>> {
        self.zn.as_ref().map(|z| z.view())
    }

    /// Coordinate `j` of every observation; column 0 is the data of a univariate model.
    pub fn column(&self, j: usize) -> ArrayView1<f64> {
        self.xn.column(j)
    }
}
