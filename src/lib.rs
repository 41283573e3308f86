//! Coordinate ascent variational inference (CAVI) for two conjugate Gaussian models:
//!
//! - [`univariate`]: a Normal-Gamma model of scalar data with closed-form updates,
//! - [`mixture`]: a mixture of Gaussians with known precision, optimised one
//!   factor at a time by a backtracking [`line_search`].
//!
//! Both plug into the driver in [`core`], which sweeps until the ELBO stops moving.

pub mod convergence;
pub mod core;
pub mod data;
pub mod error;
pub mod gradient;
pub mod io;
pub mod line_search;
pub mod mixture;
pub mod numerics;
pub mod univariate;
