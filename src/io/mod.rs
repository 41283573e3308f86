//! Reading datasets and writing fit results.

pub mod csv;
