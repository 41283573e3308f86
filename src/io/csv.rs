/*!
# CSV datasets and fit exports

Datasets are stored with one row per observation: the coordinate columns come
first (conventionally named `x0`, `x1`, ...) and an optional `zn` column holds
integer ground-truth labels. Every column other than `zn` is read as a
coordinate, in file order.

# Examples

```rust
use mini_cavi::data::Observations;
use mini_cavi::io::csv::{load_observations, save_observations};

let data = Observations::synthetic_univariate(10, 7.0, 1).unwrap();
let path = std::env::temp_dir().join("mini_cavi_doc_dataset.csv");
save_observations(&data, &path).unwrap();
assert_eq!(load_observations(&path).unwrap(), data);
```
*/

use csv::{ReaderBuilder, Writer};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::path::Path;

use crate::data::Observations;
use crate::error::{CaviError, Result};

const LABEL_COLUMN: &str = "zn";

fn coordinate_header(d: usize) -> impl Iterator<Item = String> {
    (0..d).map(|j| format!("x{j}"))
}

/// Loads an observation set from a CSV file with a header row.
pub fn load_observations<P: AsRef<Path>>(path: P) -> Result<Observations> {
    let mut rdr = ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = rdr.headers()?.clone();
    let label_idx = headers.iter().position(|h| h.trim() == LABEL_COLUMN);
    let d = headers.len() - usize::from(label_idx.is_some());
    if d == 0 {
        return Err(CaviError::InvalidData {
            reason: "no coordinate columns found".to_string(),
        });
    }

    let mut values = Vec::new();
    let mut labels = Vec::new();
    let mut n = 0;
    for (row, record) in rdr.records().enumerate() {
        let record = record?;
        if record.len() != headers.len() {
            return Err(CaviError::InvalidData {
                reason: format!(
                    "row {row} has {} fields, expected {}",
                    record.len(),
                    headers.len()
                ),
            });
        }
        for (col, field) in record.iter().enumerate() {
            let field = field.trim();
            if Some(col) == label_idx {
                labels.push(field.parse::<usize>().map_err(|e| CaviError::InvalidData {
                    reason: format!("row {row}, column {LABEL_COLUMN}: {e}"),
                })?);
            } else {
                values.push(field.parse::<f64>().map_err(|e| CaviError::InvalidData {
                    reason: format!("row {row}, column {}: {e}", &headers[col]),
                })?);
            }
        }
        n += 1;
    }

    let xn = Array2::from_shape_vec((n, d), values).map_err(|e| CaviError::InvalidData {
        reason: e.to_string(),
    })?;
    let zn = label_idx.map(|_| Array1::from(labels));
    Observations::new(xn, zn)
}

/// Writes an observation set in the layout read by [`load_observations`].
pub fn save_observations<P: AsRef<Path>>(data: &Observations, path: P) -> Result<()> {
    let mut wtr = Writer::from_path(path)?;

    let mut header: Vec<String> = coordinate_header(data.d()).collect();
    if data.zn().is_some() {
        header.push(LABEL_COLUMN.to_string());
    }
    wtr.write_record(&header)?;

    for (i, x) in data.xn().rows().into_iter().enumerate() {
        let mut row: Vec<String> = x.iter().map(|v| v.to_string()).collect();
        if let Some(zn) = data.zn() {
            row.push(zn[i].to_string());
        }
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    Ok(())
}

/// Writes the ELBO trace as `sweep,elbo` rows, sweeps counted from 1.
pub fn save_trace<P: AsRef<Path>>(elbo_trace: &[f64], path: P) -> Result<()> {
    let mut wtr = Writer::from_path(path)?;
    wtr.write_record(["sweep", "elbo"])?;
    for (i, elbo) in elbo_trace.iter().enumerate() {
        wtr.write_record([(i + 1).to_string(), elbo.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}

/**
Writes the data together with the fitted hard assignments and responsibilities,
for plotting by an external tool.

Columns: `x0..x{D-1}`, `zn` (only if the data is labelled), `assignment`,
`phi0..phi{K-1}`. For a univariate fit pass a single-column `phi` of ones.
*/
pub fn save_assignments<P: AsRef<Path>>(
    data: &Observations,
    assignments: ArrayView1<usize>,
    phi: ArrayView2<f64>,
    path: P,
) -> Result<()> {
    if assignments.len() != data.n() || phi.nrows() != data.n() {
        return Err(CaviError::InvalidData {
            reason: format!(
                "{} assignments and {} responsibility rows for {} observations",
                assignments.len(),
                phi.nrows(),
                data.n()
            ),
        });
    }

    let mut wtr = Writer::from_path(path)?;
    let mut header: Vec<String> = coordinate_header(data.d()).collect();
    if data.zn().is_some() {
        header.push(LABEL_COLUMN.to_string());
    }
    header.push("assignment".to_string());
    header.extend((0..phi.ncols()).map(|k| format!("phi{k}")));
    wtr.write_record(&header)?;

    for (i, (x, p)) in data.xn().rows().into_iter().zip(phi.rows()).enumerate() {
        let mut row: Vec<String> = x.iter().map(|v| v.to_string()).collect();
        if let Some(zn) = data.zn() {
            row.push(zn[i].to_string());
        }
        row.push(assignments[i].to_string());
        row.extend(p.iter().map(|v| v.to_string()));
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    Ok(())
}
