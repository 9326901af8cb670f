//! The I(V) table produced by a run, and its file formats.
//!
//! The whitespace `ivdat` layout is the one downstream R-factor tools read:
//!
//! ```text
//!  h           1.00      0.50
//!  k           0.00      0.50
//!  nenergy
//!  100.0 1234.56789 -999.00000
//!  101.0 1240.00000   17.25000
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::spot::{LatticeIndex, INTENSITY_SENTINEL};

/// One emitted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct IvRow {
    /// Beam energy in eV.
    pub energy: f64,
    /// One entry per desired index; [`INTENSITY_SENTINEL`] when unmeasured.
    pub intensities: Vec<f64>,
    /// Beam current reading of the frame.
    pub beam_raw: f64,
    /// Beam current the intensities were divided by.
    pub beam_used: f64,
}

/// Intensities of the desired reflexes versus energy.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IvTable {
    indices: Vec<LatticeIndex>,
    rows: Vec<IvRow>,
}

impl IvTable {
    pub fn new(indices: Vec<LatticeIndex>) -> Self {
        Self {
            indices,
            rows: Vec::new(),
        }
    }

    pub fn indices(&self) -> &[LatticeIndex] {
        &self.indices
    }

    pub fn rows(&self) -> &[IvRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append a row. Short rows are padded with the sentinel, long rows truncated.
    pub fn push(&mut self, mut row: IvRow) {
        row.intensities.resize(self.indices.len(), INTENSITY_SENTINEL);
        self.rows.push(row);
    }

    /// `(energy, intensity)` pairs of one column, sentinel entries skipped.
    pub fn curve(&self, column: usize) -> Vec<(f64, f64)> {
        self.rows
            .iter()
            .filter_map(|r| {
                let v = *r.intensities.get(column)?;
                (v != INTENSITY_SENTINEL).then_some((r.energy, v))
            })
            .collect()
    }

    /// Column of the first desired index matching `index`.
    pub fn column_of(&self, index: &LatticeIndex) -> Option<usize> {
        self.indices.iter().position(|i| i.matches(index))
    }

    /// Write the legacy whitespace `ivdat` format.
    pub fn write_ivdat<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        write!(w, " h     ")?;
        for i in &self.indices {
            write!(w, "{:10.2}", i.h)?;
        }
        write!(w, "\n k     ")?;
        for i in &self.indices {
            write!(w, "{:10.2}", i.k)?;
        }
        writeln!(w, "\n nenergy")?;
        for row in &self.rows {
            write!(w, "{:6.1}", row.energy)?;
            for v in &row.intensities {
                write!(w, " {v:10.5}")?;
            }
            writeln!(w)?;
        }
        w.flush()
    }

    /// Write a CSV with an `energy` column, one column per desired index and
    /// the two beam current columns.
    pub fn write_csv<W: Write>(&self, w: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(w);
        let mut header = vec!["energy".to_string()];
        header.extend(self.indices.iter().map(|i| format!("I({:.2};{:.2})", i.h, i.k)));
        header.push("beam_raw".into());
        header.push("beam_used".into());
        wtr.write_record(&header)?;
        for row in &self.rows {
            let mut record = vec![row.energy.to_string()];
            record.extend(row.intensities.iter().map(|v| v.to_string()));
            record.push(row.beam_raw.to_string());
            record.push(row.beam_used.to_string());
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Write `energy<TAB>current` lines, raw readings or the normalising
    /// currents actually used.
    pub fn write_beam_currents<W: Write>(&self, mut w: W, used: bool) -> std::io::Result<()> {
        for row in &self.rows {
            let current = if used { row.beam_used } else { row.beam_raw };
            writeln!(w, "{:.6}\t{:.6}", row.energy, current)?;
        }
        w.flush()
    }

    /// Write the `ivdat` file to `path`.
    pub fn save_ivdat(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        self.write_ivdat(BufWriter::new(file))
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Write the CSV table to `path`.
    pub fn save_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        self.write_csv(BufWriter::new(file))
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}
