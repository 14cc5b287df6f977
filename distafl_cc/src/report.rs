//! What a pass run did to a module, for the summary line and for tooling.

use core::ops::RangeInclusive;
use std::{
    fs::{self, File},
    io::Write,
    path::Path,
};

use distafl_bolts::Error;
use serde::{Deserialize, Serialize};

use crate::{config::HardeningMode, sampling::InstRatio};

/// The distance instrumentation a join point received.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceKind {
    /// None qualified
    #[default]
    None,
    /// An integer comparison feeding a conditional branch
    Compare,
    /// A `switch`
    Dispatch {
        /// Number of cases, without the default
        cases: u32,
        /// Number of distinct case values
        labels: u32,
    },
}

/// One instrumented join point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPointRecord {
    /// Build-wide identity
    pub id: u32,
    /// Enclosing function
    pub function: String,
    /// Block name
    pub block: String,
    /// Location value used for edge coverage
    pub location: u32,
    /// Distance instrumentation, if any
    pub distance: DistanceKind,
}

/// The outcome of instrumenting one module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationReport {
    /// The module identifier
    pub module: String,
    /// The ratio in effect
    pub ratio: InstRatio,
    /// The build mode in effect
    pub mode: HardeningMode,
    /// Join points visited
    pub considered: u32,
    /// Join points left alone by sampling
    pub skipped: u32,
    /// Join points that got a compare distance
    pub compares: u32,
    /// Join points that got dispatch distances
    pub dispatches: u32,
    /// The instrumented join points, in visiting order
    pub join_points: Vec<JoinPointRecord>,
}

impl InstrumentationReport {
    /// Creates an empty report for `module`
    #[must_use]
    pub fn new(module: &str, ratio: InstRatio, mode: HardeningMode) -> Self {
        Self {
            module: module.to_string(),
            ratio,
            mode,
            ..Self::default()
        }
    }

    /// Adds an instrumented join point
    pub fn record(&mut self, record: JoinPointRecord) {
        match record.distance {
            DistanceKind::None => {}
            DistanceKind::Compare => self.compares += 1,
            DistanceKind::Dispatch { .. } => self.dispatches += 1,
        }
        self.join_points.push(record);
    }

    /// The number of instrumented join points
    #[must_use]
    pub fn instrumented(&self) -> usize {
        self.join_points.len()
    }

    /// The identities issued while instrumenting, if any
    #[must_use]
    pub fn id_range(&self) -> Option<RangeInclusive<u32>> {
        let first = self.join_points.first()?.id;
        let last = self.join_points.last()?.id;
        Some(first..=last)
    }

    /// The closing line of a run
    #[must_use]
    pub fn summary(&self) -> String {
        if self.join_points.is_empty() {
            "No instrumentation targets found.".to_string()
        } else {
            format!(
                "Instrumented {} locations ({} mode, ratio {}%).",
                self.instrumented(),
                self.mode,
                self.ratio.percent()
            )
        }
    }

    /// Writes the report as pretty JSON, replacing `path` atomically.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let json_error = |err| Error::serialize(format!("Failed to json-ify report: {err:?}"));
        let serialized = serde_json::to_vec_pretty(self).map_err(json_error)?;

        let mut tmpfile_path = path.to_path_buf();
        let file_name = path
            .file_name()
            .ok_or_else(|| {
                Error::illegal_argument(format!("Not a file path: {}", path.display()))
            })?
            .to_string_lossy();
        tmpfile_path.set_file_name(format!(".{file_name}.tmp"));

        let mut tmpfile = File::create(&tmpfile_path)?;
        tmpfile.write_all(&serialized)?;
        fs::rename(&tmpfile_path, path)?;
        Ok(())
    }

    /// Reads a report written by [`Self::write_json`]
    pub fn read_json<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|err| Error::serialize(format!("Failed to parse report: {err:?}")))
    }
}
