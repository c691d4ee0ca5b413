// src/waveforms/planner.rs
use crate::error::{PipelineError, Result};
use crate::recording::UnitId;

/// Walks the ordered unit list in ranges of at most `width` units.
///
/// The cursor only moves through [`ExtractionPlanner::advance`], which the
/// driver calls once a range is resolved, so the ranges it hands out never
/// overlap and leave no gaps.
#[derive(Debug, Clone)]
pub struct ExtractionPlanner {
    unit_ids: Vec<UnitId>,
    width: usize,
    cursor: usize,
}

impl ExtractionPlanner {
    pub fn new(mut unit_ids: Vec<UnitId>, width: usize) -> Result<Self> {
        if unit_ids.is_empty() {
            return Err(PipelineError::EmptyUnitSet);
        }
        unit_ids.sort_unstable();
        unit_ids.dedup();
        Ok(Self {
            unit_ids,
            width: width.max(1),
            cursor: 0,
        })
    }

    pub fn unit_ids(&self) -> &[UnitId] {
        &self.unit_ids
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_done(&self) -> bool {
        self.cursor >= self.unit_ids.len()
    }

    pub fn remaining(&self) -> &[UnitId] {
        &self.unit_ids[self.cursor.min(self.unit_ids.len())..]
    }

    /// The next range of up to `width` units.
    pub fn next_range(&self) -> &[UnitId] {
        self.range_of(self.width)
    }

    /// The next range of up to `width` units, for a narrowed retry.
    pub fn range_of(&self, width: usize) -> &[UnitId] {
        let remaining = self.remaining();
        &remaining[..width.max(1).min(remaining.len())]
    }

    /// Multi-unit ranges starting at the cursor, widest first: every end
    /// position from the last unit down to the one right after the cursor.
    pub fn wide_candidates(&self) -> impl Iterator<Item = &[UnitId]> + '_ {
        let remaining = self.remaining();
        (2..=remaining.len()).rev().map(move |len| &remaining[..len])
    }

    pub fn advance(&mut self, resolved: usize) {
        self.cursor = (self.cursor + resolved).min(self.unit_ids.len());
    }
}
