//! Run statistics and progress mapping.
//!
//! # Invariants
//! - Counters are monotone within a run and indexed by the stable
//!   `FormatTag` discriminant; all arithmetic saturates.
//! - The PDF bpp sub-counters may be *moved between buckets* after the fact
//!   (a stream first counted as plain PDF turns out to be an 8/24bpp image);
//!   moves use saturating subtraction so they can never underflow.

use crate::formats::FormatTag;

/// Per-format, per-phase counters.
#[derive(Clone, Debug, Default)]
pub struct Statistics {
    /// Streams a handler successfully expanded (pre-acceptance).
    pub decompressed: [u64; FormatTag::COUNT],
    /// Streams accepted and emitted as records.
    pub recompressed: [u64; FormatTag::COUNT],

    pub decompressed_streams_total: u64,
    pub recompressed_streams_total: u64,

    pub decompressed_pdf_8_bit: u64,
    pub decompressed_pdf_24_bit: u64,
    pub recompressed_pdf_8_bit: u64,
    pub recompressed_pdf_24_bit: u64,
}

impl Statistics {
    pub fn record_decompressed(&mut self, tag: FormatTag) {
        let slot = &mut self.decompressed[tag.as_usize()];
        *slot = slot.saturating_add(1);
        self.decompressed_streams_total = self.decompressed_streams_total.saturating_add(1);
    }

    pub fn record_recompressed(&mut self, tag: FormatTag) {
        let slot = &mut self.recompressed[tag.as_usize()];
        *slot = slot.saturating_add(1);
        self.recompressed_streams_total = self.recompressed_streams_total.saturating_add(1);
    }

    /// Move a recompressed PDF stream into the 8bpp bucket.
    pub fn reclassify_pdf_8bpp(&mut self) {
        self.recompressed_pdf_8_bit = self.recompressed_pdf_8_bit.saturating_add(1);
        let pdf = &mut self.recompressed[FormatTag::Pdf.as_usize()];
        *pdf = pdf.saturating_sub(1);
    }

    /// Move a recompressed PDF stream into the 24bpp bucket.
    pub fn reclassify_pdf_24bpp(&mut self) {
        self.decompressed_pdf_8_bit = self.decompressed_pdf_8_bit.saturating_sub(1);
        self.decompressed_pdf_24_bit = self.decompressed_pdf_24_bit.saturating_add(1);
        self.recompressed_pdf_24_bit = self.recompressed_pdf_24_bit.saturating_add(1);
        let pdf = &mut self.recompressed[FormatTag::Pdf.as_usize()];
        *pdf = pdf.saturating_sub(1);
    }

    /// Merge a nested run's counters into this one.
    pub fn absorb(&mut self, other: &Statistics) {
        for i in 0..FormatTag::COUNT {
            self.decompressed[i] = self.decompressed[i].saturating_add(other.decompressed[i]);
            self.recompressed[i] = self.recompressed[i].saturating_add(other.recompressed[i]);
        }
        self.decompressed_streams_total = self
            .decompressed_streams_total
            .saturating_add(other.decompressed_streams_total);
        self.recompressed_streams_total = self
            .recompressed_streams_total
            .saturating_add(other.recompressed_streams_total);
        self.decompressed_pdf_8_bit = self
            .decompressed_pdf_8_bit
            .saturating_add(other.decompressed_pdf_8_bit);
        self.decompressed_pdf_24_bit = self
            .decompressed_pdf_24_bit
            .saturating_add(other.decompressed_pdf_24_bit);
        self.recompressed_pdf_8_bit = self
            .recompressed_pdf_8_bit
            .saturating_add(other.recompressed_pdf_8_bit);
        self.recompressed_pdf_24_bit = self
            .recompressed_pdf_24_bit
            .saturating_add(other.recompressed_pdf_24_bit);
    }
}

/// Progress sub-range `[min, max]` in percent, nested multiplicatively.
#[derive(Clone, Copy, Debug)]
pub struct ProgressRange {
    pub min_percent: f32,
    pub max_percent: f32,
}

impl ProgressRange {
    pub const FULL: ProgressRange = ProgressRange {
        min_percent: 0.0,
        max_percent: 100.0,
    };

    /// Map a `0..=1` fraction of this range into an absolute percentage.
    #[must_use]
    pub fn map(&self, fraction: f32) -> f32 {
        let fraction = fraction.clamp(0.0, 1.0);
        self.min_percent + (self.max_percent - self.min_percent) * fraction
    }

    /// Derive the sub-range a nested context occupies, given the parent
    /// position and the length of the span being recursed into.
    #[must_use]
    pub fn subrange(&self, input_pos: u64, span: u64, fin_length: u64) -> ProgressRange {
        if fin_length == 0 {
            return *self;
        }
        let start = input_pos as f32 / fin_length as f32;
        let end = (input_pos + span) as f32 / fin_length as f32;
        ProgressRange {
            min_percent: self.map(start),
            max_percent: self.map(end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_saturate_not_underflow() {
        let mut s = Statistics::default();
        // Reclassification with zero counters must clamp, not wrap.
        s.reclassify_pdf_24bpp();
        assert_eq!(s.decompressed_pdf_8_bit, 0);
        assert_eq!(s.decompressed_pdf_24_bit, 1);
        assert_eq!(s.recompressed[FormatTag::Pdf.as_usize()], 0);
    }

    #[test]
    fn pdf_reclassification_moves_buckets() {
        let mut s = Statistics::default();
        s.record_recompressed(FormatTag::Pdf);
        s.reclassify_pdf_8bpp();
        assert_eq!(s.recompressed[FormatTag::Pdf.as_usize()], 0);
        assert_eq!(s.recompressed_pdf_8_bit, 1);
        assert_eq!(s.recompressed_streams_total, 1);
    }

    #[test]
    fn progress_nesting() {
        let outer = ProgressRange::FULL;
        let inner = outer.subrange(50, 25, 100);
        assert!((inner.min_percent - 50.0).abs() < 1e-4);
        assert!((inner.max_percent - 75.0).abs() < 1e-4);
        let mid = inner.map(0.5);
        assert!((mid - 62.5).abs() < 1e-4);
    }
}
