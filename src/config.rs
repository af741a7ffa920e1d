//! Run configuration.
//!
//! # Invariants
//! - A `Switches` value is frozen for the duration of a run; the engine never
//!   mutates it.
//! - All limits are hard bounds and must be internally consistent
//!   (`validate()` is cheap and should be called once before a run).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default recursion depth bound.
pub const DEFAULT_MAX_RECURSION_DEPTH: u32 = 10;

/// Per-format enable switches plus scan-mode knobs.
///
/// Depth limits for intense/brute follow the original semantics: the mode is
/// active while `recursion_depth <= limit`; `None` means no depth limit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Switches {
    /// Probe every position for a valid 2-byte zlib prefix.
    pub intense_mode: bool,
    pub intense_mode_depth_limit: Option<u32>,
    /// Probe every position for a raw deflate stream (histogram-gated).
    pub brute_mode: bool,
    pub brute_mode_depth_limit: Option<u32>,

    /// Wrap PDF image streams in a BMP header when geometry matches.
    pub pdf_bmp_mode: bool,

    /// Minimum original span size for a record to be worth emitting.
    pub min_ident_size: u64,

    pub use_pdf: bool,
    pub use_zip: bool,
    pub use_gzip: bool,
    pub use_png: bool,
    pub use_gif: bool,
    pub use_jpg: bool,
    pub use_mp3: bool,
    pub use_swf: bool,
    pub use_base64: bool,
    pub use_bzip2: bool,

    /// Upper bound on bytes fed to a single inflate call in the deflate
    /// oracle.
    pub preflate_meta_block_size: usize,
    /// Re-run the reencoder after acceptance and compare byte-for-byte.
    pub preflate_verify: bool,

    /// Absolute input offsets the scanner must never probe.
    pub ignore_set: BTreeSet<u64>,

    /// Recursion depth bound; 0 disables nested precompression entirely.
    pub max_recursion_depth: u32,
}

impl Default for Switches {
    fn default() -> Self {
        Self {
            intense_mode: false,
            intense_mode_depth_limit: None,
            brute_mode: false,
            brute_mode_depth_limit: None,
            pdf_bmp_mode: false,
            min_ident_size: 4,
            use_pdf: true,
            use_zip: true,
            use_gzip: true,
            use_png: true,
            use_gif: true,
            use_jpg: true,
            use_mp3: true,
            use_swf: true,
            use_base64: true,
            use_bzip2: true,
            preflate_meta_block_size: 1 << 21,
            preflate_verify: false,
            ignore_set: BTreeSet::new(),
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
        }
    }
}

/// Validation error for `Switches::validate`.
///
/// Treat as a configuration bug, not hostile input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SwitchesError {
    MinIdentSizeZero,
    MetaBlockSizeZero,
}

impl fmt::Display for SwitchesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchesError::MinIdentSizeZero => write!(f, "min_ident_size must be > 0"),
            SwitchesError::MetaBlockSizeZero => {
                write!(f, "preflate_meta_block_size must be > 0")
            }
        }
    }
}

impl std::error::Error for SwitchesError {}

impl Switches {
    pub fn validate(&self) -> Result<(), SwitchesError> {
        if self.min_ident_size == 0 {
            return Err(SwitchesError::MinIdentSizeZero);
        }
        if self.preflate_meta_block_size == 0 {
            return Err(SwitchesError::MetaBlockSizeZero);
        }
        Ok(())
    }

    /// Whether intense mode applies at the given recursion depth.
    #[must_use]
    pub fn intense_mode_is_active(&self, recursion_depth: u32) -> bool {
        self.intense_mode
            && self
                .intense_mode_depth_limit
                .map_or(true, |limit| recursion_depth <= limit)
    }

    /// Whether brute mode applies at the given recursion depth.
    #[must_use]
    pub fn brute_mode_is_active(&self, recursion_depth: u32) -> bool {
        self.brute_mode
            && self
                .brute_mode_depth_limit
                .map_or(true, |limit| recursion_depth <= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let sw = Switches::default();
        sw.validate().unwrap();
        assert!(!sw.intense_mode);
        assert_eq!(sw.min_ident_size, 4);
        assert_eq!(sw.preflate_meta_block_size, 1 << 21);
    }

    #[test]
    fn depth_limits_gate_modes() {
        let sw = Switches {
            brute_mode: true,
            brute_mode_depth_limit: Some(1),
            intense_mode: true,
            intense_mode_depth_limit: None,
            ..Switches::default()
        };
        assert!(sw.brute_mode_is_active(0));
        assert!(sw.brute_mode_is_active(1));
        assert!(!sw.brute_mode_is_active(2));
        assert!(sw.intense_mode_is_active(9));
    }

    #[test]
    fn zero_min_ident_size_rejected() {
        let sw = Switches {
            min_ident_size: 0,
            ..Switches::default()
        };
        assert_eq!(sw.validate().unwrap_err(), SwitchesError::MinIdentSizeZero);
    }
}
