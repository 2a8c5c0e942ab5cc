//! Capability shared by input and output units.

use crate::format::AudioFormat;

/// What the engine can ask of any unit, regardless of its direction.
pub trait AudioUnit {
    /// Format the unit produces (input) or renders (output); `None` before it is open.
    fn format(&self) -> Option<AudioFormat>;

    /// Input: the decode worker is actively decoding. Output: render ticks are being issued.
    fn is_processing(&self) -> bool;

    /// Release the unit's resources. Idempotent.
    fn close(&self);
}
