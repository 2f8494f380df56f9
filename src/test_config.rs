//! Proptest settings shared by the unit tests.
//!
//! Replay properties step a simulation hundreds of times per case, which Miri interprets
//! very slowly, so case counts shrink under it.

/// Cases per property test: 64 normally, 4 under Miri.
#[must_use]
pub(crate) const fn miri_case_count() -> u32 {
    if cfg!(miri) {
        4
    } else {
        64
    }
}
