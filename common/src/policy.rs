//! Fallbacks applied when request input is malformed.
//!
//! Embedded clients on flaky links send truncated or odd requests; none of these cases
//! aborts a request by default. Every parse step asks a [`RecoveryPolicy`] what to do, and
//! the parser and handler act on the answer, so the full set of fallbacks lives in one table.

use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    /// Header line with no colon, or with the colon in the first position.
    HeaderWithoutName,
    /// Header arrived after the header table reached capacity.
    HeaderTableFull,
    /// `Content-Length` present but not a number.
    ContentLengthInvalid,
    /// Text after `heaterThreshold=` does not start with a finite number.
    ThresholdUnparsable,
    /// Threshold update body lacks the `heaterThreshold=` field.
    ThresholdMissing,
}

impl Malformed {
    /// Body of the `400` response sent when this case is rejected.
    pub fn message(self) -> &'static str {
        match self {
            Self::HeaderWithoutName => "Malformed header line",
            Self::HeaderTableFull => "Too many headers",
            Self::ContentLengthInvalid => "Invalid Content-Length",
            Self::ThresholdUnparsable => "Invalid heaterThreshold",
            Self::ThresholdMissing => "Missing heaterThreshold",
        }
    }
}

/// What the parser or handler does about a [`Malformed`] case.
///
/// Header-phase sites treat `SkipLine`, `DropHeader` and `UseValue` as "ignore this line and
/// keep reading". `EmptyBody` ends the header block and skips the body. Threshold sites apply
/// `UseValue` and reject on anything else.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Recovery {
    SkipLine,
    DropHeader,
    EmptyBody,
    UseValue(f32),
    /// State is left untouched and the client gets `400 Bad Request`.
    RejectUnchanged,
}

pub const RECOVERY_POLICY: [(Malformed, Recovery); 5] = [
    (Malformed::HeaderWithoutName, Recovery::SkipLine),
    (Malformed::HeaderTableFull, Recovery::DropHeader),
    (Malformed::ContentLengthInvalid, Recovery::EmptyBody),
    (Malformed::ThresholdUnparsable, Recovery::UseValue(0.0)),
    (Malformed::ThresholdMissing, Recovery::RejectUnchanged),
];

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    entries: [(Malformed, Recovery); 5],
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            entries: RECOVERY_POLICY,
        }
    }
}

impl RecoveryPolicy {
    /// Replaces the recovery for one case.
    pub fn with(mut self, case: Malformed, recovery: Recovery) -> Self {
        for entry in self.entries.iter_mut().filter(|(malformed, _)| *malformed == case) {
            entry.1 = recovery;
        }
        self
    }

    pub fn recovery_for(&self, case: Malformed) -> Recovery {
        let recovery = self
            .entries
            .iter()
            .find(|(malformed, _)| *malformed == case)
            .map(|(_, recovery)| *recovery)
            .unwrap_or(Recovery::SkipLine);
        debug!("recovering from {case:?} with {recovery:?}");
        recovery
    }
}
