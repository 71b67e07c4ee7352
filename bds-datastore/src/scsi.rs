//! SCSI result encoding for the volume request API.

use std::fmt;

use crate::error::{DedupError, ErrorContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScsiStatus {
    Good = 0x00,
    CheckCondition = 0x02,
    Busy = 0x08,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SenseKey {
    Ok = 0x00,
    NotReady = 0x02,
    MediumError = 0x03,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScsiResult {
    pub status: ScsiStatus,
    pub sense_key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
}

impl ScsiResult {
    pub const OK: ScsiResult = ScsiResult {
        status: ScsiStatus::Good,
        sense_key: SenseKey::Ok,
        asc: 0x00,
        ascq: 0x00,
    };

    pub const NOT_READY: ScsiResult = ScsiResult {
        status: ScsiStatus::CheckCondition,
        sense_key: SenseKey::NotReady,
        asc: 0x04,
        ascq: 0x00,
    };

    pub const ILLEGAL_REQUEST: ScsiResult = ScsiResult {
        status: ScsiStatus::CheckCondition,
        sense_key: SenseKey::IllegalRequest,
        asc: 0x24,
        ascq: 0x00,
    };

    pub const READ_ERROR: ScsiResult = ScsiResult {
        status: ScsiStatus::CheckCondition,
        sense_key: SenseKey::MediumError,
        asc: 0x11,
        ascq: 0x00,
    };

    pub const WRITE_ERROR: ScsiResult = ScsiResult {
        status: ScsiStatus::CheckCondition,
        sense_key: SenseKey::MediumError,
        asc: 0x0c,
        ascq: 0x00,
    };

    pub const MEDIUM_ERROR: ScsiResult = ScsiResult {
        status: ScsiStatus::CheckCondition,
        sense_key: SenseKey::MediumError,
        asc: 0x31,
        ascq: 0x00,
    };

    /// Good, or a check condition the initiator recovers from on its own.
    pub fn is_ok(&self) -> bool {
        self.status == ScsiStatus::Good
            || (self.status == ScsiStatus::CheckCondition
                && matches!(self.sense_key, SenseKey::NotReady | SenseKey::UnitAttention))
    }

    /// Map an engine error to the result reported to the initiator.
    pub fn from_error(err: &DedupError, ec: &ErrorContext, is_write: bool) -> Self {
        if ec.full {
            return Self::WRITE_ERROR;
        }
        if ec.write_error {
            return Self::WRITE_ERROR;
        }
        if ec.read_error && !is_write {
            return Self::READ_ERROR;
        }
        match err {
            DedupError::Busy(_) | DedupError::Timeout(_) => Self::NOT_READY,
            DedupError::Programming(_) => Self::MEDIUM_ERROR,
            _ if is_write => Self::WRITE_ERROR,
            _ => Self::READ_ERROR,
        }
    }
}

impl fmt::Display for ScsiResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[status {:#04x}, sense {:#04x}, asc {:#04x}, ascq {:#04x}]",
            self.status as u8, self.sense_key as u8, self.asc, self.ascq
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(ScsiResult::OK.is_ok());
        assert!(ScsiResult::NOT_READY.is_ok());
        assert!(!ScsiResult::ILLEGAL_REQUEST.is_ok());
        assert!(!ScsiResult::READ_ERROR.is_ok());
        assert!(!ScsiResult::WRITE_ERROR.is_ok());
    }

    #[test]
    fn full_maps_to_write_error() {
        let mut ec = ErrorContext::new();
        ec.set_full();
        let result = ScsiResult::from_error(&DedupError::full("chunk store"), &ec, true);
        assert_eq!(result, ScsiResult::WRITE_ERROR);
    }
}
