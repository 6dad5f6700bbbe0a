//! Access gate for store-type requests against an instance's data.
//!
//! Instances registered with the restricted flag refuse administrative
//! writes for their whole lifetime; the flag is immutable after
//! registration. The instance's own ingestion path always passes, and
//! read/fetch operations are never gated. The check is evaluated on every
//! store attempt, independent of budget and version checks.

use crate::error::{Error, Result};
use crate::record::InstanceId;

/// Where a store request originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOrigin {
    /// The instance's own ingestion task committing a decoded record.
    Ingestion,
    /// Any write from outside the ingestion path (administrative stores).
    Administrative,
}

/// Enforces the per-instance restricted-store policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessGate;

impl AccessGate {
    /// Check a store request against an instance's restricted flag.
    pub fn check_store(id: InstanceId, restricted: bool, origin: StoreOrigin) -> Result<()> {
        match origin {
            StoreOrigin::Ingestion => Ok(()),
            StoreOrigin::Administrative if restricted => Err(Error::PermissionDenied(id)),
            StoreOrigin::Administrative => Ok(()),
        }
    }
}
