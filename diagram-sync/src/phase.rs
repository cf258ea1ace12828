//! Sync phase state machine.
//!
//! Gates whether local engine events count as user edits. The phase is a
//! single enum, so "applying a remote change while still loading" cannot be
//! expressed. Transient phases are entered through guards that restore
//! [`SyncPhase::Idle`] when dropped, including on early return or panic.
//!
//! ```text
//!            finish_loading
//!  Loading ────────────────► Idle ◄──────────┐
//!     ▲                      │  │            │ guard drop
//!     │ begin_loading        │  └─► Editing ─┤
//!     └──────────────────────┘  └─► ApplyingRemote
//! ```

use std::fmt;
use std::ops::Deref;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Initial fetch or model switch in progress
    Loading,
    /// Ready; local transactions are observed
    Idle,
    /// A local transaction is being committed
    Editing,
    /// A peer's change is being applied
    ApplyingRemote,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Loading => "loading",
            Self::Idle => "idle",
            Self::Editing => "editing",
            Self::ApplyingRemote => "applying-remote",
        };
        f.write_str(name)
    }
}

/// Rejected phase transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseError {
    pub from: SyncPhase,
    pub to: SyncPhase,
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal sync phase transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for PhaseError {}

#[derive(Debug)]
pub struct PhaseMachine {
    phase: SyncPhase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    /// Machines start in `Loading`: nothing is observed until the first
    /// model is in place.
    pub fn new() -> Self {
        Self {
            phase: SyncPhase::Loading,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Whether the Change Observer may react to engine events.
    pub fn observes_local_changes(&self) -> bool {
        matches!(self.phase, SyncPhase::Idle | SyncPhase::Editing)
    }

    pub fn begin_loading(&mut self) {
        self.phase = SyncPhase::Loading;
    }

    pub fn finish_loading(&mut self) -> Result<(), PhaseError> {
        self.transition(SyncPhase::Loading, SyncPhase::Idle)
    }

    pub fn begin_edit(&mut self) -> Result<PhaseGuard<'_>, PhaseError> {
        self.transition(SyncPhase::Idle, SyncPhase::Editing)?;
        Ok(PhaseGuard { machine: self })
    }

    pub fn begin_remote(&mut self) -> Result<PhaseGuard<'_>, PhaseError> {
        self.transition(SyncPhase::Idle, SyncPhase::ApplyingRemote)?;
        Ok(PhaseGuard { machine: self })
    }

    fn transition(&mut self, expected: SyncPhase, to: SyncPhase) -> Result<(), PhaseError> {
        if self.phase != expected {
            return Err(PhaseError {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }
}

/// Holds a transient phase; dropping it returns the machine to `Idle`.
pub struct PhaseGuard<'a> {
    machine: &'a mut PhaseMachine,
}

impl Deref for PhaseGuard<'_> {
    type Target = PhaseMachine;

    fn deref(&self) -> &PhaseMachine {
        self.machine
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.machine.phase = SyncPhase::Idle;
    }
}
