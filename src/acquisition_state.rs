use std::fmt;

/// Lifecycle of the camera as seen by the acquisition controller.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum AcquisitionState {
    /// At startup, or after the driver is uninitialized.
    #[default]
    Startup,
    /// Driver initialized, or device closed.
    Initialized,
    /// Device opened, no frame buffer allocated.
    Opened,
    /// Capture started; the capture loop is running.
    Acquiring,
    /// Capture stopped with frames in the buffer.
    Acquired,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)  // Just re-use Debug.
    }
}

/// Operations offered by the acquisition controller that are gated on state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Init,
    Uninit,
    Open,
    Close,
    Info,
    GetProperty,
    SetProperty,
    /// Snap or Sequence.
    StartCapture,
    FireTrigger,
    StopCapture,
    ReleaseBuffer,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

use AcquisitionState::*;
use Operation::*;

// Which states each operation may be invoked in.
const PERMITTED: &[(Operation, &[AcquisitionState])] = &[
    (Init, &[Startup]),
    (Uninit, &[Initialized]),
    (Open, &[Initialized]),
    (Close, &[Opened, Acquired]),
    (Info, &[Opened, Acquiring, Acquired]),
    (GetProperty, &[Opened, Acquiring, Acquired]),
    (SetProperty, &[Opened, Acquired]),
    (StartCapture, &[Opened, Acquired]),
    (FireTrigger, &[Acquiring]),
    (StopCapture, &[Acquiring]),
    (ReleaseBuffer, &[Acquired]),
];

// State reached when a permitted operation succeeds. Operations absent from
// this table leave the state unchanged.
const TRANSITIONS: &[(Operation, AcquisitionState)] = &[
    (Init, Initialized),
    (Uninit, Startup),
    (Open, Opened),
    (Close, Initialized),
    (StartCapture, Acquiring),
    (StopCapture, Acquired),
    (ReleaseBuffer, Opened),
];

impl AcquisitionState {
    /// Whether `op` may be invoked in this state. This is also what a user
    /// interface should use to enable or disable the control for `op`.
    pub fn permits(self, op: Operation) -> bool {
        Self::permitted_states(op).contains(&self)
    }

    /// Returns the state reached when `op` succeeds from this state, or None if
    /// `op` is not permitted here.
    pub fn after(self, op: Operation) -> Option<AcquisitionState> {
        if !self.permits(op) {
            return None;
        }
        Some(TRANSITIONS.iter()
             .find(|(o, _)| *o == op)
             .map_or(self, |(_, target)| *target))
    }

    /// The states `op` is permitted in.
    pub fn permitted_states(op: Operation) -> &'static [AcquisitionState] {
        match PERMITTED.iter().find(|(o, _)| *o == op) {
            Some((_, states)) => *states,
            None => &[],
        }
    }

    /// True for states in which a device session must exist.
    pub fn has_session(self) -> bool {
        matches!(self, Opened | Acquiring | Acquired)
    }

    /// Entering these states terminates any capture loop.
    pub fn is_idle(self) -> bool {
        matches!(self, Initialized | Opened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [AcquisitionState; 5] =
        [Startup, Initialized, Opened, Acquiring, Acquired];

    #[test]
    fn test_lifecycle_transitions() {
        assert_eq!(Startup.after(Init), Some(Initialized));
        assert_eq!(Initialized.after(Open), Some(Opened));
        assert_eq!(Opened.after(StartCapture), Some(Acquiring));
        assert_eq!(Acquiring.after(StopCapture), Some(Acquired));
        assert_eq!(Acquired.after(ReleaseBuffer), Some(Opened));
        assert_eq!(Acquired.after(StartCapture), Some(Acquiring));
        assert_eq!(Opened.after(Close), Some(Initialized));
        assert_eq!(Acquired.after(Close), Some(Initialized));
        assert_eq!(Initialized.after(Uninit), Some(Startup));
    }

    #[test]
    fn test_non_transitioning_operations() {
        assert_eq!(Acquiring.after(FireTrigger), Some(Acquiring));
        assert_eq!(Acquiring.after(GetProperty), Some(Acquiring));
        assert_eq!(Opened.after(SetProperty), Some(Opened));
        assert_eq!(Acquired.after(Info), Some(Acquired));
    }

    #[test]
    fn test_rejected_operations() {
        assert_eq!(Initialized.after(StartCapture), None);
        assert_eq!(Startup.after(Open), None);
        assert_eq!(Acquiring.after(Close), None);
        assert_eq!(Acquiring.after(SetProperty), None);
        assert_eq!(Opened.after(StopCapture), None);
        assert_eq!(Opened.after(FireTrigger), None);
        assert_eq!(Opened.after(ReleaseBuffer), None);
        assert_eq!(Opened.after(Uninit), None);
    }

    #[test]
    fn test_permission_table_is_consistent() {
        for op in [Init, Uninit, Open, Close, Info, GetProperty, SetProperty,
                   StartCapture, FireTrigger, StopCapture, ReleaseBuffer] {
            let permitted = AcquisitionState::permitted_states(op);
            assert!(!permitted.is_empty(), "{} has no states", op);
            for state in ALL_STATES {
                assert_eq!(state.permits(op), permitted.contains(&state));
                assert_eq!(state.after(op).is_some(), state.permits(op));
            }
        }
    }

    #[test]
    fn test_session_states() {
        for state in ALL_STATES {
            // Only the capture states lead back to an idle state on stop or
            // release.
            if state.is_idle() {
                assert_eq!(state.after(StopCapture), None);
                assert_eq!(state.after(ReleaseBuffer), None);
            }
        }
        assert!(!Initialized.has_session());
        assert!(Opened.has_session());
        assert!(Acquired.has_session());
    }
}
