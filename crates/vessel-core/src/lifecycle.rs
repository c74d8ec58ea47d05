use crate::CoreError;
use serde::Serialize;
use std::fmt;
use vessel_schema::ContainerId;

/// Where a container stands. Always observed, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    NonExistent,
    /// Private area present, storage not mounted.
    Created,
    Mounted,
    Running,
    /// Kernel state left behind without a live init.
    Stopping,
    /// Produced by `stop`; observation reports an unmounted stopped
    /// container as `Created`.
    Stopped,
    /// A dump file is waiting to be restored.
    Suspended,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NonExistent => "nonexistent",
            Self::Created => "created",
            Self::Mounted => "mounted",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Suspended => "suspended",
        })
    }
}

/// Raw facts gathered from the collaborators at the start of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub state: LifecycleState,
    pub exists: bool,
    pub mounted: bool,
    pub running: bool,
    /// Running but frozen by a suspend.
    pub frozen: bool,
    pub kernel_state: bool,
    pub dump: bool,
}

/// Derive the lifecycle state from observed facts.
pub fn classify(
    private_exists: bool,
    mounted: bool,
    running: bool,
    kernel_state: bool,
    dump: bool,
) -> LifecycleState {
    if running {
        LifecycleState::Running
    } else if kernel_state {
        LifecycleState::Stopping
    } else if !private_exists {
        LifecycleState::NonExistent
    } else if mounted {
        LifecycleState::Mounted
    } else if dump {
        LifecycleState::Suspended
    } else {
        LifecycleState::Created
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Create,
    Mount,
    Umount,
    Start,
    Stop,
    Checkpoint,
    Restore,
    Destroy,
    Set,
}

/// Check that `transition` is legal from `from` and return the target state.
///
/// Illegal transitions map onto the precondition error a caller would
/// expect, e.g. stopping a stopped container is `NotRunning`.
pub fn validate_transition(
    id: ContainerId,
    from: LifecycleState,
    transition: Transition,
) -> Result<LifecycleState, CoreError> {
    use LifecycleState as S;
    use Transition as T;

    let target = match (from, transition) {
        (S::NonExistent, T::Create) => S::Created,
        (S::Created | S::Stopped | S::Suspended, T::Mount) => S::Mounted,
        (S::Mounted, T::Umount) => S::Created,
        (S::Created | S::Stopped | S::Mounted | S::Suspended, T::Start | T::Restore) => S::Running,
        (S::Running | S::Stopping, T::Stop) => S::Stopped,
        (S::Running, T::Checkpoint) => S::Suspended,
        (S::Created | S::Stopped | S::Suspended, T::Destroy) => S::NonExistent,
        (s, T::Set) if s != S::NonExistent => s,

        (S::NonExistent, _) => return Err(CoreError::NotExist(id)),
        (_, T::Create) => return Err(CoreError::AlreadyExists(id)),
        (S::Running | S::Stopping, _) => return Err(CoreError::AlreadyRunning(id)),
        (S::Mounted, T::Mount | T::Destroy) => return Err(CoreError::AlreadyMounted(id)),
        (_, T::Umount) => return Err(CoreError::NotMounted(id)),
        (_, T::Stop | T::Checkpoint) => return Err(CoreError::NotRunning(id)),
        (from, transition) => {
            return Err(CoreError::InvalidParameter(format!(
                "{transition:?} is not allowed from state {from}"
            )))
        }
    };
    Ok(target)
}
