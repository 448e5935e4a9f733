//! Scan states and the transition table.
//!
//! ```text
//!              reset                configure              run
//!   Fault ──► Resetting ──► Ready ──► Configuring ──► Armed ──► Running ──► PostRun ──► Ready
//!   Aborted ─┘                 ▲                        │ ▲        │  ▲                 │
//!   Disabled ┘                 │                 pause  │ │        │  │ resume          ▼
//!                              │                        ▼ │ pause  ▼  │               Armed
//!                              │                      Seeking ──► Paused                (more steps)
//!                              │
//!   any non-terminal ── abort ──► Aborting ──► Aborted
//!   any ── failure ──► Fault          any but Disabled ── disable ──► Disabling ──► Disabled
//! ```

use std::fmt;
use std::str::FromStr;

use daq_core::DaqError;

/// Scan state held by a runnable block's `state` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Resetting,
    Ready,
    Configuring,
    Armed,
    PreRun,
    Running,
    PostRun,
    Pausing,
    Paused,
    Seeking,
    Rewinding,
    Aborting,
    Aborted,
    Fault,
    Disabling,
    Disabled,
}

use RunState::*;

impl RunState {
    /// Every state, in display order.
    pub const ALL: [RunState; 16] = [
        Resetting, Ready, Configuring, Armed, PreRun, Running, PostRun, Pausing, Paused, Seeking,
        Rewinding, Aborting, Aborted, Fault, Disabling, Disabled,
    ];

    /// Name as stored in the `state` attribute.
    pub fn as_str(self) -> &'static str {
        match self {
            Resetting => "Resetting",
            Ready => "Ready",
            Configuring => "Configuring",
            Armed => "Armed",
            PreRun => "PreRun",
            Running => "Running",
            PostRun => "PostRun",
            Pausing => "Pausing",
            Paused => "Paused",
            Seeking => "Seeking",
            Rewinding => "Rewinding",
            Aborting => "Aborting",
            Aborted => "Aborted",
            Fault => "Fault",
            Disabling => "Disabling",
            Disabled => "Disabled",
        }
    }

    /// States an abort may start from.
    pub fn is_abortable(self) -> bool {
        !matches!(self, Aborting | Aborted | Fault | Disabling | Disabled)
    }

    /// States reachable from `self` in one step.
    pub fn allowed_transitions(self) -> &'static [RunState] {
        match self {
            Resetting => &[Ready, Aborting, Fault, Disabling],
            Ready => &[Resetting, Configuring, Aborting, Fault, Disabling],
            Configuring => &[Armed, Aborting, Fault, Disabling],
            Armed => &[Running, Seeking, Aborting, Fault, Disabling],
            PreRun => &[Running, Aborting, Fault, Disabling],
            Running => &[PostRun, Seeking, Aborting, Fault, Disabling],
            PostRun => &[Ready, Armed, Aborting, Fault, Disabling],
            Pausing | Rewinding => &[Paused, Aborting, Fault, Disabling],
            Seeking => &[Paused, Aborting, Fault, Disabling],
            Paused => &[Running, Seeking, Aborting, Fault, Disabling],
            Aborting => &[Aborted, Fault, Disabling],
            Aborted => &[Resetting, Fault, Disabling],
            Fault => &[Resetting, Fault, Disabling],
            Disabling => &[Disabled, Fault],
            Disabled => &[Resetting],
        }
    }

    /// Whether `self -> to` is an edge of the table.
    pub fn can_transition_to(self, to: RunState) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DaqError::BadValue(format!("'{s}' is not a scan state")))
    }
}

/// Methods of a runnable block and the states each is writeable in.
pub(crate) fn method_writeable(method: &str, state: RunState) -> bool {
    match method {
        "validate" => true,
        "configure" => state == Ready,
        "run" => state == Armed,
        "pause" => matches!(state, Armed | Running | Paused),
        "resume" => state == Paused,
        "abort" => state.is_abortable(),
        "reset" => matches!(state, Fault | Aborted | Ready | Disabled),
        "disable" => !matches!(state, Disabling | Disabled),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for state in RunState::ALL {
            assert_eq!(state.as_str().parse::<RunState>().unwrap(), state);
        }
        assert!("Sleeping".parse::<RunState>().is_err());
    }

    #[test]
    fn happy_path_edges_exist() {
        let path = [Ready, Configuring, Armed, Running, PostRun, Ready];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(PostRun.can_transition_to(Armed));
        assert!(Paused.can_transition_to(Running));
    }

    #[test]
    fn every_state_can_fault_except_disabled() {
        for state in RunState::ALL {
            assert_eq!(state.can_transition_to(Fault), state != Disabled, "{state}");
        }
    }

    #[test]
    fn illegal_edges_rejected() {
        assert!(!Ready.can_transition_to(Running));
        assert!(!Fault.can_transition_to(Ready));
        assert!(!Aborted.can_transition_to(Configuring));
    }

    #[test]
    fn method_writeability_follows_state() {
        assert!(method_writeable("configure", Ready));
        assert!(!method_writeable("configure", Armed));
        assert!(method_writeable("run", Armed));
        assert!(method_writeable("pause", Running));
        assert!(!method_writeable("resume", Running));
        assert!(!method_writeable("abort", Fault));
        assert!(method_writeable("reset", Fault));
        assert!(!method_writeable("reset", Running));
        for state in RunState::ALL {
            assert!(method_writeable("validate", state));
        }
    }
}
