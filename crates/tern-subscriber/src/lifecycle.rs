// Subscriber lifecycle state machine, observable by the host.
use tern_wire::Status;
use tokio::sync::watch;

/// Host-visible lifecycle state. Transitions are monotonic; `Failed` carries
/// the fatal status and is reachable from any live state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Created,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed(Status),
}

impl State {
    /// Alive states keep the supervisor reconnecting; anything else makes it
    /// fail fast instead.
    pub fn is_alive(&self) -> bool {
        matches!(self, State::Starting | State::Running)
    }

    fn rank(&self) -> u8 {
        match self {
            State::Created => 0,
            State::Starting => 1,
            State::Running => 2,
            State::Stopping => 3,
            State::Terminated | State::Failed(_) => 4,
        }
    }
}

pub(crate) struct Lifecycle {
    state: watch::Sender<State>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(State::Created);
        Self { state }
    }

    pub(crate) fn current(&self) -> State {
        self.state.borrow().clone()
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state.borrow().is_alive()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Apply `next` if it moves the machine forward; stale or backward
    /// transitions are ignored.
    pub(crate) fn transition(&self, next: State) -> bool {
        self.state.send_if_modified(|current| {
            if next.rank() > current.rank() {
                *current = next.clone();
                true
            } else {
                false
            }
        })
    }

    pub(crate) async fn wait_not_alive(&self) {
        let mut receiver = self.state.subscribe();
        receiver
            .wait_for(|state| !state.is_alive())
            .await
            .expect("lifecycle sender alive");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_wire::Code;

    #[test]
    fn transitions_are_monotonic() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.transition(State::Starting));
        assert!(lifecycle.transition(State::Running));
        assert!(!lifecycle.transition(State::Starting));
        assert!(lifecycle.transition(State::Stopping));
        assert!(lifecycle.transition(State::Terminated));
        assert!(!lifecycle.transition(State::Failed(Status::internal("late"))));
        assert_eq!(lifecycle.current(), State::Terminated);
    }

    #[test]
    fn alive_covers_starting_and_running_only() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.is_alive());
        lifecycle.transition(State::Starting);
        assert!(lifecycle.is_alive());
        lifecycle.transition(State::Running);
        assert!(lifecycle.is_alive());
        lifecycle.transition(State::Stopping);
        assert!(!lifecycle.is_alive());
    }

    #[test]
    fn failure_is_reachable_from_running() {
        let lifecycle = Lifecycle::new();
        lifecycle.transition(State::Starting);
        lifecycle.transition(State::Running);
        let status = Status::new(Code::PermissionDenied, "subscription revoked");
        assert!(lifecycle.transition(State::Failed(status.clone())));
        assert_eq!(lifecycle.current(), State::Failed(status));
    }
}
