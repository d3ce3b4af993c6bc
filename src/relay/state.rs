//! Relay state transitions, free of any I/O.

/// Where the relay is in its input/flow cycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RelayState {
    Idle,
    Connecting,
    /// connected, no input chunk is being read or written
    Connected,
    ReadingInput,
    WritingFlow,
    /// chunk accepted by the flow, waiting for it to be written out
    Flushing,
    Closed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RelayEvent {
    Open,
    Connected,
    InputData,
    InputEof,
    FlowWritable,
    ChunkAccepted,
    ChunkBlocked,
    AllWritten,
    PeerClosed,
    Error,
}

/// Side effects a transition asks the driver to perform, in order.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Action {
    /// allow the input source to deliver one more chunk
    StartInput,
    StopInput,
    EnableReadable,
    DisableReadable,
    /// writable and all-written callbacks
    EnableWritable,
    DisableWritable,
    /// write the buffered chunk to the flow in one call
    WriteChunk,
    /// shut down the flow's sending side
    ShutdownFlow,
    StopLoop,
    /// fatal, stop with an error
    Terminate,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Step {
    pub next: RelayState,
    pub actions: &'static [Action],
}

impl Step {
    const fn to(next: RelayState, actions: &'static [Action]) -> Self {
        Self { next, actions }
    }
}

impl RelayState {
    /// The transport is up and the receive path is live.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            RelayState::Connected
                | RelayState::ReadingInput
                | RelayState::WritingFlow
                | RelayState::Flushing
        )
    }
}

/// Compute the next state and the actions for `event` in `state`.
///
/// Pairs without a transition keep the state and do nothing.
pub fn transition(state: RelayState, event: RelayEvent) -> Step {
    use Action::*;
    use RelayState as S;

    match (state, event) {
        (S::Closed, _) => Step::to(S::Closed, &[]),

        (_, RelayEvent::Error) => Step::to(S::Closed, &[Terminate]),
        (_, RelayEvent::PeerClosed) => {
            Step::to(S::Closed, &[DisableReadable, DisableWritable, StopLoop])
        }

        (S::Idle, RelayEvent::Open) => Step::to(S::Connecting, &[]),
        (S::Connecting, RelayEvent::Connected) => {
            Step::to(S::ReadingInput, &[StartInput, EnableReadable])
        }

        (S::ReadingInput, RelayEvent::InputData) => {
            Step::to(S::WritingFlow, &[StopInput, EnableWritable])
        }
        (S::ReadingInput, RelayEvent::InputEof) => {
            Step::to(S::Connected, &[StopInput, DisableWritable, ShutdownFlow])
        }

        (S::WritingFlow, RelayEvent::FlowWritable) => Step::to(S::WritingFlow, &[WriteChunk]),
        (S::WritingFlow, RelayEvent::ChunkAccepted) => Step::to(S::Flushing, &[DisableWritable]),
        (S::WritingFlow, RelayEvent::ChunkBlocked) => Step::to(S::WritingFlow, &[]),

        (S::Flushing, RelayEvent::AllWritten) => Step::to(S::ReadingInput, &[StartInput]),

        (state, _) => Step::to(state, &[]),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const STATES: [RelayState; 7] = [
        RelayState::Idle,
        RelayState::Connecting,
        RelayState::Connected,
        RelayState::ReadingInput,
        RelayState::WritingFlow,
        RelayState::Flushing,
        RelayState::Closed,
    ];

    const EVENTS: [RelayEvent; 10] = [
        RelayEvent::Open,
        RelayEvent::Connected,
        RelayEvent::InputData,
        RelayEvent::InputEof,
        RelayEvent::FlowWritable,
        RelayEvent::ChunkAccepted,
        RelayEvent::ChunkBlocked,
        RelayEvent::AllWritten,
        RelayEvent::PeerClosed,
        RelayEvent::Error,
    ];

    fn run(events: &[RelayEvent]) -> (RelayState, Vec<Action>) {
        let mut state = RelayState::Idle;
        let mut actions = vec![];
        for event in events {
            let step = transition(state, *event);
            state = step.next;
            actions.extend_from_slice(step.actions);
        }

        (state, actions)
    }

    #[test]
    fn one_chunk_cycle() {
        use RelayEvent::*;

        let (state, actions) = run(&[
            Open,
            Connected,
            InputData,
            FlowWritable,
            ChunkAccepted,
            AllWritten,
        ]);

        assert_eq!(state, RelayState::ReadingInput);
        assert_eq!(
            actions,
            [
                Action::StartInput,
                Action::EnableReadable,
                Action::StopInput,
                Action::EnableWritable,
                Action::WriteChunk,
                Action::DisableWritable,
                Action::StartInput,
            ]
        );
    }

    #[test]
    fn blocked_chunk_keeps_writing() {
        let step = transition(RelayState::WritingFlow, RelayEvent::ChunkBlocked);
        assert_eq!(step.next, RelayState::WritingFlow);
        assert!(step.actions.is_empty());

        let step = transition(RelayState::WritingFlow, RelayEvent::FlowWritable);
        assert_eq!(step.actions, [Action::WriteChunk]);
    }

    #[test]
    fn input_eof_shuts_down_but_keeps_receiving() {
        let step = transition(RelayState::ReadingInput, RelayEvent::InputEof);

        assert_eq!(step.next, RelayState::Connected);
        assert!(step.next.is_connected());
        assert!(step.actions.contains(&Action::ShutdownFlow));
        assert!(!step.actions.contains(&Action::DisableReadable));
    }

    #[test]
    fn no_new_input_before_all_written() {
        for event in EVENTS {
            if event == RelayEvent::AllWritten {
                continue;
            }

            let step = transition(RelayState::Flushing, event);
            assert!(!step.actions.contains(&Action::StartInput), "{event:?}");
        }
    }

    #[test]
    fn peer_close_stops_loop() {
        for state in STATES.into_iter().filter(|state| *state != RelayState::Closed) {
            let step = transition(state, RelayEvent::PeerClosed);

            assert_eq!(step.next, RelayState::Closed);
            assert!(step.actions.contains(&Action::StopLoop), "{state:?}");
        }
    }

    proptest! {
        #[test]
        fn closed_is_terminal(events in proptest::collection::vec(0..EVENTS.len(), 0..32)) {
            let mut state = RelayState::Closed;
            for event in events {
                let step = transition(state, EVENTS[event]);
                prop_assert!(step.actions.is_empty());
                state = step.next;
            }

            prop_assert_eq!(state, RelayState::Closed);
        }

        #[test]
        fn error_always_terminates(state in 0..STATES.len() - 1) {
            let step = transition(STATES[state], RelayEvent::Error);

            prop_assert_eq!(step.next, RelayState::Closed);
            prop_assert_eq!(step.actions, &[Action::Terminate][..]);
        }
    }
}
