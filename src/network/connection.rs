//! Motor link state machine
//!
//! Holds the current link state and publishes every transition, in order,
//! to any number of subscribers.

use std::fmt;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// State of the motor link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No link to the motor
    Disconnected,
    /// Settings sent, confirmation pending
    SettingsSent,
    /// Settings confirmed, start may be sent
    ReadyToStart,
    /// Started; regression values are streamed
    Connected,
    /// A command failed to leave this host
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::SettingsSent => "settings sent",
            ConnectionState::ReadyToStart => "ready to start",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Events that may move the link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkTrigger {
    SettingsSent,
    SettingsFailed,
    ConfirmationReceived,
    StartSent,
    StartFailed,
    DisconnectSent,
    DisconnectFailed,
    /// Explicit process-level reset
    Reset,
}

impl ConnectionState {
    /// Target state for a trigger, or `None` if the trigger does not apply here
    pub fn next(self, trigger: LinkTrigger) -> Option<ConnectionState> {
        use ConnectionState::*;

        match (self, trigger) {
            (_, LinkTrigger::SettingsSent) => Some(SettingsSent),
            (_, LinkTrigger::SettingsFailed) => Some(Error),
            (SettingsSent, LinkTrigger::ConfirmationReceived) => Some(ReadyToStart),
            (ReadyToStart, LinkTrigger::StartSent) => Some(Connected),
            (_, LinkTrigger::StartFailed) => Some(Error),
            (_, LinkTrigger::DisconnectSent | LinkTrigger::Reset) => Some(Disconnected),
            _ => None,
        }
    }
}

/// One applied transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub trigger: LinkTrigger,
}

struct Inner {
    state: ConnectionState,
    subscribers: Vec<mpsc::UnboundedSender<StateChange>>,
}

/// Single authoritative holder of the link state
pub struct ConnectionStateMachine {
    inner: Mutex<Inner>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    /// Apply a trigger; returns the change if one happened.
    ///
    /// Subscribers are notified under the same lock, so they observe
    /// transitions in the order they were applied.
    pub fn apply(&self, trigger: LinkTrigger) -> Option<StateChange> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        let to = from.next(trigger)?;

        inner.state = to;
        let change = StateChange { from, to, trigger };
        inner.subscribers.retain(|tx| tx.send(change).is_ok());

        tracing::debug!("Link state {} -> {} ({:?})", from, to, trigger);
        Some(change)
    }

    /// Receive every future transition; never coalesced or dropped
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.push(tx);
        rx
    }

    /// Live subscribers, counting any dropped since the last transition or subscribe
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Return to `Disconnected` without sending anything
    pub fn reset(&self) -> Option<StateChange> {
        self.apply(LinkTrigger::Reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [ConnectionState; 5] = [
        ConnectionState::Disconnected,
        ConnectionState::SettingsSent,
        ConnectionState::ReadyToStart,
        ConnectionState::Connected,
        ConnectionState::Error,
    ];

    const TRIGGERS: [LinkTrigger; 8] = [
        LinkTrigger::SettingsSent,
        LinkTrigger::SettingsFailed,
        LinkTrigger::ConfirmationReceived,
        LinkTrigger::StartSent,
        LinkTrigger::StartFailed,
        LinkTrigger::DisconnectSent,
        LinkTrigger::DisconnectFailed,
        LinkTrigger::Reset,
    ];

    fn expected(state: ConnectionState, trigger: LinkTrigger) -> ConnectionState {
        use ConnectionState::*;
        match trigger {
            LinkTrigger::SettingsSent => SettingsSent,
            LinkTrigger::SettingsFailed | LinkTrigger::StartFailed => Error,
            LinkTrigger::ConfirmationReceived if state == SettingsSent => ReadyToStart,
            LinkTrigger::StartSent if state == ReadyToStart => Connected,
            LinkTrigger::DisconnectSent | LinkTrigger::Reset => Disconnected,
            _ => state,
        }
    }

    fn machine_in(state: ConnectionState) -> ConnectionStateMachine {
        let machine = ConnectionStateMachine::new();
        machine.inner.lock().state = state;
        machine
    }

    #[test]
    fn test_initial_state() {
        assert_eq!(ConnectionStateMachine::new().current(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_every_state_trigger_pair() {
        for state in STATES {
            for trigger in TRIGGERS {
                let machine = machine_in(state);
                machine.apply(trigger);
                assert_eq!(
                    machine.current(),
                    expected(state, trigger),
                    "{:?} + {:?}",
                    state,
                    trigger
                );
            }
        }
    }

    #[test]
    fn test_unlisted_triggers_report_no_change() {
        let machine = machine_in(ConnectionState::Connected);
        assert!(machine.apply(LinkTrigger::ConfirmationReceived).is_none());
        assert!(machine.apply(LinkTrigger::DisconnectFailed).is_none());
        assert_eq!(machine.current(), ConnectionState::Connected);
    }

    #[test]
    fn test_subscribers_see_every_transition() {
        let machine = ConnectionStateMachine::new();
        let mut first = machine.subscribe();
        let mut second = machine.subscribe();

        let triggers = [
            LinkTrigger::SettingsSent,
            LinkTrigger::ConfirmationReceived,
            LinkTrigger::StartSent,
            LinkTrigger::DisconnectSent,
            LinkTrigger::SettingsSent,
            LinkTrigger::SettingsSent,
        ];
        for trigger in triggers {
            machine.apply(trigger);
        }

        for rx in [&mut first, &mut second] {
            let mut seen = Vec::new();
            while let Ok(change) = rx.try_recv() {
                seen.push(change.to);
            }
            assert_eq!(
                seen,
                vec![
                    ConnectionState::SettingsSent,
                    ConnectionState::ReadyToStart,
                    ConnectionState::Connected,
                    ConnectionState::Disconnected,
                    ConnectionState::SettingsSent,
                    ConnectionState::SettingsSent,
                ]
            );
        }
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let machine = ConnectionStateMachine::new();
        drop(machine.subscribe());
        machine.apply(LinkTrigger::SettingsSent);
        assert!(machine.inner.lock().subscribers.is_empty());
    }
}
