// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The states a backup goes through and the rules for moving between them.
//!
//! The transition function is pure, the [`BackupMachine`] feeds it events and
//! publishes the resulting states to subscribers.
//!
//! [`BackupMachine`]: super::BackupMachine

/// The state of the room key backup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BackupState {
    /// We don't know yet whether a backup exists, or the last check failed.
    #[default]
    Unknown,
    /// We are asking the homeserver for its current backup version.
    CheckingBackUpOnHomeserver,
    /// There is no backup, or it was disabled.
    Disabled,
    /// The homeserver has a different backup version than the one we were
    /// backing up to.
    WrongBackUpVersion,
    /// The backup on the homeserver isn't signed by anything we trust.
    NotTrusted,
    /// A new backup version is being created.
    Enabling,
    /// The backup is usable and nothing needs to be uploaded.
    ReadyToBackUp,
    /// New room keys arrived, they will be uploaded after a short, random,
    /// delay.
    WillBackUp,
    /// Room keys are being uploaded.
    BackingUp,
}

/// The result of comparing the homeserver's backup with our own state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The homeserver has no backup.
    NoBackup,
    /// The backup isn't signed by a device or identity we trust, or uses an
    /// algorithm we don't support.
    NotTrusted,
    /// The backup replaced the one we used before.
    WrongVersion,
    /// We can back up to this backup.
    Usable,
}

/// Something that happened to the backup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupEvent {
    /// We started asking the homeserver for its backup.
    CheckStarted,
    /// The homeserver answered.
    CheckFinished(CheckOutcome),
    /// We started creating a new backup version.
    EnableStarted,
    /// The new backup version was created.
    Enabled,
    /// Room keys are waiting to be backed up.
    KeysPending,
    /// The random delay before an upload ran out.
    DelayElapsed,
    /// A batch of room keys was uploaded.
    UploadFinished {
        /// More keys are waiting.
        remaining: bool,
    },
    /// A request failed, the backup needs to be checked again.
    Failed,
    /// The homeserver switched to another backup version.
    VersionChanged,
    /// The backup was turned off locally.
    DisableRequested,
}

impl BackupState {
    /// Is a request for this state in flight.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            BackupState::CheckingBackUpOnHomeserver | BackupState::Enabling | BackupState::BackingUp
        )
    }

    /// Are room keys being backed up in this state.
    pub fn is_enabled(self) -> bool {
        matches!(
            self,
            BackupState::ReadyToBackUp | BackupState::WillBackUp | BackupState::BackingUp
        )
    }

    /// The state that follows this one after the given event, `None` if the
    /// event isn't allowed in this state.
    pub fn transition(self, event: BackupEvent) -> Option<BackupState> {
        use BackupEvent as E;
        use BackupState as S;

        let next = match (self, event) {
            (_, E::DisableRequested) => S::Disabled,
            (_, E::VersionChanged) => S::WrongBackUpVersion,

            (S::CheckingBackUpOnHomeserver | S::Enabling | S::BackingUp, E::Failed) => S::Unknown,

            (state, E::CheckStarted) if !state.is_busy() => S::CheckingBackUpOnHomeserver,
            (S::CheckingBackUpOnHomeserver, E::CheckFinished(outcome)) => match outcome {
                CheckOutcome::NoBackup => S::Disabled,
                CheckOutcome::NotTrusted => S::NotTrusted,
                CheckOutcome::WrongVersion => S::WrongBackUpVersion,
                CheckOutcome::Usable => S::ReadyToBackUp,
            },

            (state, E::EnableStarted) if !state.is_busy() => S::Enabling,
            (S::Enabling, E::Enabled) => S::ReadyToBackUp,

            (S::ReadyToBackUp, E::KeysPending) => S::WillBackUp,
            (S::WillBackUp, E::DelayElapsed) => S::BackingUp,
            (S::BackingUp, E::UploadFinished { remaining: true }) => S::BackingUp,
            (S::BackingUp, E::UploadFinished { remaining: false }) => S::ReadyToBackUp,

            _ => return None,
        };

        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::{BackupEvent as E, BackupState as S, CheckOutcome};

    fn run(events: &[E]) -> Vec<S> {
        let mut state = S::Unknown;
        let mut visited = vec![state];

        for &event in events {
            state = state.transition(event).unwrap_or_else(|| {
                panic!("the event {event:?} should be allowed in the state {state:?}")
            });
            visited.push(state);
        }

        visited
    }

    #[test]
    fn a_usable_backup_loops_through_uploads() {
        let states = run(&[
            E::CheckStarted,
            E::CheckFinished(CheckOutcome::Usable),
            E::KeysPending,
            E::DelayElapsed,
            E::UploadFinished { remaining: true },
            E::UploadFinished { remaining: false },
            E::KeysPending,
        ]);

        assert_eq!(
            states,
            [
                S::Unknown,
                S::CheckingBackUpOnHomeserver,
                S::ReadyToBackUp,
                S::WillBackUp,
                S::BackingUp,
                S::BackingUp,
                S::ReadyToBackUp,
                S::WillBackUp,
            ]
        );
    }

    #[test]
    fn check_outcomes() {
        let checking = S::CheckingBackUpOnHomeserver;

        assert_eq!(
            checking.transition(E::CheckFinished(CheckOutcome::NoBackup)),
            Some(S::Disabled)
        );
        assert_eq!(
            checking.transition(E::CheckFinished(CheckOutcome::NotTrusted)),
            Some(S::NotTrusted)
        );
        assert_eq!(
            checking.transition(E::CheckFinished(CheckOutcome::WrongVersion)),
            Some(S::WrongBackUpVersion)
        );
    }

    #[test]
    fn failures_return_to_unknown() {
        for state in [S::CheckingBackUpOnHomeserver, S::Enabling, S::BackingUp] {
            assert_eq!(state.transition(E::Failed), Some(S::Unknown));
        }

        for state in [S::ReadyToBackUp, S::WillBackUp, S::Disabled, S::NotTrusted] {
            assert_eq!(state.transition(E::Failed), None);
        }
    }

    #[test]
    fn version_changes_win_everywhere() {
        for state in [S::Unknown, S::ReadyToBackUp, S::WillBackUp, S::BackingUp, S::NotTrusted] {
            assert_eq!(state.transition(E::VersionChanged), Some(S::WrongBackUpVersion));
        }
    }

    #[test]
    fn busy_states_refuse_new_work() {
        assert_eq!(S::BackingUp.transition(E::CheckStarted), None);
        assert_eq!(S::Enabling.transition(E::EnableStarted), None);
        assert_eq!(S::Disabled.transition(E::KeysPending), None);
        assert_eq!(S::ReadyToBackUp.transition(E::DelayElapsed), None);

        let states = run(&[E::EnableStarted, E::Enabled]);
        assert_eq!(states.last(), Some(&S::ReadyToBackUp));
    }
}
