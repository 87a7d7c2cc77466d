/*
 * Copyright 2020 Joyent, Inc.
 */

//! Communication object lifecycle.
//!
//! ```text
//! Created -> Opening -> Opened -> Closing -> Closed
//!    |          |          |         |
//!    +----------+----------+---------+----> Faulted
//! ```
//!
//! `Faulted` is terminal for every transition except abort, which moves any
//! state to `Closed`.

use std::fmt;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommunicationState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl CommunicationState {
    /// True once a graceful close, abort or fault has begun.
    pub fn is_closing_or_closed(self) -> bool {
        matches!(
            self,
            CommunicationState::Closing | CommunicationState::Closed | CommunicationState::Faulted
        )
    }

    pub fn can_transition_to(self, next: CommunicationState) -> bool {
        use CommunicationState::*;
        match (self, next) {
            (Created, Opening) | (Opening, Opened) => true,
            (Created, Closing) | (Opening, Closing) | (Opened, Closing) => true,
            (Closing, Closed) => true,
            (Closed, _) | (Faulted, _) => false,
            (_, Faulted) => true,
            _ => false,
        }
    }

    /// Moves `state` to `next`, failing when the transition is not legal.
    pub fn transition(state: &mut CommunicationState, next: CommunicationState) -> Result<(), Error> {
        if !state.can_transition_to(next) {
            return match *state {
                CommunicationState::Closed | CommunicationState::Closing => Err(Error::ObjectDisposed(
                    format!("cannot move from {} to {}", state, next),
                )),
                _ => Err(Error::invalid_operation(format!(
                    "cannot move from {} to {}",
                    state, next
                ))),
            };
        }
        *state = next;
        Ok(())
    }
}

impl fmt::Display for CommunicationState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CommunicationState::Created => "created",
            CommunicationState::Opening => "opening",
            CommunicationState::Opened => "opened",
            CommunicationState::Closing => "closing",
            CommunicationState::Closed => "closed",
            CommunicationState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::CommunicationState::*;
    use super::*;

    #[test]
    fn happy_path() {
        let mut s = Created;
        for next in [Opening, Opened, Closing, Closed] {
            CommunicationState::transition(&mut s, next).unwrap();
        }
        assert_eq!(s, Closed);
    }

    #[test]
    fn faulted_is_terminal() {
        for from in [Created, Opening, Opened, Closing] {
            assert!(from.can_transition_to(Faulted));
        }
        for next in [Created, Opening, Opened, Closing, Closed, Faulted] {
            assert!(!Faulted.can_transition_to(next));
            assert!(!Closed.can_transition_to(next));
        }
    }

    #[test]
    fn illegal_moves_fail() {
        let mut s = Opened;
        assert!(matches!(
            CommunicationState::transition(&mut s, Opening),
            Err(Error::InvalidOperation { .. })
        ));
        let mut s = Closed;
        assert!(matches!(
            CommunicationState::transition(&mut s, Closing),
            Err(Error::ObjectDisposed(_))
        ));
        assert_eq!(s, Closed);
    }
}
