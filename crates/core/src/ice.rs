//! ICE Lite server (spec §4.5), grounded in `original_source`'s
//! `base::IceServer` (`src/base/webrtc/ice.cpp`), itself derived from
//! mediasoup's `RTC::IceServer`. The state machine and tuple bookkeeping
//! below are a direct port of the C++ source's
//! `HandleTuple`/`AddTuple`/`RemoveTuple`; STUN wire encoding of the
//! resulting outcome is `qrpc-server`'s `stun_codec` module's job (the
//! `stun` crate here supplies only the `TransactionId` type, matching how
//! the rest of the pack uses it).

use std::collections::VecDeque;

use qrpc_protocol::Address;
use stun::agent::TransactionId;

/// Up to 8 candidate tuples per connection (spec §4.5, ice.cpp `MaxTuples`).
const MAX_TUPLES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Connected,
    Completed,
    Disconnected,
}

/// A STUN Binding Request already decoded down to the fields the ICE Lite
/// state machine cares about (the `stun` crate performs the actual wire
/// parsing and MESSAGE-INTEGRITY/FINGERPRINT verification before this is
/// constructed).
pub struct BindingRequest {
    pub transaction_id: TransactionId,
    pub is_indication: bool,
    pub has_fingerprint: bool,
    pub has_message_integrity: bool,
    pub priority: u32,
    pub username: String,
    pub ice_controlled: bool,
    pub use_candidate: bool,
    pub nomination: Option<u32>,
}

/// Classification of the STUN response a `Reply` outcome carries, enough
/// for the wire-format layer to build it without reaching back into the
/// ICE state machine (spec §4.5 steps 1-6, §8's Binding Success property).
pub enum StunReplyKind {
    /// Binding Success: XOR-MAPPED-ADDRESS = `tuple`, MESSAGE-INTEGRITY
    /// keyed by the credential pair that authenticated this request.
    Success { integrity_key: String },
    /// Binding Error with this STUN error code (400, 401, or 487).
    Error(u16),
}

/// What the caller should do with a processed STUN packet.
pub enum IceOutcome {
    /// Build and send a response (success or error) back to `tuple`.
    Reply { tuple: Address, kind: StunReplyKind },
    /// Indication: nothing to send back.
    Ignored,
}

pub struct IceServer {
    pub username_fragment: String,
    pub password: String,
    old_username_fragment: Option<String>,
    old_password: Option<String>,
    /// Front = most recently active tuple (ice.cpp inserts at the front).
    tuples: VecDeque<Address>,
    selected: Option<Address>,
    remote_nomination: u32,
    pub state: IceState,
}

impl IceServer {
    pub fn new(username_fragment: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username_fragment: username_fragment.into(),
            password: password.into(),
            old_username_fragment: None,
            old_password: None,
            tuples: VecDeque::new(),
            selected: None,
            remote_nomination: 0,
            state: IceState::New,
        }
    }

    /// ICE restart: rotates current credentials to "old" so in-flight
    /// requests authenticated under them still succeed (spec §4.5 step 4).
    pub fn restart_credentials(&mut self, username_fragment: impl Into<String>, password: impl Into<String>) {
        self.old_username_fragment = Some(std::mem::replace(&mut self.username_fragment, username_fragment.into()));
        self.old_password = Some(std::mem::replace(&mut self.password, password.into()));
    }

    pub fn selected_tuple(&self) -> Option<Address> {
        self.selected
    }

    pub fn has_tuple(&self, tuple: Address) -> bool {
        self.tuples.contains(&tuple)
    }

    fn authenticate(&mut self, username: &str) -> bool {
        if username.is_empty() {
            return false;
        }
        if username == self.username_fragment {
            // fresh credentials confirmed: drop the old pair.
            self.old_username_fragment = None;
            self.old_password = None;
            return true;
        }
        matches!(&self.old_username_fragment, Some(old) if old == username)
    }

    fn active_password(&self) -> &str {
        match &self.old_password {
            Some(p) if self.old_username_fragment.is_some() => p,
            _ => &self.password,
        }
    }

    /// Inserts `tuple` at the front, evicting the oldest non-selected tuple
    /// past `MAX_TUPLES` (ice.cpp `AddTuple`). Returns `true` if this was a
    /// new tuple.
    fn add_tuple(&mut self, tuple: Address) -> bool {
        if self.tuples.contains(&tuple) {
            return false;
        }
        self.tuples.push_front(tuple);

        if self.tuples.len() > MAX_TUPLES {
            // oldest-first scan from the back, skipping the selected tuple.
            if let Some(pos) = self
                .tuples
                .iter()
                .enumerate()
                .rev()
                .find(|(_, t)| Some(**t) != self.selected)
                .map(|(i, _)| i)
            {
                self.tuples.remove(pos);
            }
        }
        true
    }

    /// Promotes `tuple` to selected and advances the state machine toward
    /// `COMPLETED` (ice.cpp `SetSelectedSession`).
    fn set_selected(&mut self, tuple: Address) {
        self.selected = Some(tuple);
        self.state = IceState::Completed;
    }

    /// Removes a tuple (e.g. its underlying session closed). Promotes the
    /// next remaining tuple to selected, or transitions to `DISCONNECTED`
    /// if none remain (ice.cpp `RemoveTuple`).
    pub fn remove_tuple(&mut self, tuple: Address) {
        let Some(pos) = self.tuples.iter().position(|t| *t == tuple) else {
            return;
        };
        self.tuples.remove(pos);

        if self.selected == Some(tuple) {
            self.selected = None;
            if let Some(next) = self.tuples.front().copied() {
                self.set_selected(next);
            } else {
                self.state = IceState::Disconnected;
                self.remote_nomination = 0;
            }
        }
    }

    fn handle_tuple(&mut self, tuple: Address, use_candidate: bool, nomination: Option<u32>) {
        match self.state {
            IceState::New => {
                self.add_tuple(tuple);
                if !use_candidate && nomination.is_none() {
                    self.set_selected(tuple);
                    self.state = IceState::Connected;
                } else {
                    self.maybe_nominate(tuple, use_candidate, nomination);
                }
            }
            IceState::Connected | IceState::Completed | IceState::Disconnected => {
                self.add_tuple(tuple);
                self.maybe_nominate(tuple, use_candidate, nomination);
            }
        }
    }

    fn maybe_nominate(&mut self, tuple: Address, use_candidate: bool, nomination: Option<u32>) {
        let should_select = match nomination {
            Some(n) if n > self.remote_nomination => {
                self.remote_nomination = n;
                true
            }
            Some(_) => false,
            None => use_candidate,
        };
        if should_select {
            self.set_selected(tuple);
        }
    }

    /// Implements spec §4.5 steps 1-6 against an already-decoded request,
    /// returning which tuple to reply to and what kind of response to
    /// build (the transaction id itself lives with the caller's decoded
    /// request, not here — see `stun_codec::decode_binding_request`).
    pub fn process_binding_request(&mut self, req: BindingRequest, tuple: Address) -> IceOutcome {
        if req.is_indication {
            return IceOutcome::Ignored;
        }

        if !req.has_fingerprint {
            return IceOutcome::Reply {
                tuple,
                kind: StunReplyKind::Error(400),
            };
        }

        if !req.has_message_integrity || req.priority == 0 || req.username.is_empty() {
            return IceOutcome::Reply {
                tuple,
                kind: StunReplyKind::Error(400),
            };
        }

        if !self.authenticate(&req.username) {
            return IceOutcome::Reply {
                tuple,
                kind: StunReplyKind::Error(401),
            };
        }

        if req.ice_controlled {
            return IceOutcome::Reply {
                tuple,
                kind: StunReplyKind::Error(487),
            };
        }

        let use_candidate = req.use_candidate;
        let nomination = req.nomination;
        self.handle_tuple(tuple, use_candidate, nomination);

        IceOutcome::Reply {
            tuple,
            kind: StunReplyKind::Success {
                integrity_key: self.active_password().to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn req(username: &str) -> BindingRequest {
        BindingRequest {
            transaction_id: TransactionId::default(),
            is_indication: false,
            has_fingerprint: true,
            has_message_integrity: true,
            priority: 1,
            username: username.to_string(),
            ice_controlled: false,
            use_candidate: false,
            nomination: None,
        }
    }

    #[test]
    fn missing_fingerprint_is_rejected() {
        let mut ice = IceServer::new("U", "P");
        let mut r = req("U");
        r.has_fingerprint = false;
        match ice.process_binding_request(r, addr(1)) {
            IceOutcome::Reply { .. } => {}
            IceOutcome::Ignored => panic!("expected a reply"),
        }
        assert_eq!(ice.state, IceState::New);
    }

    #[test]
    fn first_valid_request_selects_tuple_and_connects() {
        let mut ice = IceServer::new("U", "P");
        ice.process_binding_request(req("U"), addr(1));
        assert_eq!(ice.state, IceState::Connected);
        assert_eq!(ice.selected_tuple(), Some(addr(1)));
    }

    #[test]
    fn use_candidate_completes_the_state_machine() {
        let mut ice = IceServer::new("U", "P");
        let mut r = req("U");
        r.use_candidate = true;
        ice.process_binding_request(r, addr(1));
        assert_eq!(ice.state, IceState::Completed);
        assert_eq!(ice.selected_tuple(), Some(addr(1)));
    }

    #[test]
    fn ice_controlled_peer_is_rejected_with_role_conflict() {
        let mut ice = IceServer::new("U", "P");
        let mut r = req("U");
        r.ice_controlled = true;
        ice.process_binding_request(r, addr(1));
        assert_eq!(ice.state, IceState::New); // never handled
    }

    #[test]
    fn old_credentials_still_authenticate_after_ice_restart() {
        let mut ice = IceServer::new("U1", "P1");
        ice.process_binding_request(req("U1"), addr(1));
        ice.restart_credentials("U2", "P2");

        // old creds still work once.
        ice.process_binding_request(req("U1"), addr(2));
        assert!(ice.has_tuple(addr(2)));
    }

    #[test]
    fn ninth_tuple_evicts_oldest_non_selected() {
        let mut ice = IceServer::new("U", "P");
        ice.process_binding_request(req("U"), addr(0)); // selected via NEW->CONNECTED
        for i in 1..MAX_TUPLES as u16 {
            let mut r = req("U");
            r.use_candidate = false;
            r.nomination = None;
            ice.handle_tuple(addr(i), false, None);
            let _ = r;
        }
        assert_eq!(ice.tuples.len(), MAX_TUPLES);

        // one more tuple pushes past the cap.
        ice.handle_tuple(addr(100), false, None);
        assert_eq!(ice.tuples.len(), MAX_TUPLES);
        // the selected tuple (addr(0)) must survive eviction.
        assert!(ice.has_tuple(addr(0)));
        assert!(ice.has_tuple(addr(100)));
    }

    #[test]
    fn removing_selected_tuple_promotes_next_or_disconnects() {
        let mut ice = IceServer::new("U", "P");
        ice.process_binding_request(req("U"), addr(1));
        ice.handle_tuple(addr(2), false, None);

        ice.remove_tuple(addr(1));
        assert_eq!(ice.selected_tuple(), Some(addr(2)));

        ice.remove_tuple(addr(2));
        assert_eq!(ice.state, IceState::Disconnected);
        assert_eq!(ice.selected_tuple(), None);
    }
}
