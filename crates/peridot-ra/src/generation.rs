//! Failover manager generation management.
//!
//! Each failover manager (FM and FMM) stamps its messages with a
//! generation number. The node tracks three values per manager: proposed,
//! receive and send. Messages from a superseded generation are dropped;
//! a proposal raises the proposed value and is answered with the current
//! one; an update installs the new send generation.

use std::sync::Mutex;

use peridot_types::{FailoverManagerKind, GenerationHeader, GenerationState};
use peridot_wire::GenerationBody;
use tracing::debug;

/// Outcome of checking an incoming message's generation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationCheck {
    /// Process the message (the receive generation advanced if needed).
    Accept,

    /// The message is from a superseded generation; drop it.
    Stale,
}

#[derive(Debug, Default)]
struct Generations {
    fm: GenerationState,
    fmm: GenerationState,
}

impl Generations {
    fn for_kind(&mut self, kind: FailoverManagerKind) -> &mut GenerationState {
        match kind {
            FailoverManagerKind::Fm => &mut self.fm,
            FailoverManagerKind::Fmm => &mut self.fmm,
        }
    }
}

/// Per-node generation bookkeeping for both failover managers.
#[derive(Debug, Default)]
pub struct GenerationStateManager {
    state: Mutex<Generations>,
}

impl GenerationStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks an incoming header against the receive generation.
    ///
    /// A newer generation advances the receive value; an older one marks
    /// the message stale.
    pub fn check_receive(&self, header: GenerationHeader) -> GenerationCheck {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let generations = state.for_kind(header.kind);

        if header.generation < generations.receive() {
            debug!(
                kind = %header.kind,
                incoming = %header.generation,
                current = %generations.receive(),
                "dropping message from superseded generation"
            );
            return GenerationCheck::Stale;
        }
        generations.set_receive(header.generation);
        GenerationCheck::Accept
    }

    /// Handles a generation proposal: raises the proposed value and
    /// returns the reply body carrying the node's current receive value.
    pub fn handle_proposal(&self, body: GenerationBody) -> GenerationBody {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let generations = state.for_kind(body.generation.kind);
        generations.set_proposed(body.generation.generation);

        GenerationBody {
            generation: body.generation,
            current: Some(generations.receive()),
        }
    }

    /// Handles a generation update: installs the new send generation.
    /// Returns false when the update is stale.
    pub fn handle_update(&self, body: GenerationBody) -> bool {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let generations = state.for_kind(body.generation.kind);
        generations.set_send(body.generation.generation)
    }

    pub fn send_generation(&self, kind: FailoverManagerKind) -> GenerationHeader {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        GenerationHeader::new(state.for_kind(kind).send(), kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peridot_types::GenerationNumber;

    fn header(kind: FailoverManagerKind, generation: i64) -> GenerationHeader {
        GenerationHeader::new(GenerationNumber::new(generation), kind)
    }

    #[test]
    fn receive_generation_is_monotonic_per_kind() {
        let manager = GenerationStateManager::new();

        assert_eq!(
            manager.check_receive(header(FailoverManagerKind::Fm, 5)),
            GenerationCheck::Accept
        );
        assert_eq!(
            manager.check_receive(header(FailoverManagerKind::Fm, 3)),
            GenerationCheck::Stale
        );

        // FMM generations are independent of FM generations.
        assert_eq!(
            manager.check_receive(header(FailoverManagerKind::Fmm, 1)),
            GenerationCheck::Accept
        );
    }

    #[test]
    fn equal_generation_is_accepted() {
        let manager = GenerationStateManager::new();
        manager.check_receive(header(FailoverManagerKind::Fm, 5));
        assert_eq!(
            manager.check_receive(header(FailoverManagerKind::Fm, 5)),
            GenerationCheck::Accept
        );
    }

    #[test]
    fn proposal_reply_carries_current_generation() {
        let manager = GenerationStateManager::new();
        manager.check_receive(header(FailoverManagerKind::Fm, 4));

        let reply = manager.handle_proposal(GenerationBody {
            generation: header(FailoverManagerKind::Fm, 9),
            current: None,
        });
        assert_eq!(reply.current, Some(GenerationNumber::new(4)));
    }

    #[test]
    fn update_installs_send_generation() {
        let manager = GenerationStateManager::new();
        assert!(manager.handle_update(GenerationBody {
            generation: header(FailoverManagerKind::Fm, 7),
            current: None,
        }));
        assert_eq!(
            manager.send_generation(FailoverManagerKind::Fm).generation,
            GenerationNumber::new(7)
        );

        // Stale update is ignored.
        assert!(!manager.handle_update(GenerationBody {
            generation: header(FailoverManagerKind::Fm, 6),
            current: None,
        }));
    }
}
