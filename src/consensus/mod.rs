//! Consensus core abstraction.
//!
//! The replication layer treats consensus (leader election, log
//! replication, quorum commit) as an opaque collaborator behind the
//! [`core::ConsensusCore`] trait.  Committed entries and membership /
//! leadership changes arrive as [`core::ConsensusEvent`] messages on a
//! channel, never as direct callbacks into shared state.

pub mod core;
pub mod local;
