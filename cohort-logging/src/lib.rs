//! Logging infrastructure for cohort
//!
//! Every process of a session logs through `tracing`. The rank a message
//! originates from is carried by a `rank` span rather than by a string
//! prefix, so interleaved output from many ranks stays attributable.

pub mod init;

pub use init::{init_logging_from_config, init_simple_tracing};

use tracing::Span;

/// Span identifying the process (rank) that emitted an event
pub fn rank_span(rank: usize) -> Span {
    tracing::info_span!("rank", rank)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_span_enters() {
        let span = rank_span(3);
        let _guard = span.enter();
        tracing::info!("inside rank span");
    }
}
