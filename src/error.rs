use thiserror::Error;

/// Errors surfaced by [`RacePair`](crate::RacePair).
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value lies outside its allowed range.
    #[error("{field} = {value} is out of range, expected {bound}")]
    InvalidConfig {
        field: &'static str,
        value: String,
        bound: &'static str,
    },

    #[error("failed to spawn thread B")]
    SpawnThreadB(#[source] std::io::Error),
}
