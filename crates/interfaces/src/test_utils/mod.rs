mod consensus;
/// Generators for different data structures like block headers, block bodies and ranges of those.
pub mod generators;

pub use consensus::TestConsensus;
