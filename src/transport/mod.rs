/// Local filesystem transport: shard discovery and row decoding.
pub mod fs;
