/// Logical name of a source file taking part in a mix.
/// Examples: `pubmed`, `wikipedia`, `c4`
pub type SourceName = String;
/// Key under which retrieval progress is checkpointed.
/// Examples: `PubMed Abstracts`, `allenai/c4`
pub type DatasetKey = String;
/// Upstream dataset identifier on the hub.
/// Examples: `monology/pile-uncopyrighted`, `allenai/c4`
pub type DatasetId = String;
/// Token id emitted by the tokenizer.
pub type TokenId = u32;
/// Language tag reported by a language detector.
/// Examples: `en`, `de`
pub type LanguageTag = String;
