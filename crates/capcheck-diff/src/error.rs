//! Diff errors

use capcheck_model::ModelError;

/// Errors from loading inputs or allow-list rules
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    /// Input document is not valid JSON of the expected shape
    #[error("failed to parse {what}: {source}")]
    Parse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Input parsed but is neither a snapshot, a progress document, nor a type map
    #[error("{what} has no recognizable type map")]
    UnrecognizedShape { what: &'static str },

    /// Allow-list file is not valid TOML of the expected shape
    #[error("failed to parse allow-list: {0}")]
    RuleFormat(#[from] toml::de::Error),

    /// A rule carries a regex that does not compile
    #[error("rule `{rule}` has invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        rule: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Two rules share an id
    #[error("duplicate rule id `{0}`")]
    DuplicateRule(String),

    /// Snapshot could not be digested or converted
    #[error(transparent)]
    Model(#[from] ModelError),
}
