use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown {kind} value: {value:?}")]
    UnknownVariant { kind: &'static str, value: String },
}
