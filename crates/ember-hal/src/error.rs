use thiserror::Error;

use crate::HalCategory;

pub type Result<T> = std::result::Result<T, HalError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    #[error("a provider is already registered for {0}")]
    DuplicateCategory(HalCategory),

    #[error("no provider registered for {0}")]
    NotFound(HalCategory),

    #[error("{category} has no attribute {attribute}")]
    UnknownAttribute { category: HalCategory, attribute: u32 },

    #[error("attribute {attribute} of {category} is read-only")]
    ReadOnly { category: HalCategory, attribute: u32 },

    #[error("value {value} is not valid for attribute {attribute} of {category}")]
    InvalidValue {
        category: HalCategory,
        attribute: u32,
        value: i32,
    },

    #[error("saved state for {category} is malformed: {reason}")]
    BadState {
        category: HalCategory,
        reason: &'static str,
    },
}
