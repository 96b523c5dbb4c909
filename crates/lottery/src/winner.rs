use serde::{Deserialize, Serialize};

use txevents_core::{DomainError, DomainResult};

/// A lottery winner. `id` is the lottery number and is chosen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Winner {
    pub id: i64,
    pub name: String,
}

impl Winner {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Reject records the store would accept but that make no sense.
    pub fn validate(&self) -> DomainResult<()> {
        if self.id <= 0 {
            return Err(DomainError::validation(format!(
                "lottery id must be positive, got {}",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("winner name must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_a_named_positive_winner() {
        assert!(Winner::new(1, "Mike").validate().is_ok());
    }

    #[test]
    fn rejects_blank_names() {
        let err = Winner::new(1, "   ").validate().unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    proptest! {
        #[test]
        fn non_positive_ids_are_rejected(id in i64::MIN..=0i64) {
            prop_assert!(Winner::new(id, "Jim").validate().is_err());
        }
    }
}
