//! Hooks that inspect a value before `validated_put` stores it.

use crate::key::Key;
use crate::record::RecordLocator;

/// Error a validator fails with. Surfaced as `IndexError::Validation`.
pub type ValidationError = Box<dyn std::error::Error + Send + Sync>;

/// Decision of a [`Validator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Store this value, which may differ from the one passed in.
    Accept(RecordLocator),
    /// Leave the tree untouched.
    Ignore,
}

/// Sees the key, the value currently stored under it, and the value about
/// to be stored. `key` is `None` for the null key.
pub trait Validator {
    fn validate(
        &self,
        key: Option<&Key>,
        previous: Option<RecordLocator>,
        value: RecordLocator,
    ) -> Result<Validation, ValidationError>;
}

impl<F> Validator for F
where
    F: Fn(Option<&Key>, Option<RecordLocator>, RecordLocator) -> Result<Validation, ValidationError>,
{
    fn validate(
        &self,
        key: Option<&Key>,
        previous: Option<RecordLocator>,
        value: RecordLocator,
    ) -> Result<Validation, ValidationError> {
        self(key, previous, value)
    }
}

/// Keeps whatever is stored and only fills empty keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepExisting;

impl Validator for KeepExisting {
    fn validate(
        &self,
        _key: Option<&Key>,
        previous: Option<RecordLocator>,
        value: RecordLocator,
    ) -> Result<Validation, ValidationError> {
        Ok(match previous {
            Some(_) => Validation::Ignore,
            None => Validation::Accept(value),
        })
    }
}

/// Rejects writes that would replace a different stored value.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueValue;

impl Validator for UniqueValue {
    fn validate(
        &self,
        key: Option<&Key>,
        previous: Option<RecordLocator>,
        value: RecordLocator,
    ) -> Result<Validation, ValidationError> {
        match previous {
            Some(previous) if previous != value => {
                let key = key.map_or_else(|| "null".to_string(), ToString::to_string);
                Err(format!("key {key} already maps to {previous}").into())
            }
            Some(_) => Ok(Validation::Ignore),
            None => Ok(Validation::Accept(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_existing() {
        let value = RecordLocator::new(1, 2);
        assert_eq!(
            KeepExisting.validate(None, None, value).expect("validate"),
            Validation::Accept(value)
        );
        assert_eq!(
            KeepExisting
                .validate(None, Some(RecordLocator::new(1, 1)), value)
                .expect("validate"),
            Validation::Ignore
        );
    }

    #[test]
    fn test_unique_value() {
        let key = Key::int(5);
        let value = RecordLocator::new(1, 2);

        assert_eq!(
            UniqueValue.validate(Some(&key), Some(value), value).expect("validate"),
            Validation::Ignore
        );
        let error = UniqueValue
            .validate(Some(&key), Some(RecordLocator::new(1, 3)), value)
            .expect_err("conflicting value");
        assert!(error.to_string().contains("key 5"));
    }

    #[test]
    fn test_closure_validator() {
        let shift = |_key: Option<&Key>,
                     _previous: Option<RecordLocator>,
                     value: RecordLocator|
         -> Result<Validation, ValidationError> {
            Ok(Validation::Accept(RecordLocator::new(
                value.partition,
                value.position + 100,
            )))
        };
        assert_eq!(
            shift
                .validate(None, None, RecordLocator::new(2, 1))
                .expect("validate"),
            Validation::Accept(RecordLocator::new(2, 101))
        );
    }
}
