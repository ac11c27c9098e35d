//! Dynamically typed values exchanged between user tasks and submitters.

use std::any::Any;

use thiserror::Error;

/// Error returned when extracting an [`AnyValue`] with the wrong type witness.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("stored value is of type `{stored}`, not of the requested type")]
pub struct TypeMismatch {
    /// Type name recorded when the value was stored.
    pub stored: &'static str,
}

/// An opaque container carrying a value of a type chosen by the producing
/// task. The submitter extracts it with a type witness via
/// [`AnyValue::downcast`]; a witness that does not match the stored type
/// fails with [`TypeMismatch`].
///
/// The container is move-only: extraction consumes it.
pub struct AnyValue {
    value: Option<Box<dyn Any + Send>>,
    stored: &'static str,
}

impl AnyValue {
    /// Wraps `value`, recording its type name for diagnostics.
    pub fn new<T: Send + 'static>(value: T) -> Self {
        AnyValue {
            value: Some(Box::new(value)),
            stored: std::any::type_name::<T>(),
        }
    }

    /// An empty value, produced for rejected submissions.
    pub fn empty() -> Self {
        AnyValue {
            value: None,
            stored: "()",
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Consumes the container and returns the stored value, provided the
    /// witness `T` matches the type it was stored with.
    pub fn downcast<T: 'static>(self) -> Result<T, TypeMismatch> {
        let stored = self.stored;

        self.value
            .ok_or(TypeMismatch { stored })?
            .downcast::<T>()
            .map(|boxed| *boxed)
            .or(Err(TypeMismatch { stored }))
    }
}

impl Default for AnyValue {
    fn default() -> Self {
        AnyValue::empty()
    }
}

impl std::fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyValue").field("stored", &self.stored).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::AnyValue;

    #[test]
    fn downcast_with_matching_witness() {
        let value = AnyValue::new(42u64);

        assert_eq!(value.downcast::<u64>().unwrap(), 42);
    }

    #[test]
    fn downcast_with_wrong_witness() {
        let value = AnyValue::new(42u64);

        let err = value.downcast::<String>().unwrap_err();
        assert_eq!(err.stored, "u64");
    }

    #[test]
    fn empty_value_fails_every_witness() {
        assert!(AnyValue::empty().is_empty());
        assert!(AnyValue::empty().downcast::<u64>().is_err());
    }

    #[test]
    fn owned_values_round_trip() {
        let value = AnyValue::new("moved".to_string());

        assert_eq!(value.downcast::<String>().unwrap(), "moved");
    }
}
