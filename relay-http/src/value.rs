//! Type tags and type-erased values.
//!
//! Every value that crosses a stage boundary is stored as a [`Dynamic`]
//! together with the [`TypeTag`] of the concrete type it was created from.
//! Handlers see statically typed views; the pipeline only ever compares
//! tags.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Marker bound for values that can flow through the pipeline.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

/// Runtime identity of a payload type.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    /// Tag for `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Tag of the top type, [`Dynamic`].
    pub fn dynamic() -> Self {
        Self::of::<Dynamic>()
    }

    /// Whether this is the top type.
    pub fn is_dynamic(&self) -> bool {
        self.id == TypeId::of::<Dynamic>()
    }

    /// Underlying type id.
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl Hash for TypeTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A shared, type-erased value.
///
/// `Dynamic` is also the top type of the pipeline: a handler declared over
/// `Dynamic` is compatible with every call and receives the erased value.
#[derive(Clone)]
pub struct Dynamic {
    value: Arc<dyn Any + Send + Sync>,
    tag: TypeTag,
}

impl Dynamic {
    /// Erase a value. Wrapping a `Dynamic` returns it unchanged.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        let boxed: Box<dyn Any + Send + Sync> = Box::new(value);
        match boxed.downcast::<Dynamic>() {
            Ok(inner) => *inner,
            Err(boxed) => Self {
                value: Arc::from(boxed),
                tag: TypeTag::of::<T>(),
            },
        }
    }

    /// Tag of the concrete value.
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// Name of the concrete type.
    pub fn type_name(&self) -> &'static str {
        self.tag.name()
    }

    /// Whether the concrete value is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Borrow the concrete value.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Clone the concrete value out. Asking for `Dynamic` returns a clone
    /// of the erased value itself.
    pub fn downcast<T: Any + Clone>(&self) -> Option<T> {
        if TypeId::of::<T>() == TypeId::of::<Dynamic>() {
            let erased: Box<dyn Any> = Box::new(self.clone());
            return erased.downcast::<T>().ok().map(|value| *value);
        }
        self.value.downcast_ref::<T>().cloned()
    }
}

impl fmt::Debug for Dynamic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dynamic({})", self.tag.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_roundtrips_concrete_value() {
        let value = Dynamic::new(42u32);
        assert!(value.is::<u32>());
        assert_eq!(value.tag(), TypeTag::of::<u32>());
        assert_eq!(value.downcast::<u32>(), Some(42));
        assert_eq!(value.downcast::<u64>(), None);
    }

    #[test]
    fn test_dynamic_does_not_nest() {
        let inner = Dynamic::new("hello".to_string());
        let outer = Dynamic::new(inner);
        assert_eq!(outer.tag(), TypeTag::of::<String>());
        assert_eq!(outer.downcast_ref::<String>().map(String::as_str), Some("hello"));
    }

    #[test]
    fn test_downcast_to_dynamic_returns_erased_clone() {
        let value = Dynamic::new(7i64);
        let same = value.downcast::<Dynamic>().unwrap();
        assert_eq!(same.tag(), TypeTag::of::<i64>());
        assert_eq!(same.downcast::<i64>(), Some(7));
    }

    #[test]
    fn test_type_tag_identity() {
        assert!(TypeTag::dynamic().is_dynamic());
        assert!(!TypeTag::of::<String>().is_dynamic());
        assert_ne!(TypeTag::of::<String>(), TypeTag::of::<&'static str>());
    }
}
