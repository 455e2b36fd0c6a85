//! Handler type compatibility.
//!
//! A handler declares the type parameters of the context it wants to see
//! (its [`Signature`]); the call carries the actual ones. The resolver
//! decides, per parameter, whether the declared type can be read from the
//! actual one and how to convert values on the way in.
//!
//! - `Dynamic` accepts anything and receives the erased value.
//! - An identical type is used as is.
//! - A type registered with [`TypeResolver::relate`] as the base of the
//!   actual type is read through the registered conversion.
//!
//! Everything else is a mismatch. Whether a mismatch aborts the stage or
//! skips the handler is the caller's choice.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::value::{Dynamic, TypeTag};

/// Converts an erased value of the actual type into the declared type.
pub type Converter = Arc<dyn Fn(&Dynamic) -> Option<Dynamic> + Send + Sync>;

/// Type parameters of a stage context, in declaration order.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    params: Vec<TypeTag>,
}

impl Signature {
    /// Create a signature.
    pub fn new(params: impl Into<Vec<TypeTag>>) -> Self {
        Self {
            params: params.into(),
        }
    }

    /// Signature without parameters.
    pub fn empty() -> Self {
        Self { params: Vec::new() }
    }

    /// Parameters.
    pub fn params(&self) -> &[TypeTag] {
        &self.params
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<")?;
        for (index, param) in self.params.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            f.write_str(param.name())?;
        }
        f.write_str(">")
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// How one parameter is read from the actual value.
#[derive(Clone)]
pub enum Narrow {
    /// Declared type equals the actual type.
    Identity,
    /// Declared type is `Dynamic`.
    Widen,
    /// Declared type is a registered base of the actual type.
    Convert {
        /// Declared type.
        target: TypeTag,
        /// Conversion from the actual type.
        converter: Converter,
    },
}

impl Narrow {
    /// Produce the erased value a handler of the declared type should see.
    pub fn apply(&self, value: &Dynamic) -> Option<Dynamic> {
        match self {
            Narrow::Identity | Narrow::Widen => Some(value.clone()),
            Narrow::Convert { target, converter } => {
                if value.tag() == *target {
                    Some(value.clone())
                } else {
                    converter(value)
                }
            }
        }
    }
}

impl fmt::Debug for Narrow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Narrow::Identity => f.write_str("Identity"),
            Narrow::Widen => f.write_str("Widen"),
            Narrow::Convert { target, .. } => write!(f, "Convert({target})"),
        }
    }
}

/// Per-parameter narrowing for one handler.
#[derive(Debug, Clone, Default)]
pub struct Narrowing {
    params: Vec<Narrow>,
}

impl Narrowing {
    /// Narrowing of parameter `index`; parameters beyond the signature are
    /// read as is.
    pub fn param(&self, index: usize) -> Narrow {
        self.params.get(index).cloned().unwrap_or(Narrow::Identity)
    }
}

/// Whether the previous context instance can be handed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chaining {
    /// Same declared signature as the previous handler.
    Reuse,
    /// Build a new context carrying forward the previous mutations.
    Construct,
}

/// Outcome of resolving one handler against one call.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The handler can run.
    Compatible {
        /// How to read each parameter.
        narrowing: Narrowing,
        /// Whether to reuse the previous context.
        chaining: Chaining,
    },
    /// Incompatible, and mismatches are suppressed.
    Skip {
        /// Handler's declared signature.
        declared: Signature,
        /// Call's actual signature.
        actual: Signature,
    },
    /// Incompatible.
    Mismatch {
        /// Handler's declared signature.
        declared: Signature,
        /// Call's actual signature.
        actual: Signature,
    },
}

/// Decides whether handlers fit a call and how their contexts are built.
#[derive(Clone, Default)]
pub struct TypeResolver {
    relations: HashMap<(TypeId, TypeId), Converter>,
}

impl TypeResolver {
    /// Create a resolver with no relations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `B` a base of `D`: handlers declared over `B` run for calls
    /// carrying `D` and read the value converted with `B::from`.
    pub fn relate<D, B>(&mut self) -> &mut Self
    where
        D: Clone + Send + Sync + 'static,
        B: From<D> + Send + Sync + 'static,
    {
        let converter: Converter = Arc::new(|value: &Dynamic| {
            value
                .downcast_ref::<D>()
                .map(|derived| Dynamic::new(B::from(derived.clone())))
        });
        self.relations
            .insert((TypeId::of::<D>(), TypeId::of::<B>()), converter);
        self
    }

    /// Whether a handler declared over `declared` can read `actual`.
    pub fn is_assignable(&self, declared: TypeTag, actual: TypeTag) -> bool {
        self.narrow(declared, actual).is_some()
    }

    fn narrow(&self, declared: TypeTag, actual: TypeTag) -> Option<Narrow> {
        if declared.is_dynamic() {
            return Some(Narrow::Widen);
        }
        if declared == actual {
            return Some(Narrow::Identity);
        }
        self.relations
            .get(&(actual.id(), declared.id()))
            .map(|converter| Narrow::Convert {
                target: declared,
                converter: Arc::clone(converter),
            })
    }

    /// Resolve a handler's declared signature against the call's actual
    /// one. `previous` is the signature of the context currently threaded
    /// through the stage, if any.
    pub fn resolve(
        &self,
        declared: &Signature,
        actual: &Signature,
        previous: Option<&Signature>,
        suppress_mismatch: bool,
    ) -> Resolution {
        let incompatible = || {
            if suppress_mismatch {
                Resolution::Skip {
                    declared: declared.clone(),
                    actual: actual.clone(),
                }
            } else {
                Resolution::Mismatch {
                    declared: declared.clone(),
                    actual: actual.clone(),
                }
            }
        };

        if declared.len() != actual.len() {
            return incompatible();
        }

        let mut params = Vec::with_capacity(declared.len());
        for (declared_param, actual_param) in declared.params().iter().zip(actual.params()) {
            match self.narrow(*declared_param, *actual_param) {
                Some(narrow) => params.push(narrow),
                None => return incompatible(),
            }
        }

        let chaining = if previous == Some(declared) {
            Chaining::Reuse
        } else {
            Chaining::Construct
        };

        Resolution::Compatible {
            narrowing: Narrowing { params },
            chaining,
        }
    }
}

impl fmt::Debug for TypeResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeResolver")
            .field("relations", &self.relations.len())
            .finish()
    }
}
