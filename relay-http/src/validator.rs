//! Response validation.

use std::fmt;
use std::sync::Arc;

use crate::response::Response;

/// Predicate classifying a response as successful.
pub type ResponseValidator = Arc<dyn Fn(&Response) -> bool + Send + Sync>;

/// Ordered list of response validators. The first one returning `false`
/// fails the response; an empty list accepts everything.
#[derive(Clone)]
pub struct Validators {
    validators: Vec<ResponseValidator>,
}

impl Validators {
    /// Empty list: every response is successful.
    pub fn new() -> Self {
        Self {
            validators: Vec::new(),
        }
    }

    /// The default list: the status must be 2xx.
    pub fn success_status() -> Self {
        let mut validators = Self::new();
        validators.push(|response: &Response| response.is_success());
        validators
    }

    /// Append a validator.
    pub fn push<F>(&mut self, validator: F)
    where
        F: Fn(&Response) -> bool + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(validator));
    }

    /// Remove every validator.
    pub fn clear(&mut self) {
        self.validators.clear();
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Whether `response` passes every validator.
    pub fn validate(&self, response: &Response) -> bool {
        self.validators.iter().all(|validator| validator(response))
    }
}

impl Default for Validators {
    fn default() -> Self {
        Self::success_status()
    }
}

impl fmt::Debug for Validators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validators")
            .field("len", &self.validators.len())
            .finish()
    }
}
