//! Derivation of qualified lookup keys from call identity.
//!
//! A call is identified by up to three names: microservice, schema and
//! operation. [`KeyResolver`] turns them into a [`CandidateKeys`] sequence,
//! most specific first, always ending with the global key. Which candidate
//! actually governs the call is decided by the registry, based on which keys
//! have a configured limit.

use std::{fmt, sync::Arc};

use crate::FlowDirection;

/// Call-context attribute carrying the name of the calling microservice.
pub const SOURCE_MICROSERVICE_ATTRIBUTE: &str = "x-src-microservice";

/// Canonical form of the global key.
///
/// `@` never appears in microservice names, so this cannot collide with a
/// scoped key.
pub const GLOBAL_KEY: &str = "@global";

/// Specificity level of a [`QualifiedKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyScope {
    /// Process-wide catch-all.
    Global,
    /// `microservice`
    Microservice,
    /// `microservice.schema`
    Schema,
    /// `microservice.schema.operation`
    Operation,
}

/// A rate limit lookup key.
///
/// Equality and hashing go through the canonical string only, which is also
/// the form used as registry key and in configuration property names.
///
/// Names are joined with `.` unescaped, so keys of different scopes can share
/// a canonical form when a name contains dots: `microservice("a.b")` equals
/// `schema("a", "b")`, and both map to the same registry slot and property.
#[derive(Debug, Clone)]
pub struct QualifiedKey {
    scope: KeyScope,
    canonical: Arc<str>,
}

impl QualifiedKey {
    /// The global key.
    pub fn global() -> Self {
        Self {
            scope: KeyScope::Global,
            canonical: Arc::from(GLOBAL_KEY),
        }
    }

    /// Key for every call of `microservice`.
    pub fn microservice(microservice: &str) -> Self {
        Self {
            scope: KeyScope::Microservice,
            canonical: Arc::from(microservice),
        }
    }

    /// Key for every call of one schema of `microservice`.
    pub fn schema(microservice: &str, schema: &str) -> Self {
        Self {
            scope: KeyScope::Schema,
            canonical: Arc::from(format!("{microservice}.{schema}")),
        }
    }

    /// Key for a single operation.
    pub fn operation(microservice: &str, schema: &str, operation: &str) -> Self {
        Self {
            scope: KeyScope::Operation,
            canonical: Arc::from(format!("{microservice}.{schema}.{operation}")),
        }
    }

    /// Specificity level of this key.
    pub fn scope(&self) -> KeyScope {
        self.scope
    }

    /// Canonical string form.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The next less specific key, or `None` for the global key.
    ///
    /// Schema and operation names are taken from the right. The parent follows
    /// this key's own scope, so two colliding keys (see above) can still walk
    /// different fallback chains.
    pub fn parent(&self) -> Option<QualifiedKey> {
        let strip_last = |canonical: &str| -> Arc<str> {
            match canonical.rsplit_once('.') {
                Some((head, _)) => Arc::from(head),
                None => Arc::from(canonical),
            }
        };

        match self.scope {
            KeyScope::Global => None,
            KeyScope::Microservice => Some(QualifiedKey::global()),
            KeyScope::Schema => Some(QualifiedKey {
                scope: KeyScope::Microservice,
                canonical: strip_last(&self.canonical),
            }),
            KeyScope::Operation => Some(QualifiedKey {
                scope: KeyScope::Schema,
                canonical: strip_last(&self.canonical),
            }),
        }
    }

    /// This key followed by every less specific key, ending with the global key.
    pub fn fallback_chain(&self) -> CandidateKeys {
        let mut keys = vec![self.clone()];
        while let Some(parent) = keys.last().and_then(QualifiedKey::parent) {
            keys.push(parent);
        }

        CandidateKeys(keys)
    }
}

impl PartialEq for QualifiedKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for QualifiedKey {}

impl std::hash::Hash for QualifiedKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for QualifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Candidate keys for one call, most specific first.
///
/// Never empty: the last entry is always [`QualifiedKey::global`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateKeys(Vec<QualifiedKey>);

impl CandidateKeys {
    /// Only the global key.
    pub fn global_only() -> Self {
        Self(vec![QualifiedKey::global()])
    }

    /// Iterate from most to least specific.
    pub fn iter(&self) -> impl Iterator<Item = &QualifiedKey> {
        self.0.iter()
    }

    /// The most specific candidate.
    pub fn most_specific(&self) -> &QualifiedKey {
        &self.0[0]
    }

    /// The final fallback (always the global key).
    pub fn global(&self) -> &QualifiedKey {
        &self.0[self.0.len() - 1]
    }

    /// Number of candidates, including the global key.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Fully-qualified identity of the operation being invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationIdentity {
    /// Microservice that owns the operation.
    pub microservice: String,
    /// Schema (interface) the operation belongs to.
    pub schema: String,
    /// Operation name.
    pub operation: String,
}

impl OperationIdentity {
    /// Build an identity from its three names.
    pub fn new(
        microservice: impl Into<String>,
        schema: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            microservice: microservice.into(),
            schema: schema.into(),
            operation: operation.into(),
        }
    }
}

/// Read-only view of a call, as exposed by the pipeline framework.
pub trait CallContext {
    /// Look up a context attribute such as [`SOURCE_MICROSERVICE_ATTRIBUTE`].
    fn attribute(&self, name: &str) -> Option<&str>;

    /// Identity of the invoked operation, if known.
    fn operation(&self) -> Option<&OperationIdentity>;
}

/// Builds [`CandidateKeys`] for calls seen from one [`FlowDirection`].
///
/// Resolution never fails: missing identity data degrades to a less specific
/// key, down to the global key.
#[derive(Debug, Clone, Copy)]
pub struct KeyResolver {
    direction: FlowDirection,
}

impl KeyResolver {
    /// Create a resolver for `direction`.
    pub fn new(direction: FlowDirection) -> Self {
        Self { direction }
    }

    /// Direction this resolver builds keys for.
    pub fn direction(&self) -> FlowDirection {
        self.direction
    }

    /// Candidate keys for `call`, most specific first.
    ///
    /// On the provider side the microservice component is the caller, read
    /// from [`SOURCE_MICROSERVICE_ATTRIBUTE`]. On the consumer side it is the
    /// target microservice of the operation.
    pub fn resolve<C: CallContext + ?Sized>(&self, call: &C) -> CandidateKeys {
        let operation = call.operation();

        let microservice = match self.direction {
            FlowDirection::Provider => call.attribute(SOURCE_MICROSERVICE_ATTRIBUTE),
            FlowDirection::Consumer => operation.map(|op| op.microservice.as_str()),
        };

        Self::candidates(
            microservice,
            operation.map(|op| op.schema.as_str()),
            operation.map(|op| op.operation.as_str()),
        )
    }

    /// Candidate keys from raw identity components.
    ///
    /// Empty strings count as absent. A schema without a microservice, or an
    /// operation without a schema, is ignored.
    pub fn candidates(
        microservice: Option<&str>,
        schema: Option<&str>,
        operation: Option<&str>,
    ) -> CandidateKeys {
        fn present(name: Option<&str>) -> Option<&str> {
            name.map(str::trim).filter(|name| !name.is_empty())
        }

        let Some(microservice) = present(microservice) else {
            return CandidateKeys::global_only();
        };

        let most_specific = match (present(schema), present(operation)) {
            (Some(schema), Some(operation)) => {
                QualifiedKey::operation(microservice, schema, operation)
            }
            (Some(schema), None) => QualifiedKey::schema(microservice, schema),
            (None, _) => QualifiedKey::microservice(microservice),
        };

        most_specific.fallback_chain()
    }
}
