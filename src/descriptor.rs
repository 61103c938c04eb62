//! Service descriptors and the stable 128-bit identifiers derived from them.
//!
//! An identifier is the wire-level handle peers exchange to announce a
//! service. It is derived once from the service type and attributes, or set
//! explicitly before first use, and never changes afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;

use indexmap::IndexMap;
use tracing::debug;
use uuid::Uuid;

use crate::{Error, Result};

/// Domain separator mixed into every derived identifier.
const IDENTIFIER_DOMAIN: &[u8] = b"proximity-discovery/service/v1";

/// 128-bit service identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(Uuid);

impl ServiceId {
    /// Build an identifier from its big-endian bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse raw bytes as delivered by a discovery provider.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::InvalidIdentifier { len: bytes.len() })?;
        Ok(Self::from_bytes(bytes))
    }

    /// The identifier as a UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The identifier's big-endian bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// The identifier with its 16 bytes in reverse order.
    ///
    /// Some radio stacks hand out identifiers little-endian.
    pub fn reversed(&self) -> Self {
        let mut bytes = *self.as_bytes();
        bytes.reverse();
        Self::from_bytes(bytes)
    }
}

impl From<Uuid> for ServiceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for ServiceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceId({})", self.0.hyphenated())
    }
}

/// Description of a service: a name, a service type namespace and attributes.
///
/// Equality and hashing use only [`identifier()`](Self::identifier).
/// Reading the identifier fixes it; attribute changes made afterwards are
/// ignored.
#[derive(Clone)]
pub struct ServiceDescriptor {
    name: String,
    service_type: String,
    attributes: IndexMap<String, String>,
    identifier: OnceLock<ServiceId>,
}

impl ServiceDescriptor {
    /// Create a descriptor without attributes.
    pub fn new(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            attributes: IndexMap::new(),
            identifier: OnceLock::new(),
        }
    }

    /// Create a descriptor from a set of attributes.
    pub fn with_attributes<I, K, V>(
        name: impl Into<String>,
        service_type: impl Into<String>,
        attributes: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut descriptor = Self::new(name, service_type);
        for (key, value) in attributes {
            descriptor.attributes.insert(key.into(), value.into());
        }
        descriptor
    }

    /// Placeholder descriptor for an announced identifier nobody registered.
    pub fn from_identifier(identifier: ServiceId) -> Self {
        let descriptor = Self::new("", "");
        let _ = descriptor.identifier.set(identifier);
        descriptor
    }

    /// Builder form of [`add_attribute`](Self::add_attribute).
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_attribute(key, value);
        self
    }

    /// Add or replace an attribute.
    ///
    /// Returns `false` and leaves the descriptor untouched once the
    /// identifier has been fixed.
    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        if let Some(identifier) = self.identifier.get() {
            debug!(%identifier, "Identifier fixed; attribute ignored");
            return false;
        }
        self.attributes.insert(key.into(), value.into());
        true
    }

    /// Set the identifier explicitly instead of deriving it.
    ///
    /// Fails with [`Error::IdentityAlreadyFixed`] once the identifier was read
    /// or overridden.
    pub fn override_identifier(&self, identifier: ServiceId) -> Result<()> {
        self.identifier
            .set(identifier)
            .map_err(|_| Error::IdentityAlreadyFixed {
                identifier: self.identifier(),
            })
    }

    /// The stable identifier, derived on first call.
    pub fn identifier(&self) -> ServiceId {
        *self
            .identifier
            .get_or_init(|| derive_identifier(&self.service_type, &self.attributes))
    }

    /// Byte-reversed form of [`identifier()`](Self::identifier).
    pub fn reversed_identifier(&self) -> ServiceId {
        self.identifier().reversed()
    }

    /// Whether the identifier has been read or overridden.
    pub fn is_identifier_fixed(&self) -> bool {
        self.identifier.get().is_some()
    }

    /// Whether `identifier` names this service, optionally in reversed byte order.
    pub fn matches(&self, identifier: ServiceId, check_reversed: bool) -> bool {
        let own = self.identifier();
        own == identifier || (check_reversed && own.reversed() == identifier)
    }

    /// Human-readable service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service type namespace.
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Attributes in insertion order.
    pub fn attributes(&self) -> &IndexMap<String, String> {
        &self.attributes
    }
}

/// Hash the service type and the attributes sorted by key.
///
/// Every field is length-prefixed so that moving bytes between a key and its
/// value changes the result.
fn derive_identifier(service_type: &str, attributes: &IndexMap<String, String>) -> ServiceId {
    let sorted: BTreeMap<&str, &str> = attributes
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let mut hasher = blake3::Hasher::new();
    hasher.update(IDENTIFIER_DOMAIN);
    update_field(&mut hasher, service_type);
    for (key, value) in sorted {
        update_field(&mut hasher, key);
        update_field(&mut hasher, value);
    }

    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest.as_bytes()[..16]);
    ServiceId::from_bytes(bytes)
}

fn update_field(hasher: &mut blake3::Hasher, field: &str) {
    hasher.update(&(field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

impl PartialEq for ServiceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.identifier() == other.identifier()
    }
}

impl Eq for ServiceDescriptor {}

impl Hash for ServiceDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier().hash(state);
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("service_type", &self.service_type)
            .field("attributes", &self.attributes)
            .field("identifier", &self.identifier.get())
            .finish()
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identifier.get() {
            Some(id) => write!(f, "{} ({id})", self.name),
            None => write!(f, "{} (unfixed)", self.name),
        }
    }
}
