use std::any::{Any, TypeId};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::search::holder::HmacEntry;
use crate::search::strategy::HmacStrategyKind;
use crate::search::tokenizer::TokenizerKind;

/// Reads a field's plaintext off an entity. `None` stands for null.
pub type Accessor<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;

/// Writes a field's plaintext back onto an entity.
pub type Mutator<T> = Arc<dyn Fn(&mut T, Option<String>) + Send + Sync>;

/// Walks every child value of a cascade field, handing each to the visitor.
/// A collection-valued field calls the visitor once per element.
pub type CascadeWalk<T> =
    Arc<dyn Fn(&mut T, &mut dyn FnMut(&mut dyn Any) -> Result<()>) -> Result<()> + Send + Sync>;

/// How a registered field participates in protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    /// Value travels inside the entity's encrypted blob.
    Encrypt,
    /// Value is hashed for lookup and/or uniqueness.
    Hmac,
    /// Value is another registered entity (or a collection of them) that is
    /// protected recursively.
    Cascade,
    /// String field recording the id of the key that encrypted the blob.
    KeyId,
    /// The ciphertext blob itself.
    Blob,
}

/// What an HMAC field's hashes are used for.
#[derive(Clone, Debug)]
pub enum HmacPurpose {
    /// Equality search over the plaintext; tokenizers fan out extra
    /// searchable variants.
    Lookup { tokenizers: Vec<TokenizerKind> },
    /// Uniqueness enforcement. An optional field that is null simply
    /// produces no hash.
    Unique { optional: bool },
}

/// Membership of a field in a named compound-uniqueness group.
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub group: String,
    /// 1-based position inside the group; orders must form exactly 1..N.
    pub order: u32,
    /// A null optional member skips the whole compound hash.
    pub optional: bool,
}

/// Permission to keep an encrypted field's plaintext column alive while a
/// data migration is in flight.
#[derive(Debug, Clone)]
pub struct MigrationWaiver {
    pub justification: String,
    pub complete_by: DateTime<Utc>,
}

/// One field of an entity, declared for registration.
///
/// Constructors fix the role; builder methods add purposes, group
/// membership, and persistence waivers. All rule checking happens at
/// registration, not here.
pub struct FieldDescriptor<T> {
    pub(crate) name: String,
    pub(crate) role: FieldRole,
    pub(crate) get: Option<Accessor<T>>,
    pub(crate) set: Option<Mutator<T>>,
    /// False once the caller declares the backing column still exists.
    pub(crate) transient: bool,
    pub(crate) waiver: Option<MigrationWaiver>,
    pub(crate) purposes: Vec<HmacPurpose>,
    pub(crate) group: Option<GroupMember>,
    pub(crate) cascade_target: Option<(TypeId, String)>,
    pub(crate) walk: Option<CascadeWalk<T>>,
}

impl<T: 'static> FieldDescriptor<T> {
    fn bare(name: impl Into<String>, role: FieldRole) -> Self {
        Self {
            name: name.into(),
            role,
            get: None,
            set: None,
            transient: true,
            waiver: None,
            purposes: Vec::new(),
            group: None,
            cascade_target: None,
            walk: None,
        }
    }

    /// A field whose plaintext is carried only inside the encrypted blob.
    pub fn encrypted(
        name: impl Into<String>,
        get: impl Fn(&T) -> Option<String> + Send + Sync + 'static,
        set: impl Fn(&mut T, Option<String>) + Send + Sync + 'static,
    ) -> Self {
        let mut field = Self::bare(name, FieldRole::Encrypt);
        field.get = Some(Arc::new(get));
        field.set = Some(Arc::new(set));
        field
    }

    /// A field hashed for search or uniqueness. Add at least one purpose or
    /// group membership before registering.
    pub fn hmac(
        name: impl Into<String>,
        get: impl Fn(&T) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        let mut field = Self::bare(name, FieldRole::Hmac);
        field.get = Some(Arc::new(get));
        field
    }

    /// The entity's ciphertext blob field.
    pub fn blob(
        name: impl Into<String>,
        get: impl Fn(&T) -> Option<String> + Send + Sync + 'static,
        set: impl Fn(&mut T, Option<String>) + Send + Sync + 'static,
    ) -> Self {
        let mut field = Self::bare(name, FieldRole::Blob);
        field.get = Some(Arc::new(get));
        field.set = Some(Arc::new(set));
        field
    }

    /// The string field recording which key encrypted the blob.
    pub fn key_id(
        name: impl Into<String>,
        get: impl Fn(&T) -> Option<String> + Send + Sync + 'static,
        set: impl Fn(&mut T, Option<String>) + Send + Sync + 'static,
    ) -> Self {
        let mut field = Self::bare(name, FieldRole::KeyId);
        field.get = Some(Arc::new(get));
        field.set = Some(Arc::new(set));
        field
    }

    /// A field holding child entities of type `C`, protected recursively.
    /// `C` must be registered before this entity.
    pub fn cascade<C: 'static>(
        name: impl Into<String>,
        walk: impl Fn(&mut T, &mut dyn FnMut(&mut dyn Any) -> Result<()>) -> Result<()>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let mut field = Self::bare(name, FieldRole::Cascade);
        field.cascade_target = Some((TypeId::of::<C>(), short_type_name::<C>().to_string()));
        field.walk = Some(Arc::new(walk));
        field
    }

    /// Declare that the field's backing column still exists. Registration
    /// then requires a migration waiver.
    pub fn persisted(mut self) -> Self {
        self.transient = false;
        self
    }

    pub fn migration_waiver(
        mut self,
        justification: impl Into<String>,
        complete_by: DateTime<Utc>,
    ) -> Self {
        self.waiver = Some(MigrationWaiver {
            justification: justification.into(),
            complete_by,
        });
        self
    }

    pub fn lookup(mut self, tokenizers: Vec<TokenizerKind>) -> Self {
        self.purposes.push(HmacPurpose::Lookup { tokenizers });
        self
    }

    pub fn unique(mut self) -> Self {
        self.purposes.push(HmacPurpose::Unique { optional: false });
        self
    }

    pub fn unique_optional(mut self) -> Self {
        self.purposes.push(HmacPurpose::Unique { optional: true });
        self
    }

    pub fn in_group(mut self, group: impl Into<String>, order: u32) -> Self {
        self.group = Some(GroupMember {
            group: group.into(),
            order,
            optional: false,
        });
        self
    }

    pub fn in_group_optional(mut self, group: impl Into<String>, order: u32) -> Self {
        self.group = Some(GroupMember {
            group: group.into(),
            order,
            optional: true,
        });
        self
    }
}

/// Accessor pair for the entity's persisted lookup or unique hash list.
pub struct HashListBinding<T> {
    pub(crate) get: Arc<dyn Fn(&T) -> Vec<HmacEntry> + Send + Sync>,
    pub(crate) set: Arc<dyn Fn(&mut T, Vec<HmacEntry>) + Send + Sync>,
}

impl<T> Clone for HashListBinding<T> {
    fn clone(&self) -> Self {
        Self {
            get: Arc::clone(&self.get),
            set: Arc::clone(&self.set),
        }
    }
}

/// Everything the registry needs to know about one entity type.
pub struct EntityDescriptor<T> {
    pub(crate) name: String,
    pub(crate) fields: Vec<FieldDescriptor<T>>,
    pub(crate) lookup_hashes: Option<HashListBinding<T>>,
    pub(crate) unique_hashes: Option<HashListBinding<T>>,
    pub(crate) hmac_strategy: Option<HmacStrategyKind>,
}

impl<T: 'static> EntityDescriptor<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            lookup_hashes: None,
            unique_hashes: None,
            hmac_strategy: None,
        }
    }

    pub fn field(mut self, field: FieldDescriptor<T>) -> Self {
        self.fields.push(field);
        self
    }

    /// Bind the entity's lookup-hash list. Required exactly when a field has
    /// a LOOKUP purpose.
    pub fn lookup_hashes(
        mut self,
        get: impl Fn(&T) -> Vec<HmacEntry> + Send + Sync + 'static,
        set: impl Fn(&mut T, Vec<HmacEntry>) + Send + Sync + 'static,
    ) -> Self {
        self.lookup_hashes = Some(HashListBinding {
            get: Arc::new(get),
            set: Arc::new(set),
        });
        self
    }

    /// Bind the entity's unique-hash list. Required exactly when a field has
    /// a UNIQUE purpose or a group membership.
    pub fn unique_hashes(
        mut self,
        get: impl Fn(&T) -> Vec<HmacEntry> + Send + Sync + 'static,
        set: impl Fn(&mut T, Vec<HmacEntry>) + Send + Sync + 'static,
    ) -> Self {
        self.unique_hashes = Some(HashListBinding {
            get: Arc::new(get),
            set: Arc::new(set),
        });
        self
    }

    /// Select the strategy that computes this entity's hashes. Required
    /// exactly when at least one field carries the HMAC role.
    pub fn hmac_strategy(mut self, kind: HmacStrategyKind) -> Self {
        self.hmac_strategy = Some(kind);
        self
    }
}

/// HMAC classification handed to the strategy at registration.
pub(crate) struct HmacFieldSpec<T> {
    pub(crate) name: String,
    pub(crate) get: Accessor<T>,
    pub(crate) purposes: Vec<HmacPurpose>,
    pub(crate) group: Option<GroupMember>,
}

/// Last path segment of a type name, for messages.
pub(crate) fn short_type_name<T: 'static>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
