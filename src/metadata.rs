use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::value::{EdmType, Value};

/// Referential action applied when the principal of a navigation is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnDelete {
    #[default]
    None,
    Cascade,
    SetNull,
}

/// One declared structural property of an entity or complex type.
#[derive(Debug, Clone)]
pub struct PropertyMetadata {
    pub name: String,
    pub column: String,
    pub ty: EdmType,
    pub nullable: bool,
    pub key: bool,
    pub etag: bool,
    pub computed: bool,
    pub immutable: bool,
    pub stream: bool,
    pub max_length: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub default_value: Option<Value>,
    /// Declared media type for stream properties.
    pub media_type: Option<String>,
    pub(crate) skip: bool,
}

impl PropertyMetadata {
    pub fn new(name: impl Into<String>, ty: EdmType) -> Self {
        let name = name.into();
        PropertyMetadata {
            column: name.clone(),
            name,
            ty,
            nullable: true,
            key: false,
            etag: false,
            computed: false,
            immutable: false,
            stream: false,
            max_length: None,
            precision: None,
            scale: None,
            default_value: None,
            media_type: None,
            skip: false,
        }
    }

    /// Apply a comma-separated marker string, e.g. `"key,computed"` or
    /// `"maxlength=50,column=product_name"`. Unknown markers are errors.
    pub fn markers(mut self, spec: &str) -> Result<Self> {
        for raw in spec.split(',') {
            let marker = raw.trim();
            if marker.is_empty() {
                continue;
            }
            let (name, arg) = match marker.split_once('=') {
                Some((n, a)) => (n.trim(), Some(a.trim())),
                None => (marker, None),
            };
            match (name, arg) {
                ("key", None) => {
                    self.key = true;
                    self.nullable = false;
                }
                ("etag", None) => self.etag = true,
                ("computed", None) => self.computed = true,
                ("immutable", None) => self.immutable = true,
                ("required", None) => self.nullable = false,
                ("nullable", None) => self.nullable = true,
                ("stream", None) => {
                    self.stream = true;
                    self.ty = EdmType::Stream;
                }
                ("-", None) => self.skip = true,
                ("precision", Some(v)) => {
                    self.precision = Some(parse_marker_num(marker, v)?);
                }
                ("scale", Some(v)) => {
                    self.scale = Some(parse_marker_num(marker, v)?);
                }
                ("maxlength", Some(v)) => {
                    self.max_length = Some(parse_marker_num(marker, v)?);
                }
                ("column", Some(v)) if !v.is_empty() => self.column = v.to_string(),
                _ => {
                    return Err(Error::validation(format!(
                        "unrecognized property marker: {marker}"
                    )));
                }
            }
        }
        Ok(self)
    }

    pub fn key(mut self) -> Self {
        self.key = true;
        self.nullable = false;
        self
    }

    pub fn etag(mut self) -> Self {
        self.etag = true;
        self
    }

    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn stream(mut self, media_type: impl Into<String>) -> Self {
        self.stream = true;
        self.ty = EdmType::Stream;
        self.media_type = Some(media_type.into());
        self
    }

    pub fn max_length(mut self, n: u32) -> Self {
        self.max_length = Some(n);
        self
    }

    pub fn default_value(mut self, v: Value) -> Self {
        self.default_value = Some(v);
        self
    }

    fn is_scalar(&self) -> bool {
        !matches!(
            self.ty,
            EdmType::Collection(_) | EdmType::Complex(_) | EdmType::Stream
        )
    }
}

fn parse_marker_num<T: std::str::FromStr>(marker: &str, v: &str) -> Result<T> {
    v.parse()
        .map_err(|_| Error::validation(format!("invalid marker value: {marker}")))
}

/// A typed link to another entity set, single (0..1) or collection.
#[derive(Debug, Clone)]
pub struct NavigationMetadata {
    pub name: String,
    pub collection: bool,
    /// Target entity set name; resolved by name at seal, never by reference.
    pub target: String,
    /// Ordered (local property, target property) pairs.
    pub foreign_keys: Vec<(String, String)>,
    pub on_delete: OnDelete,
}

impl NavigationMetadata {
    pub fn single(name: impl Into<String>, target: impl Into<String>) -> Self {
        NavigationMetadata {
            name: name.into(),
            collection: false,
            target: target.into(),
            foreign_keys: Vec::new(),
            on_delete: OnDelete::None,
        }
    }

    pub fn collection(name: impl Into<String>, target: impl Into<String>) -> Self {
        NavigationMetadata {
            collection: true,
            ..Self::single(name, target)
        }
    }

    pub fn foreign_key(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.foreign_keys.push((from.into(), to.into()));
        self
    }

    pub fn on_delete(mut self, action: OnDelete) -> Self {
        self.on_delete = action;
        self
    }
}

/// Sealed description of one entity set or singleton.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub set_name: String,
    pub entity_name: String,
    pub table: String,
    pub namespace: String,
    pub properties: Vec<PropertyMetadata>,
    pub navigations: Vec<NavigationMetadata>,
    pub is_singleton: bool,
    /// Property whose value distinguishes subtypes for isof()/typecasts.
    pub type_discriminator: Option<String>,
    /// Allowed HTTP methods; None means all.
    pub allowed_methods: Option<Vec<String>>,
}

impl EntityMetadata {
    pub fn new(
        set_name: impl Into<String>,
        entity_name: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        EntityMetadata {
            set_name: set_name.into(),
            entity_name: entity_name.into(),
            table: table.into(),
            namespace: String::new(),
            properties: Vec::new(),
            navigations: Vec::new(),
            is_singleton: false,
            type_discriminator: None,
            allowed_methods: None,
        }
    }

    pub fn singleton(name: impl Into<String>, table: impl Into<String>) -> Self {
        let name = name.into();
        EntityMetadata {
            is_singleton: true,
            ..Self::new(name.clone(), name, table)
        }
    }

    pub fn property(mut self, prop: PropertyMetadata) -> Self {
        if !prop.skip {
            self.properties.push(prop);
        }
        self
    }

    pub fn navigation(mut self, nav: NavigationMetadata) -> Self {
        self.navigations.push(nav);
        self
    }

    pub fn discriminator(mut self, property: impl Into<String>) -> Self {
        self.type_discriminator = Some(property.into());
        self
    }

    pub fn allow_methods(mut self, methods: &[&str]) -> Self {
        self.allowed_methods = Some(methods.iter().map(|m| m.to_uppercase()).collect());
        self
    }

    /// `<Namespace>.<EntityName>`.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.namespace, self.entity_name)
    }

    pub fn keys(&self) -> Vec<&PropertyMetadata> {
        self.properties.iter().filter(|p| p.key).collect()
    }

    pub fn etag_property(&self) -> Option<&PropertyMetadata> {
        self.properties.iter().find(|p| p.etag)
    }

    pub fn find_property(&self, name: &str) -> Option<&PropertyMetadata> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn find_navigation(&self, name: &str) -> Option<&NavigationMetadata> {
        self.navigations.iter().find(|n| n.name == name)
    }

    pub fn method_allowed(&self, method: &str) -> bool {
        match &self.allowed_methods {
            Some(list) => list.iter().any(|m| m == method),
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnumMember {
    pub name: String,
    pub value: i64,
}

/// Named set of named integer members; values must fit in signed 64-bit.
#[derive(Debug, Clone)]
pub struct EnumTypeMetadata {
    pub name: String,
    pub underlying: EdmType,
    pub members: Vec<EnumMember>,
    pub is_flags: bool,
}

impl EnumTypeMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        EnumTypeMetadata {
            name: name.into(),
            underlying: EdmType::Int32,
            members: Vec::new(),
            is_flags: false,
        }
    }

    pub fn member(mut self, name: impl Into<String>, value: i64) -> Self {
        self.members.push(EnumMember {
            name: name.into(),
            value,
        });
        self
    }

    pub fn flags(mut self) -> Self {
        self.is_flags = true;
        self
    }
}

/// Structured value type without identity.
#[derive(Debug, Clone)]
pub struct ComplexTypeMetadata {
    pub name: String,
    pub properties: Vec<PropertyMetadata>,
}

impl ComplexTypeMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        ComplexTypeMetadata {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    pub fn property(mut self, prop: PropertyMetadata) -> Self {
        if !prop.skip {
            self.properties.push(prop);
        }
        self
    }
}

/// Declaration of a bound/unbound action or function, for routing and CSDL.
/// The invocation handler itself is registered on the service.
#[derive(Debug, Clone)]
pub struct OperationMetadata {
    pub name: String,
    pub is_action: bool,
    /// Entity set the operation is bound to; None for unbound.
    pub bound_to: Option<String>,
    pub parameters: Vec<(String, EdmType)>,
    pub return_type: Option<EdmType>,
}

/// The sealed, process-wide metadata registry. Entity sets live in a flat
/// name-keyed table; cross-references (navigation targets) are resolved by
/// name at seal so cyclic graphs need no special handling.
#[derive(Debug, Clone)]
pub struct EntityModel {
    pub namespace: String,
    pub container: String,
    sets: BTreeMap<String, EntityMetadata>,
    pub enums: BTreeMap<String, EnumTypeMetadata>,
    pub complex_types: BTreeMap<String, ComplexTypeMetadata>,
    pub operations: Vec<OperationMetadata>,
}

impl EntityModel {
    pub fn new(namespace: impl Into<String>, container: impl Into<String>) -> Self {
        EntityModel {
            namespace: namespace.into(),
            container: container.into(),
            sets: BTreeMap::new(),
            enums: BTreeMap::new(),
            complex_types: BTreeMap::new(),
            operations: Vec::new(),
        }
    }

    pub fn register(&mut self, mut meta: EntityMetadata) -> Result<()> {
        if self.sets.contains_key(&meta.set_name) {
            return Err(Error::validation(format!(
                "entity set {} is already registered",
                meta.set_name
            )));
        }
        meta.namespace = self.namespace.clone();
        self.sets.insert(meta.set_name.clone(), meta);
        Ok(())
    }

    pub fn set(&self, name: &str) -> Option<&EntityMetadata> {
        self.sets.get(name)
    }

    /// Entity sets in deterministic (alphabetical) order.
    pub fn sets(&self) -> impl Iterator<Item = &EntityMetadata> {
        self.sets.values()
    }

    /// Resolve `<Namespace>.<EntityName>` to the set that declares it.
    pub fn set_for_qualified(&self, qualified: &str) -> Option<&EntityMetadata> {
        self.sets.values().find(|m| m.qualified() == qualified)
    }

    /// Validate every registration-time invariant. Runs once, after all
    /// registrations; the model is immutable afterwards.
    pub fn seal(&self) -> Result<()> {
        for meta in self.sets.values() {
            let set = &meta.set_name;
            if !meta.is_singleton && meta.keys().is_empty() {
                return Err(Error::validation(format!(
                    "entity set {set} declares no key property"
                )));
            }
            if meta.properties.iter().filter(|p| p.etag).count() > 1 {
                return Err(Error::validation(format!(
                    "entity set {set} declares more than one etag property"
                )));
            }
            if let Some(etag) = meta.etag_property() {
                if !etag.is_scalar() {
                    return Err(Error::validation(format!(
                        "etag property {}.{} must be scalar",
                        set, etag.name
                    )));
                }
            }
            for key in meta.keys() {
                if key.nullable {
                    return Err(Error::validation(format!(
                        "key property {}.{} must not be nullable",
                        set, key.name
                    )));
                }
            }
            if let Some(disc) = &meta.type_discriminator {
                if meta.find_property(disc).is_none() {
                    return Err(Error::validation(format!(
                        "type discriminator {disc} does not exist on {set}"
                    )));
                }
            }
            let mut seen_navs = std::collections::HashSet::new();
            for nav in &meta.navigations {
                if !seen_navs.insert(nav.name.as_str()) {
                    return Err(Error::validation(format!(
                        "duplicate navigation {} on {set}",
                        nav.name
                    )));
                }
                let target = self.sets.get(&nav.target).ok_or_else(|| {
                    Error::validation(format!(
                        "navigation {}.{} targets unregistered entity set {}",
                        set, nav.name, nav.target
                    ))
                })?;
                for (from, to) in &nav.foreign_keys {
                    if meta.find_property(from).is_none() {
                        return Err(Error::validation(format!(
                            "navigation {}.{} references missing local property {from}",
                            set, nav.name
                        )));
                    }
                    if target.find_property(to).is_none() {
                        return Err(Error::validation(format!(
                            "navigation {}.{} references missing target property {to}",
                            set, nav.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
