use serde_json::{Map, Value as Json, json};
use sha2::{Digest, Sha256};

use crate::changes::{ChangeOperation, ChangeRecord};
use crate::compiler::{EntityResult, ExpansionResult};
use crate::error::Result;
use crate::metadata::{EntityMetadata, EntityModel};
use crate::store::Row;
use crate::url::canonical_url;
use crate::value::Value;

/// Negotiated `odata.metadata` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataLevel {
    None,
    #[default]
    Minimal,
    Full,
}

/// Options for one serialized collection payload.
#[derive(Default)]
pub struct CollectionOptions {
    pub count: Option<u64>,
    pub next_link: Option<String>,
    pub delta_link: Option<String>,
}

/// Emits response payloads with the `@odata.*` annotations the negotiated
/// metadata level requires. Annotation keys sort ahead of data fields, which
/// keeps annotations first in the serialized object.
pub struct Serializer<'a> {
    pub model: &'a EntityModel,
    pub base: &'a str,
    pub level: MetadataLevel,
}

impl<'a> Serializer<'a> {
    fn context(&self, fragment: &str) -> String {
        format!("{}/$metadata#{fragment}", self.base)
    }

    pub fn service_document(&self) -> Json {
        let mut entries = Vec::new();
        for meta in self.model.sets() {
            let kind = if meta.is_singleton {
                "Singleton"
            } else {
                "EntitySet"
            };
            entries.push(json!({
                "name": meta.set_name,
                "kind": kind,
                "url": meta.set_name,
            }));
        }
        let mut doc = Map::new();
        if self.level != MetadataLevel::None {
            doc.insert(
                "@odata.context".into(),
                json!(format!("{}/$metadata", self.base)),
            );
        }
        doc.insert("value".into(), Json::Array(entries));
        Json::Object(doc)
    }

    pub fn collection(
        &self,
        meta: &EntityMetadata,
        results: &[EntityResult],
        options: &CollectionOptions,
    ) -> Result<Json> {
        let mut doc = Map::new();
        if self.level != MetadataLevel::None {
            doc.insert(
                "@odata.context".into(),
                json!(self.context(&meta.set_name)),
            );
        }
        if let Some(count) = options.count {
            doc.insert("@odata.count".into(), json!(count));
        }
        if let Some(next) = &options.next_link {
            doc.insert("@odata.nextLink".into(), json!(next));
        }
        if let Some(delta) = &options.delta_link {
            doc.insert("@odata.deltaLink".into(), json!(delta));
        }
        let value: Vec<Json> = results
            .iter()
            .map(|r| self.entity_object(meta, r, false).map(Json::Object))
            .collect::<Result<_>>()?;
        doc.insert("value".into(), Json::Array(value));
        Ok(Json::Object(doc))
    }

    /// Rows produced by `$apply` have no entity shape; serialize them as-is.
    pub fn aggregate_collection(&self, meta: &EntityMetadata, rows: &[Row]) -> Json {
        let mut doc = Map::new();
        if self.level != MetadataLevel::None {
            doc.insert(
                "@odata.context".into(),
                json!(self.context(&format!(
                    "{}({})",
                    meta.set_name, "@Aggregation"
                ))),
            );
        }
        let value: Vec<Json> = rows
            .iter()
            .map(|row| {
                Json::Object(row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            })
            .collect();
        doc.insert("value".into(), Json::Array(value));
        Json::Object(doc)
    }

    pub fn entity(
        &self,
        meta: &EntityMetadata,
        result: &EntityResult,
        typecast: bool,
    ) -> Result<Json> {
        let mut object = self.entity_object(meta, result, typecast)?;
        if self.level != MetadataLevel::None {
            object.insert(
                "@odata.context".into(),
                json!(self.context(&format!("{}/$entity", meta.set_name))),
            );
        }
        Ok(Json::Object(object))
    }

    fn entity_object(
        &self,
        meta: &EntityMetadata,
        result: &EntityResult,
        typecast: bool,
    ) -> Result<Map<String, Json>> {
        let mut object = Map::new();
        let id = canonical_url(self.base, meta, &result.row).ok();

        match self.level {
            MetadataLevel::Full => {
                object.insert(
                    "@odata.type".into(),
                    json!(format!("#{}", meta.qualified())),
                );
                if let Some(id) = &id {
                    object.insert("@odata.id".into(), json!(id));
                    object.insert("@odata.editLink".into(), json!(id));
                }
                for nav in &meta.navigations {
                    let expanded = result.expansions.iter().any(|(n, _)| n == &nav.name);
                    if !expanded {
                        if let Some(id) = &id {
                            object.insert(
                                format!("{}@odata.navigationLink", nav.name),
                                json!(format!("{id}/{}", nav.name)),
                            );
                        }
                    }
                }
            }
            MetadataLevel::Minimal => {
                // Keys are always projected, so the id is inferable unless a
                // typecast changed the addressed shape.
                let keys_present = meta
                    .keys()
                    .iter()
                    .all(|k| result.row.contains_key(&k.column));
                if typecast || !keys_present {
                    if let Some(id) = &id {
                        object.insert("@odata.id".into(), json!(id));
                    }
                }
            }
            MetadataLevel::None => {}
        }

        if self.level != MetadataLevel::None {
            if let Some(etag) = entity_etag(meta, &result.row) {
                object.insert("@odata.etag".into(), json!(etag));
            }
        }

        for prop in &meta.properties {
            if prop.stream {
                continue;
            }
            if let Some(value) = result.row.get(&prop.column) {
                object.insert(prop.name.clone(), value.to_json());
            }
        }
        // Compute aliases ride along as dynamic properties.
        for (key, value) in &result.row {
            if key.starts_with("__") {
                continue;
            }
            let declared = meta.properties.iter().any(|p| &p.column == key);
            if !declared {
                object.insert(key.clone(), value.to_json());
            }
        }

        for (name, expansion) in &result.expansions {
            let nav = meta.find_navigation(name);
            let target = nav.and_then(|n| self.model.set(&n.target));
            let Some(target) = target else {
                continue;
            };
            match expansion {
                ExpansionResult::Collection { items, count } => {
                    if let Some(count) = count {
                        object.insert(format!("{name}@odata.count"), json!(count));
                    }
                    let serialized: Vec<Json> = items
                        .iter()
                        .map(|item| self.entity_object(target, item, false).map(Json::Object))
                        .collect::<Result<_>>()?;
                    object.insert(name.clone(), Json::Array(serialized));
                }
                ExpansionResult::Single(item) => {
                    let serialized = match item {
                        Some(item) => {
                            Json::Object(self.entity_object(target, item, false)?)
                        }
                        None => Json::Null,
                    };
                    object.insert(name.clone(), serialized);
                }
            }
        }
        Ok(object)
    }

    /// A structural property payload (`GET /Set(k)/Prop`).
    pub fn property(
        &self,
        meta: &EntityMetadata,
        row: &Row,
        property: &str,
        value: &Value,
    ) -> Result<Json> {
        let mut doc = Map::new();
        if self.level != MetadataLevel::None {
            let key = crate::url::canonical_key(meta, row)?;
            doc.insert(
                "@odata.context".into(),
                json!(self.context(&format!("{}{}/{}", meta.set_name, key, property))),
            );
        }
        doc.insert("value".into(), value.to_json());
        Ok(Json::Object(doc))
    }

    /// `$ref` payloads carry only `@odata.id`.
    pub fn reference(&self, meta: &EntityMetadata, row: &Row) -> Result<Json> {
        Ok(json!({ "@odata.id": canonical_url(self.base, meta, row)? }))
    }

    pub fn reference_collection(
        &self,
        meta: &EntityMetadata,
        rows: &[Row],
    ) -> Result<Json> {
        let refs: Vec<Json> = rows
            .iter()
            .map(|row| self.reference(meta, row))
            .collect::<Result<_>>()?;
        Ok(json!({
            "@odata.context": format!("{}/$metadata#Collection($ref)", self.base),
            "value": refs,
        }))
    }

    /// Delta feed: changed entities plus `@removed` tombstones, with the
    /// next delta link.
    pub fn delta(
        &self,
        meta: &EntityMetadata,
        changes: &[ChangeRecord],
        delta_link: &str,
    ) -> Result<Json> {
        let mut value = Vec::new();
        for change in changes {
            match change.operation {
                ChangeOperation::Delete => {
                    let mut tombstone = Map::new();
                    tombstone.insert("@removed".into(), json!({ "reason": "deleted" }));
                    if let Ok(id) = canonical_url(self.base, meta, &change.key) {
                        tombstone.insert("@odata.id".into(), json!(id));
                    }
                    for (column, v) in &change.key {
                        if let Some(prop) =
                            meta.properties.iter().find(|p| &p.column == column)
                        {
                            tombstone.insert(prop.name.clone(), v.to_json());
                        }
                    }
                    value.push(Json::Object(tombstone));
                }
                ChangeOperation::Create | ChangeOperation::Update => {
                    let row = change.snapshot.clone().unwrap_or_else(|| change.key.clone());
                    let object =
                        self.entity_object(meta, &EntityResult::bare(row), false)?;
                    value.push(Json::Object(object));
                }
            }
        }
        let mut doc = Map::new();
        doc.insert(
            "@odata.context".into(),
            json!(self.context(&format!("{}/$delta", meta.set_name))),
        );
        doc.insert("@odata.deltaLink".into(), json!(delta_link));
        doc.insert("value".into(), Json::Array(value));
        Ok(Json::Object(doc))
    }
}

/// Weak ETag derived from the concurrency property value; identical content
/// yields an identical tag.
pub fn entity_etag(meta: &EntityMetadata, row: &Row) -> Option<String> {
    let etag_prop = meta.etag_property()?;
    let value = row.get(&etag_prop.column)?;
    if value.is_null() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(value.raw_text().as_bytes());
    let digest = hasher.finalize();
    Some(format!("W/\"{:x}\"", digest))
}
