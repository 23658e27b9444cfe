mod json;
mod model;
mod xml;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::metadata::EntityModel;

/// Requested CSDL representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CsdlFormat {
    Xml,
    Json,
}

impl CsdlFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            CsdlFormat::Xml => "application/xml",
            CsdlFormat::Json => "application/json",
        }
    }
}

/// One emitted CSDL document.
#[derive(Debug, Clone)]
pub struct CsdlDocument {
    pub body: String,
    pub etag: String,
    pub content_type: &'static str,
}

struct CachedEntry {
    doc: Arc<CsdlDocument>,
    inserted: u64,
}

const CACHE_CAPACITY: usize = 10;

/// Per-version CSDL cache. Reads clone an `Arc` of the whole map and look up
/// without holding any lock; writes swap in a copied map, so readers never
/// block.
pub struct CsdlCache {
    map: RwLock<Arc<HashMap<(String, CsdlFormat), CachedEntry>>>,
    counter: AtomicU64,
}

impl CsdlCache {
    pub fn new() -> Self {
        CsdlCache {
            map: RwLock::new(Arc::new(HashMap::new())),
            counter: AtomicU64::new(0),
        }
    }

    /// Fetch the CSDL for (version, format), emitting and caching on miss.
    pub fn get(
        &self,
        model: &EntityModel,
        version: &str,
        format: CsdlFormat,
    ) -> Result<Arc<CsdlDocument>> {
        let key = (version.to_string(), format);
        {
            let snapshot = self.map.read().unwrap_or_else(|e| e.into_inner()).clone();
            if let Some(entry) = snapshot.get(&key) {
                return Ok(entry.doc.clone());
            }
        }

        let schema = model::build_schema(model);
        let body = match format {
            CsdlFormat::Xml => xml::write_edmx(&schema, version)?,
            CsdlFormat::Json => json::write_json(&schema, version),
        };
        let mut hasher = Sha256::new();
        hasher.update(body.as_bytes());
        let etag = format!("\"{:x}\"", hasher.finalize());
        let doc = Arc::new(CsdlDocument {
            body,
            etag,
            content_type: format.content_type(),
        });

        let mut guard = self.map.write().unwrap_or_else(|e| e.into_inner());
        let mut next: HashMap<(String, CsdlFormat), CachedEntry> = guard
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    CachedEntry {
                        doc: v.doc.clone(),
                        inserted: v.inserted,
                    },
                )
            })
            .collect();
        if next.len() >= CACHE_CAPACITY {
            if let Some(oldest) = next
                .iter()
                .min_by_key(|(_, v)| v.inserted)
                .map(|(k, _)| k.clone())
            {
                next.remove(&oldest);
            }
        }
        next.insert(
            key,
            CachedEntry {
                doc: doc.clone(),
                inserted: self.counter.fetch_add(1, Ordering::Relaxed),
            },
        );
        *guard = Arc::new(next);
        Ok(doc)
    }
}

impl Default for CsdlCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityMetadata, NavigationMetadata, PropertyMetadata};
    use crate::value::EdmType;

    fn model() -> EntityModel {
        let mut model = EntityModel::new("Shop", "Container");
        model
            .register(
                EntityMetadata::new("Products", "Product", "products")
                    .property(
                        PropertyMetadata::new("ID", EdmType::Int32)
                            .key()
                            .computed(),
                    )
                    .property(
                        PropertyMetadata::new("Name", EdmType::String)
                            .required()
                            .max_length(100),
                    )
                    .property(PropertyMetadata::new("Price", EdmType::Double))
                    .navigation(
                        NavigationMetadata::collection("Descriptions", "ProductDescriptions")
                            .foreign_key("ID", "ProductID"),
                    ),
            )
            .unwrap();
        model
            .register(
                EntityMetadata::new(
                    "ProductDescriptions",
                    "ProductDescription",
                    "product_descriptions",
                )
                .property(PropertyMetadata::new("ID", EdmType::Int32).key())
                .property(PropertyMetadata::new("ProductID", EdmType::Int32))
                .property(PropertyMetadata::new("LanguageKey", EdmType::String)),
            )
            .unwrap();
        model.seal().unwrap();
        model
    }

    #[test]
    fn xml_carries_version_and_structure() {
        let model = model();
        let cache = CsdlCache::new();
        let doc = cache.get(&model, "4.0", CsdlFormat::Xml).unwrap();
        assert!(doc.body.starts_with("<?xml"));
        assert!(doc.body.contains(r#"Version="4.0""#));
        assert!(doc.body.contains(r#"<EntityType Name="Product">"#));
        assert!(doc.body.contains(r#"<PropertyRef Name="ID"/>"#));
        assert!(doc.body.contains(r#"MaxLength="100""#));
        assert!(
            doc.body
                .contains(r#"Type="Collection(Shop.ProductDescription)""#)
        );
        assert!(doc.body.contains(r#"<EntitySet Name="Products""#));
    }

    #[test]
    fn json_carries_container_and_keys() {
        let model = model();
        let cache = CsdlCache::new();
        let doc = cache.get(&model, "4.01", CsdlFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&doc.body).unwrap();
        assert_eq!(parsed["$Version"], "4.01");
        assert_eq!(parsed["$EntityContainer"], "Shop.Container");
        assert_eq!(parsed["Shop"]["Product"]["$Key"][0], "ID");
        // $Nullable defaults to false in CSDL JSON: the nullable Price must
        // carry it, the required Name must not.
        assert_eq!(parsed["Shop"]["Product"]["Price"]["$Nullable"], true);
        assert!(parsed["Shop"]["Product"]["Name"].get("$Nullable").is_none());
        assert!(parsed["Shop"]["Product"]["ID"].get("$Nullable").is_none());
        assert_eq!(parsed["Shop"]["Container"]["Products"]["$Collection"], true);
    }

    #[test]
    fn cache_hits_return_the_same_document() {
        let model = model();
        let cache = CsdlCache::new();
        let a = cache.get(&model, "4.01", CsdlFormat::Xml).unwrap();
        let b = cache.get(&model, "4.01", CsdlFormat::Xml).unwrap();
        assert!(Arc::ptr_eq(&a, &b), "second call must be served from cache");
        assert_eq!(a.etag, b.etag);
        let c = cache.get(&model, "4.0", CsdlFormat::Xml).unwrap();
        assert_ne!(a.etag, c.etag, "version is part of the cache key");
    }

    #[test]
    fn emission_is_deterministic() {
        let model = model();
        let cache_a = CsdlCache::new();
        let cache_b = CsdlCache::new();
        let a = cache_a.get(&model, "4.01", CsdlFormat::Xml).unwrap();
        let b = cache_b.get(&model, "4.01", CsdlFormat::Xml).unwrap();
        assert_eq!(a.body, b.body);
    }
}
