use serde_json::{Map, Value as Json, json};

use crate::csdl::model::CsdlSchema;
use crate::metadata::PropertyMetadata;
use crate::value::EdmType;

/// Emit the CSDL JSON document for the negotiated protocol version. Shape
/// follows OData CSDL JSON: `$`-prefixed control fields, one object per
/// schema child, deterministic member order.
pub(crate) fn write_json(schema: &CsdlSchema<'_>, version: &str) -> String {
    let mut root = Map::new();
    root.insert("$Version".into(), json!(version));
    root.insert(
        "$EntityContainer".into(),
        json!(format!("{}.{}", schema.namespace, schema.container)),
    );

    let mut ns = Map::new();

    for enum_ty in &schema.enums {
        let mut body = Map::new();
        body.insert("$Kind".into(), json!("EnumType"));
        body.insert("$UnderlyingType".into(), json!(enum_ty.underlying.name()));
        if enum_ty.is_flags {
            body.insert("$IsFlags".into(), json!(true));
        }
        for member in &enum_ty.members {
            body.insert(member.name.clone(), json!(member.value));
        }
        ns.insert(enum_ty.name.clone(), Json::Object(body));
    }

    for complex in &schema.complex_types {
        let mut body = Map::new();
        body.insert("$Kind".into(), json!("ComplexType"));
        for prop in &complex.properties {
            body.insert(prop.name.clone(), property_json(prop));
        }
        ns.insert(complex.name.clone(), Json::Object(body));
    }

    for entity in &schema.entity_types {
        let mut body = Map::new();
        body.insert("$Kind".into(), json!("EntityType"));
        let keys: Vec<&str> = entity.meta.keys().iter().map(|k| k.name.as_str()).collect();
        if !keys.is_empty() {
            body.insert("$Key".into(), json!(keys));
        }
        for prop in &entity.meta.properties {
            body.insert(prop.name.clone(), property_json(prop));
        }
        for nav in &entity.navigations {
            let mut nav_body = Map::new();
            nav_body.insert("$Kind".into(), json!("NavigationProperty"));
            if nav.nav.collection {
                nav_body.insert("$Collection".into(), json!(true));
                nav_body.insert(
                    "$Type".into(),
                    json!(
                        nav.type_name
                            .trim_start_matches("Collection(")
                            .trim_end_matches(')')
                    ),
                );
            } else {
                nav_body.insert("$Type".into(), json!(nav.type_name));
                if !nav.nav.foreign_keys.is_empty() {
                    let constraints: Map<String, Json> = nav
                        .nav
                        .foreign_keys
                        .iter()
                        .map(|(from, to)| (from.clone(), json!(to)))
                        .collect();
                    nav_body.insert(
                        "$ReferentialConstraint".into(),
                        Json::Object(constraints),
                    );
                }
            }
            body.insert(nav.nav.name.clone(), Json::Object(nav_body));
        }
        ns.insert(entity.meta.entity_name.clone(), Json::Object(body));
    }

    for op in schema.operations {
        let mut overload = Map::new();
        overload.insert(
            "$Kind".into(),
            json!(if op.is_action { "Action" } else { "Function" }),
        );
        if op.bound_to.is_some() {
            overload.insert("$IsBound".into(), json!(true));
        }
        let params: Vec<Json> = op
            .parameters
            .iter()
            .map(|(name, ty)| json!({ "$Name": name, "$Type": ty.name() }))
            .collect();
        if !params.is_empty() {
            overload.insert("$Parameter".into(), json!(params));
        }
        if let Some(ret) = &op.return_type {
            overload.insert("$ReturnType".into(), json!({ "$Type": ret.name() }));
        }
        // Overloads share a name and collect into one array.
        if let Some(Json::Array(items)) = ns.get_mut(&op.name) {
            items.push(Json::Object(overload));
        } else {
            ns.insert(op.name.clone(), Json::Array(vec![Json::Object(overload)]));
        }
    }

    let mut container = Map::new();
    container.insert("$Kind".into(), json!("EntityContainer"));
    for set in &schema.entity_sets {
        let mut set_body = Map::new();
        set_body.insert("$Collection".into(), json!(true));
        set_body.insert("$Type".into(), json!(set.meta.qualified()));
        if !set.bindings.is_empty() {
            let bindings: Map<String, Json> = set
                .bindings
                .iter()
                .map(|(path, target)| (path.to_string(), json!(target)))
                .collect();
            set_body.insert("$NavigationPropertyBinding".into(), Json::Object(bindings));
        }
        container.insert(set.meta.set_name.clone(), Json::Object(set_body));
    }
    for single in &schema.singletons {
        container.insert(
            single.meta.set_name.clone(),
            json!({ "$Type": single.meta.qualified() }),
        );
    }
    for op in schema.operations {
        if op.bound_to.is_some() {
            continue;
        }
        let qualified = format!("{}.{}", schema.namespace, op.name);
        let import = if op.is_action {
            json!({ "$Action": qualified })
        } else {
            json!({ "$Function": qualified })
        };
        container.insert(op.name.clone(), import);
    }
    ns.insert(schema.container.to_string(), Json::Object(container));

    root.insert(schema.namespace.to_string(), Json::Object(ns));
    Json::Object(root).to_string()
}

fn property_json(prop: &PropertyMetadata) -> Json {
    let mut body = Map::new();
    let (ty, collection) = match &prop.ty {
        EdmType::Collection(inner) => (inner.name(), true),
        other => (other.name(), false),
    };
    if ty != "Edm.String" {
        body.insert("$Type".into(), json!(ty));
    }
    if collection {
        body.insert("$Collection".into(), json!(true));
    }
    // CSDL JSON inverts the XML default: absence means non-nullable.
    if prop.nullable {
        body.insert("$Nullable".into(), json!(true));
    }
    if let Some(max) = prop.max_length {
        body.insert("$MaxLength".into(), json!(max));
    }
    if let Some(p) = prop.precision {
        body.insert("$Precision".into(), json!(p));
    }
    if let Some(s) = prop.scale {
        body.insert("$Scale".into(), json!(s));
    }
    if let Some(default) = &prop.default_value {
        body.insert("$DefaultValue".into(), default.to_json());
    }
    Json::Object(body)
}
