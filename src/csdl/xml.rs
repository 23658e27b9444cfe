use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

use crate::csdl::model::CsdlSchema;
use crate::error::{Error, Result};
use crate::metadata::PropertyMetadata;

const EDMX_NS: &str = "http://docs.oasis-open.org/odata/ns/edmx";
const EDM_NS: &str = "http://docs.oasis-open.org/odata/ns/edm";

/// Emit the EDMX document for the negotiated protocol version.
pub(crate) fn write_edmx(schema: &CsdlSchema<'_>, version: &str) -> Result<String> {
    let mut w = XmlOut {
        writer: Writer::new(Vec::new()),
    };
    w.decl()?;
    w.open("edmx:Edmx", &[("xmlns:edmx", EDMX_NS), ("Version", version)])?;
    w.open("edmx:DataServices", &[])?;
    write_schema(&mut w, schema)?;
    w.close("edmx:DataServices")?;
    w.close("edmx:Edmx")?;
    String::from_utf8(w.writer.into_inner())
        .map_err(|e| Error::internal(format!("CSDL is not valid UTF-8: {e}")))
}

struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl XmlOut {
    fn decl(&mut self) -> Result<()> {
        self.writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(write_err)
    }

    fn open(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        let mut el = BytesStart::new(name);
        for (k, v) in attrs {
            el.push_attribute((*k, *v));
        }
        self.writer.write_event(Event::Start(el)).map_err(write_err)
    }

    fn close(&mut self, name: &str) -> Result<()> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(write_err)
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        let mut el = BytesStart::new(name);
        for (k, v) in attrs {
            el.push_attribute((*k, *v));
        }
        self.writer.write_event(Event::Empty(el)).map_err(write_err)
    }
}

fn write_err(e: std::io::Error) -> Error {
    Error::internal(format!("CSDL XML emission failed: {e}"))
}

fn write_schema(w: &mut XmlOut, schema: &CsdlSchema<'_>) -> Result<()> {
    w.open(
        "Schema",
        &[("xmlns", EDM_NS), ("Namespace", schema.namespace)],
    )?;

    for enum_ty in &schema.enums {
        let underlying = enum_ty.underlying.name();
        let mut attrs = vec![
            ("Name", enum_ty.name.as_str()),
            ("UnderlyingType", underlying.as_str()),
        ];
        if enum_ty.is_flags {
            attrs.push(("IsFlags", "true"));
        }
        w.open("EnumType", &attrs)?;
        for member in &enum_ty.members {
            let value = member.value.to_string();
            w.empty(
                "Member",
                &[("Name", member.name.as_str()), ("Value", value.as_str())],
            )?;
        }
        w.close("EnumType")?;
    }

    for complex in &schema.complex_types {
        w.open("ComplexType", &[("Name", complex.name.as_str())])?;
        for prop in &complex.properties {
            write_property(w, prop)?;
        }
        w.close("ComplexType")?;
    }

    for entity in &schema.entity_types {
        w.open("EntityType", &[("Name", entity.meta.entity_name.as_str())])?;
        let keys = entity.meta.keys();
        if !keys.is_empty() {
            w.open("Key", &[])?;
            for key in &keys {
                w.empty("PropertyRef", &[("Name", key.name.as_str())])?;
            }
            w.close("Key")?;
        }
        for prop in &entity.meta.properties {
            write_property(w, prop)?;
        }
        for nav in &entity.navigations {
            let attrs = [
                ("Name", nav.nav.name.as_str()),
                ("Type", nav.type_name.as_str()),
            ];
            if nav.nav.collection || nav.nav.foreign_keys.is_empty() {
                w.empty("NavigationProperty", &attrs)?;
            } else {
                w.open("NavigationProperty", &attrs)?;
                for (from, to) in &nav.nav.foreign_keys {
                    w.empty(
                        "ReferentialConstraint",
                        &[("Property", from.as_str()), ("ReferencedProperty", to.as_str())],
                    )?;
                }
                w.close("NavigationProperty")?;
            }
        }
        w.close("EntityType")?;
    }

    for op in schema.operations {
        let kind = if op.is_action { "Action" } else { "Function" };
        let mut attrs = vec![("Name", op.name.as_str())];
        if op.bound_to.is_some() {
            attrs.push(("IsBound", "true"));
        }
        w.open(kind, &attrs)?;
        for (name, ty) in &op.parameters {
            let ty_name = ty.name();
            w.empty(
                "Parameter",
                &[("Name", name.as_str()), ("Type", ty_name.as_str())],
            )?;
        }
        if let Some(ret) = &op.return_type {
            let ty_name = ret.name();
            w.empty("ReturnType", &[("Type", ty_name.as_str())])?;
        }
        w.close(kind)?;
    }

    w.open("EntityContainer", &[("Name", schema.container)])?;
    for set in &schema.entity_sets {
        let entity_type = set.meta.qualified();
        w.open(
            "EntitySet",
            &[
                ("Name", set.meta.set_name.as_str()),
                ("EntityType", entity_type.as_str()),
            ],
        )?;
        for (path, target) in &set.bindings {
            w.empty(
                "NavigationPropertyBinding",
                &[("Path", *path), ("Target", *target)],
            )?;
        }
        w.close("EntitySet")?;
    }
    for single in &schema.singletons {
        let entity_type = single.meta.qualified();
        w.empty(
            "Singleton",
            &[
                ("Name", single.meta.set_name.as_str()),
                ("Type", entity_type.as_str()),
            ],
        )?;
    }
    for op in schema.operations {
        if op.bound_to.is_some() {
            continue;
        }
        let qualified = format!("{}.{}", schema.namespace, op.name);
        if op.is_action {
            w.empty(
                "ActionImport",
                &[("Name", op.name.as_str()), ("Action", qualified.as_str())],
            )?;
        } else {
            w.empty(
                "FunctionImport",
                &[("Name", op.name.as_str()), ("Function", qualified.as_str())],
            )?;
        }
    }
    w.close("EntityContainer")?;

    w.close("Schema")
}

fn write_property(w: &mut XmlOut, prop: &PropertyMetadata) -> Result<()> {
    let ty = prop.ty.name();
    let mut attrs: Vec<(&str, String)> = vec![("Name", prop.name.clone()), ("Type", ty)];
    if !prop.nullable {
        attrs.push(("Nullable", "false".into()));
    }
    if let Some(max) = prop.max_length {
        attrs.push(("MaxLength", max.to_string()));
    }
    if let Some(p) = prop.precision {
        attrs.push(("Precision", p.to_string()));
    }
    if let Some(s) = prop.scale {
        attrs.push(("Scale", s.to_string()));
    }
    if let Some(default) = &prop.default_value {
        attrs.push(("DefaultValue", default.raw_text()));
    }
    let borrowed: Vec<(&str, &str)> = attrs.iter().map(|(k, v)| (*k, v.as_str())).collect();
    w.empty("Property", &borrowed)
}
