use crate::metadata::{
    ComplexTypeMetadata, EntityMetadata, EntityModel, EnumTypeMetadata, NavigationMetadata,
    OperationMetadata,
};

/// Intermediate CSDL tree both emitters consume. Built deterministically:
/// entity sets alphabetical, enums/complex types sorted by name, properties
/// in declaration order.
pub(crate) struct CsdlSchema<'a> {
    pub namespace: &'a str,
    pub container: &'a str,
    pub enums: Vec<&'a EnumTypeMetadata>,
    pub complex_types: Vec<&'a ComplexTypeMetadata>,
    pub entity_types: Vec<CsdlEntityType<'a>>,
    pub entity_sets: Vec<CsdlEntitySet<'a>>,
    pub singletons: Vec<CsdlEntitySet<'a>>,
    pub operations: &'a [OperationMetadata],
}

pub(crate) struct CsdlEntityType<'a> {
    pub meta: &'a EntityMetadata,
    pub navigations: Vec<CsdlNavigation<'a>>,
}

pub(crate) struct CsdlNavigation<'a> {
    pub nav: &'a NavigationMetadata,
    /// `NS.Target` or `Collection(NS.Target)`.
    pub type_name: String,
}

pub(crate) struct CsdlEntitySet<'a> {
    pub meta: &'a EntityMetadata,
    /// (navigation name, target set name).
    pub bindings: Vec<(&'a str, &'a str)>,
}

pub(crate) fn build_schema(model: &EntityModel) -> CsdlSchema<'_> {
    let mut entity_types = Vec::new();
    let mut entity_sets = Vec::new();
    let mut singletons = Vec::new();

    for meta in model.sets() {
        let navigations = meta
            .navigations
            .iter()
            .map(|nav| {
                let target_entity = model
                    .set(&nav.target)
                    .map(|t| t.qualified())
                    .unwrap_or_else(|| nav.target.clone());
                CsdlNavigation {
                    nav,
                    type_name: if nav.collection {
                        format!("Collection({target_entity})")
                    } else {
                        target_entity
                    },
                }
            })
            .collect();
        entity_types.push(CsdlEntityType { meta, navigations });

        let bindings = meta
            .navigations
            .iter()
            .map(|nav| (nav.name.as_str(), nav.target.as_str()))
            .collect();
        let set = CsdlEntitySet { meta, bindings };
        if meta.is_singleton {
            singletons.push(set);
        } else {
            entity_sets.push(set);
        }
    }

    CsdlSchema {
        namespace: &model.namespace,
        container: &model.container,
        enums: model.enums.values().collect(),
        complex_types: model.complex_types.values().collect(),
        entity_types,
        entity_sets,
        singletons,
        operations: &model.operations,
    }
}
