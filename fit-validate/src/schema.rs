//! The frozen schema and the FIT / Universal Payload schema variants.
//!
//! A schema is a tree of elements mirroring the device tree it describes: node elements hold
//! properties and subnodes, down to the wildcard image and configuration nodes.

use std::fmt;

use regex::Regex;

use crate::{
    elements::{Element, ElementKind, NodeKind},
    SchemaError,
};

/// Index of an element within its [`Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementId(usize);

/// A compiled, fully anchored pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    fn new(element: &str, source: &str) -> Result<Self, SchemaError> {
        let regex = Regex::new(&format!("^(?:{source})$")).map_err(|e| SchemaError::Pattern {
            element: element.to_string(),
            pattern: source.to_string(),
            source: e,
        })?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, s: &str) -> bool {
        self.regex.is_match(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "^{}$", self.source)
    }
}

#[derive(Debug)]
pub struct SchemaElement {
    pub name: String,
    pub kind: ElementKind,
    pub required: bool,
    /// `(relative name, expected presence)` pairs controlling whether this element applies.
    pub conditions: Vec<(String, bool)>,
    pub pattern: Option<Pattern>,
    pub parent: Option<ElementId>,
    pub children: Vec<ElementId>,
}

impl SchemaElement {
    pub fn is_node(&self) -> bool {
        self.kind.is_node()
    }

    pub fn is_property(&self) -> bool {
        !self.is_node()
    }

    /// Whether this element matches subnodes of any name.
    pub fn is_node_wildcard(&self) -> bool {
        matches!(
            self.kind,
            ElementKind::Node(NodeKind::Any | NodeKind::Image | NodeKind::Config)
        )
    }

    /// Whether this element matches properties of any name.
    pub fn is_property_wildcard(&self) -> bool {
        matches!(self.kind, ElementKind::AnyProperty(_))
    }
}

/// An immutable element tree, stored as an arena with parent links.
#[derive(Debug)]
pub struct Schema {
    elements: Vec<SchemaElement>,
}

impl Schema {
    /// Freeze `root` and everything below it, compiling all patterns.
    pub fn new(root: Element) -> Result<Self, SchemaError> {
        let mut schema = Self {
            elements: Vec::new(),
        };
        schema.insert(root, None)?;
        Ok(schema)
    }

    fn insert(&mut self, element: Element, parent: Option<ElementId>) -> Result<ElementId, SchemaError> {
        let pattern = element
            .pattern
            .as_deref()
            .map(|p| Pattern::new(&element.name, p))
            .transpose()?;

        let id = ElementId(self.elements.len());
        self.elements.push(SchemaElement {
            name: element.name,
            kind: element.kind,
            required: element.required,
            conditions: element.conditions,
            pattern,
            parent,
            children: Vec::new(),
        });

        for child in element.children {
            let child = self.insert(child, Some(id))?;
            self.elements[id.0].children.push(child);
        }
        Ok(id)
    }

    pub fn root(&self) -> ElementId {
        ElementId(0)
    }

    pub fn get(&self, id: ElementId) -> &SchemaElement {
        &self.elements[id.0]
    }

    pub fn parent(&self, id: ElementId) -> Option<ElementId> {
        self.get(id).parent
    }

    pub fn children(&self, id: ElementId) -> &[ElementId] {
        &self.get(id).children
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Which flavour of image tree to validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Variant {
    /// Plain Flat Image Tree.
    #[default]
    Fit,
    /// Universal Payload.
    Upl,
}

/// Build the schema for `variant`.
pub fn fit_schema(variant: Variant) -> Result<Schema, SchemaError> {
    let upl = variant == Variant::Upl;

    let image = Element::image(
        if upl { r"image-\d+" } else { r"[a-z-]+-\d+" },
        vec![
            Element::string("description").required(),
            Element::timestamp("timestamp"),
            Element::string("arch").required(),
            Element::string("type").required(),
            Element::string("compression"),
            Element::int("data-offset").required().when_absent("data"),
            Element::int("data-size").required().when_absent("data"),
            Element::opaque("data")
                .required()
                .when_absent("data-offset")
                .when_absent("data-size"),
            Element::string("os").required(),
            Element::int("load"),
            Element::string_list("capabilities"),
            Element::string("producer"),
            Element::int("uncomp-size"),
            Element::int("entry-start"),
            Element::int("entry"),
            Element::int("reloc-start"),
        ],
    );

    let config = Element::config(
        if upl { r"config-\d+" } else { r"conf-\d+" },
        vec![
            Element::string("description").required(),
            Element::string("fdt"),
            Element::string_list("loadables"),
            Element::string_list("compatible"),
            Element::bool("require-fit"),
        ],
    );

    let (image, config) = match variant {
        Variant::Upl => (
            image.with([Element::string("project").required()]),
            config.with([Element::string("firmware").required()]),
        ),
        Variant::Fit => (
            image,
            config.with([
                Element::string("kernel").required(),
                Element::string("ramdisk"),
            ]),
        ),
    };

    Schema::new(
        Element::node(
            "/",
            vec![
                Element::timestamp("timestamp").required(),
                Element::string("description").required(),
                Element::address_cells().required(),
                Element::node("images", vec![image]).required(),
                Element::node(
                    "configurations",
                    vec![Element::string("default"), config],
                )
                .required(),
            ],
        )
        .required(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find<'s>(schema: &'s Schema, parent: ElementId, name: &str) -> Option<&'s SchemaElement> {
        schema
            .children(parent)
            .iter()
            .map(|id| schema.get(*id))
            .find(|e| e.name == name)
    }

    fn child_names(schema: &Schema, id: ElementId) -> Vec<&str> {
        schema
            .children(id)
            .iter()
            .map(|c| schema.get(*c).name.as_str())
            .collect()
    }

    #[test]
    fn parents_are_linked() {
        let schema = fit_schema(Variant::Fit).unwrap();
        let root = schema.root();
        assert_eq!(schema.parent(root), None);
        assert_eq!(schema.get(root).name, "/");

        for (i, el) in (0..schema.len()).map(|i| (i, schema.get(ElementId(i)))) {
            for child in &el.children {
                assert_eq!(schema.parent(*child), Some(ElementId(i)));
            }
        }
    }

    #[test]
    fn variants_specialise_wildcards() {
        for (variant, image, config, extra_image, extra_config) in [
            (Variant::Upl, r"^image-\d+$", r"^config-\d+$", vec!["project"], vec!["firmware"]),
            (Variant::Fit, r"^[a-z-]+-\d+$", r"^conf-\d+$", vec![], vec!["kernel", "ramdisk"]),
        ] {
            let schema = fit_schema(variant).unwrap();
            let root = schema.root();
            assert_eq!(
                child_names(&schema, root),
                ["timestamp", "description", "#address-cells", "images", "configurations"]
            );

            let images = schema.children(root)[3];
            let image_id = schema.children(images)[0];
            let image_el = schema.get(image_id);
            assert!(image_el.is_node_wildcard());
            assert_eq!(image_el.pattern.as_ref().unwrap().to_string(), image);
            let names = child_names(&schema, image_id);
            assert_eq!(names[..16].last(), Some(&"reloc-start"));
            assert_eq!(names[16..], extra_image[..]);

            let configurations = schema.children(root)[4];
            let config_id = schema.children(configurations)[1];
            let config_el = schema.get(config_id);
            assert_eq!(config_el.pattern.as_ref().unwrap().to_string(), config);
            assert_eq!(child_names(&schema, config_id)[5..], extra_config[..]);
        }
    }

    #[test]
    fn data_conditions() {
        let schema = fit_schema(Variant::Fit).unwrap();
        let images = schema.children(schema.root())[3];
        let image = schema.children(images)[0];

        let data = find(&schema, image, "data").unwrap();
        assert!(data.required);
        assert_eq!(
            data.conditions,
            [("data-offset".to_string(), false), ("data-size".to_string(), false)]
        );
        let offset = find(&schema, image, "data-offset").unwrap();
        assert_eq!(offset.conditions, [("data".to_string(), false)]);
    }

    #[test]
    fn bad_patterns_are_rejected() {
        let err = Schema::new(Element::node(
            "/",
            vec![Element::string("s").pattern("(unclosed")],
        ))
        .unwrap_err();
        assert!(matches!(err, SchemaError::Pattern { ref element, .. } if element == "s"));
    }
}
