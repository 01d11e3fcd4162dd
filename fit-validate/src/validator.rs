//! Validation of a device tree against a [`Schema`].
//!
//! The tree is walked depth first. Each node is matched to a schema element through its parent's
//! element, then its properties and required children are checked. Nodes that match nothing are
//! reported once and their contents are skipped.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use dtree::{Document, Node};
use tracing::{debug, trace};

use crate::{
    elements::{ElementKind, NodeKind},
    findings::{Finding, Findings},
    schema::{ElementId, Schema},
    ValidationError,
};

/// What kind of element a lookup is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    Node,
    Property,
    Either,
}

impl Expected {
    fn node(self) -> bool {
        self != Expected::Property
    }

    fn property(self) -> bool {
        self != Expected::Node
    }
}

/// Result of looking up a name among a node element's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Found(ElementId),
    /// No element matches.
    Unmatched,
    /// No element matches, but the property is part of the device tree format itself.
    Ignored,
}

#[derive(Debug)]
pub struct Validator {
    schema: Arc<Schema>,
    findings: Findings,
    model_list: Vec<String>,
    submodel_list: BTreeMap<String, Vec<String>>,
}

impl Validator {
    pub fn new(schema: Arc<Schema>, raise_on_error: bool) -> Self {
        Self {
            schema,
            findings: Findings::new(raise_on_error),
            model_list: Vec::new(),
            submodel_list: BTreeMap::new(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Failures found by the last run.
    pub fn errors(&self) -> &[Finding] {
        self.findings.errors()
    }

    /// Names of the nodes matched by model elements in the last run.
    pub fn model_list(&self) -> &[String] {
        &self.model_list
    }

    /// Names of the nodes matched by submodel elements in the last run, keyed by model.
    pub fn submodel_list(&self) -> &BTreeMap<String, Vec<String>> {
        &self.submodel_list
    }

    pub fn fail(
        &mut self,
        location: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), ValidationError> {
        self.findings.fail(location, message)
    }

    /// Load and validate a device tree file, source or compiled.
    pub fn start(&mut self, path: impl AsRef<Path>) -> Result<Vec<Finding>, ValidationError> {
        let path = path.as_ref();
        self.reset();

        let doc = dtree::load(path).map_err(|source| ValidationError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "validating");
        self.run(&doc)
    }

    /// Validate an already loaded device tree.
    pub fn validate(&mut self, doc: &Document) -> Result<Vec<Finding>, ValidationError> {
        self.reset();
        self.run(doc)
    }

    fn reset(&mut self) {
        self.findings.clear();
        self.model_list.clear();
        self.submodel_list.clear();
    }

    fn run(&mut self, doc: &Document) -> Result<Vec<Finding>, ValidationError> {
        let schema = Arc::clone(&self.schema);
        self.validate_tree(&schema, doc.root(), schema.root(), None)?;
        debug!(findings = self.errors().len(), "validation done");
        Ok(self.errors().to_vec())
    }

    /// Properties the device tree format defines for any node with unit addresses.
    pub fn is_builtin_property(node: Node<'_>, name: &str) -> bool {
        match name {
            "reg" => node.name().contains('@'),
            "#address-cells" | "#size-cells" => node.subnodes().any(|n| n.name().contains('@')),
            _ => false,
        }
    }

    /// Whether `element` applies, given the conditions it places on its siblings.
    ///
    /// `parent` is the tree node matching the element's parent. Each `../` prefix on a condition
    /// moves one level up in both the schema and the tree. A condition only counts if its name is
    /// declared in the schema at that level.
    pub fn element_present(schema: &Schema, element: ElementId, parent: Option<Node<'_>>) -> bool {
        let Some(parent) = parent else {
            return true;
        };
        let el = schema.get(element);

        el.conditions.iter().all(|(rel_name, expected)| {
            let mut name = rel_name.as_str();
            let mut schema_target = el.parent;
            let mut node_target = Some(parent);
            while let Some(rest) = name.strip_prefix("../") {
                schema_target = schema_target.and_then(|s| schema.parent(s));
                node_target = node_target.and_then(|n| n.parent());
                name = rest;
            }
            let (Some(schema_target), Some(node_target)) = (schema_target, node_target) else {
                return true;
            };

            let declared = schema
                .children(schema_target)
                .iter()
                .any(|c| schema.get(*c).name == name);
            let actual = node_target.has_prop(name) || node_target.subnode(name).is_some();

            !declared || *expected == actual
        })
    }

    /// Find the element describing `name` among the children of `parent`.
    ///
    /// An exact name match wins over wildcards. `node` is the tree node holding the property, or
    /// the parent of the subnode, being looked up.
    pub fn get_element(
        schema: &Schema,
        parent: ElementId,
        name: &str,
        node: Option<Node<'_>>,
        expected: Expected,
    ) -> Lookup {
        let present: Vec<ElementId> = schema
            .children(parent)
            .iter()
            .copied()
            .filter(|c| Self::element_present(schema, *c, node))
            .collect();

        if let Some(id) = present.iter().find(|c| schema.get(**c).name == name) {
            trace!(name, "exact match");
            return Lookup::Found(*id);
        }

        let wildcard = present.iter().find(|c| {
            let el = schema.get(**c);
            (expected.node() && el.is_node_wildcard())
                || (expected.property() && el.is_property_wildcard())
        });
        if let Some(id) = wildcard {
            trace!(name, "wildcard match");
            return Lookup::Found(*id);
        }

        if expected == Expected::Property
            && (name == "linux,phandle" || node.is_some_and(|n| Self::is_builtin_property(n, name)))
        {
            return Lookup::Ignored;
        }
        Lookup::Unmatched
    }

    /// Find an element by its schema path, e.g. `/images/ANY/description`.
    pub fn get_element_by_path(&self, path: &str) -> Option<ElementId> {
        path.split('/')
            .filter(|part| !part.is_empty())
            .try_fold(self.schema.root(), |el, part| {
                match Self::get_element(&self.schema, el, part, None, Expected::Either) {
                    Lookup::Found(id) => Some(id),
                    _ => None,
                }
            })
    }

    /// Find the schema for subnode `node`, reporting it if there is none.
    pub fn get_schema(
        &mut self,
        schema: &Schema,
        node: Node<'_>,
        parent_schema: ElementId,
    ) -> Result<Option<ElementId>, ValidationError> {
        let parent = node.parent();
        match Self::get_element(schema, parent_schema, node.name(), parent, Expected::Node) {
            Lookup::Found(id) if schema.get(id).is_node() => return Ok(Some(id)),
            Lookup::Ignored => return Ok(None),
            _ => {}
        }

        let valid: Vec<&str> = schema
            .children(parent_schema)
            .iter()
            .filter(|c| schema.get(**c).is_node() && Self::element_present(schema, **c, parent))
            .map(|c| schema.get(*c).name.as_str())
            .collect();
        let location = parent.map(|p| p.path()).unwrap_or_else(|| "/".into());
        self.fail(
            location,
            format!(
                "Unexpected subnode '{}', valid list is ({})",
                node.name(),
                valid.join(", ")
            ),
        )?;
        Ok(None)
    }

    /// Check the properties and required children of `node` against `element`.
    pub fn validate_schema(
        &mut self,
        schema: &Schema,
        node: Node<'_>,
        element: ElementId,
    ) -> Result<(), ValidationError> {
        let el = schema.get(element);
        let path = node.path();
        el.check_node(&mut self.findings, node)?;

        let present: Vec<ElementId> = schema
            .children(element)
            .iter()
            .copied()
            .filter(|c| Self::element_present(schema, *c, Some(node)))
            .collect();

        for prop in node.props() {
            let name = prop.name();
            if name == "linux,phandle" {
                continue;
            }

            match Self::get_element(schema, element, name, Some(node), Expected::Property) {
                Lookup::Found(id) if schema.get(id).is_property() => {
                    schema.get(id).check_prop(&mut self.findings, prop)?;
                }
                Lookup::Ignored => {}
                _ if name == "phandle" => {
                    self.fail(path.clone(), "phandle target not valid for this node")?;
                }
                _ if Self::is_builtin_property(node, name) => {}
                _ => {
                    let valid: Vec<&str> = present
                        .iter()
                        .map(|c| schema.get(*c))
                        .filter(|c| c.is_property())
                        .map(|c| c.name.as_str())
                        .collect();
                    self.fail(
                        path.clone(),
                        format!(
                            "Unexpected property '{name}', valid list is ({})",
                            valid.join(", ")
                        ),
                    )?;
                }
            }
        }

        for child in present.iter().map(|c| schema.get(*c)) {
            if child.is_property() && child.required && !node.has_prop(&child.name) {
                self.fail(
                    path.clone(),
                    format!("Required property '{}' missing", child.name),
                )?;
            }
        }

        let subnodes: Vec<&str> = node.subnodes().map(|n| n.name()).collect();
        for child in present.iter().map(|c| schema.get(*c)) {
            if child.is_node() && child.required && !subnodes.contains(&child.name.as_str()) {
                let mut msg = format!("Missing subnode '{}'", child.name);
                if !subnodes.is_empty() {
                    msg.push_str(&format!(" in {}", subnodes.join(", ")));
                }
                self.fail(path.clone(), msg)?;
            }
        }

        Ok(())
    }

    /// Validate `node` and everything below it. The root node uses `parent_schema` directly.
    pub fn validate_tree<'a>(
        &mut self,
        schema: &Schema,
        node: Node<'a>,
        parent_schema: ElementId,
        model: Option<&'a str>,
    ) -> Result<(), ValidationError> {
        let element = if node.is_root() {
            parent_schema
        } else {
            match self.get_schema(schema, node, parent_schema)? {
                Some(element) => element,
                None => {
                    debug!(node = %node.path(), "no schema, skipping subtree");
                    return Ok(());
                }
            }
        };
        trace!(node = %node.path(), element = %schema.get(element).name, "validating node");

        let mut model = model;
        match schema.get(element).kind {
            ElementKind::Node(NodeKind::Model) => {
                self.model_list.push(node.name().to_string());
                model = Some(node.name());
            }
            ElementKind::Node(NodeKind::Submodel) => {
                self.submodel_list
                    .entry(model.unwrap_or_default().to_string())
                    .or_default()
                    .push(node.name().to_string());
            }
            _ => {}
        }

        self.validate_schema(schema, node, element)?;
        for subnode in node.subnodes() {
            self.validate_tree(schema, subnode, element, model)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dtree::DocumentBuilder;

    use super::*;
    use crate::{fit_schema, Element, Variant};

    fn messages(findings: &[Finding]) -> Vec<String> {
        findings.iter().map(ToString::to_string).collect()
    }

    fn str_prop(s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        v
    }

    fn u32_prop(v: u32) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }

    /// A valid UPL document; `edit` may tweak the builder before it is frozen.
    fn upl_doc(edit: impl FnOnce(&mut DocumentBuilder, dtree::NodeId, dtree::NodeId)) -> Document {
        let mut b = DocumentBuilder::new();
        let root = b.root();
        b.add_property(root, "timestamp", u32_prop(123456));
        b.add_property(root, "description", str_prop("This is my description"));
        b.add_property(root, "#address-cells", u32_prop(1));

        let images = b.add_node(root, "images");
        let image = b.add_node(images, "image-1");
        for (name, value) in [
            ("description", "Image description"),
            ("arch", "arm64"),
            ("type", "kernel"),
            ("data", "abc"),
            ("os", "linux"),
            ("project", "linux"),
        ] {
            b.add_property(image, name, str_prop(value));
        }

        let configs = b.add_node(root, "configurations");
        let config = b.add_node(configs, "config-1");
        b.add_property(config, "description", str_prop("Configuration description"));
        b.add_property(config, "firmware", str_prop("image-1"));

        edit(&mut b, image, config);
        b.build()
    }

    fn upl_validator() -> Validator {
        Validator::new(Arc::new(fit_schema(Variant::Upl).unwrap()), false)
    }

    #[test]
    fn valid_document() {
        let doc = upl_doc(|_, _, _| {});
        let mut val = upl_validator();
        assert!(val.validate(&doc).unwrap().is_empty());
        assert!(val.errors().is_empty());
    }

    #[test]
    fn builtin_properties() {
        let mut b = DocumentBuilder::new();
        let root = b.root();
        let bus = b.add_node(root, "bus");
        let dev = b.add_node(bus, "dev@1000");
        let plain = b.add_node(root, "plain");
        b.add_node(plain, "child");
        let doc = b.build();

        let bus = doc.node(bus);
        let dev = doc.node(dev);
        let plain = doc.node(plain);
        assert!(Validator::is_builtin_property(dev, "reg"));
        assert!(!Validator::is_builtin_property(bus, "reg"));
        assert!(Validator::is_builtin_property(bus, "#address-cells"));
        assert!(Validator::is_builtin_property(bus, "#size-cells"));
        assert!(!Validator::is_builtin_property(plain, "#size-cells"));
        assert!(!Validator::is_builtin_property(dev, "compatible"));
    }

    #[test]
    fn lookup_prefers_exact_names() {
        let schema = Schema::new(Element::node(
            "/",
            vec![
                Element::any_node("", vec![]),
                Element::any_property(None),
                Element::node("images", vec![]),
                Element::bool("flag"),
            ],
        ))
        .unwrap();
        let root = schema.root();
        let id = |i: usize| schema.children(root)[i];

        for (name, expected, lookup) in [
            ("images", Expected::Node, Lookup::Found(id(2))),
            ("other", Expected::Node, Lookup::Found(id(0))),
            ("flag", Expected::Property, Lookup::Found(id(3))),
            ("other", Expected::Property, Lookup::Found(id(1))),
            ("other", Expected::Either, Lookup::Found(id(0))),
        ] {
            assert_eq!(
                lookup,
                Validator::get_element(&schema, root, name, None, expected),
                "{name} as {expected:?}"
            );
        }
    }

    #[test]
    fn lookup_tolerates_format_properties() {
        let schema = fit_schema(Variant::Fit).unwrap();
        let doc = upl_doc(|_, _, _| {});
        let root = schema.root();
        let node = Some(doc.root());

        assert_eq!(
            Validator::get_element(&schema, root, "linux,phandle", node, Expected::Property),
            Lookup::Ignored
        );
        assert_eq!(
            Validator::get_element(&schema, root, "wibble", node, Expected::Property),
            Lookup::Unmatched
        );
        assert_eq!(
            Validator::get_element(&schema, root, "linux,phandle", node, Expected::Node),
            Lookup::Unmatched
        );
    }

    #[test]
    fn lookup_by_path() {
        let val = upl_validator();
        let schema = val.schema();

        let desc = val.get_element_by_path("/images/image-1/description").unwrap();
        assert_eq!(schema.get(desc).name, "description");
        let images = schema.parent(schema.parent(desc).unwrap()).unwrap();
        assert_eq!(schema.get(images).name, "images");

        assert_eq!(val.get_element_by_path("/"), Some(schema.root()));
        assert_eq!(val.get_element_by_path("/nothing/here"), None);
    }

    #[test]
    fn conditional_elements() {
        let schema = fit_schema(Variant::Upl).unwrap();
        let images = schema.children(schema.root())[3];
        let image_el = schema.children(images)[0];
        let named = |name: &str| {
            schema
                .children(image_el)
                .iter()
                .copied()
                .find(|c| schema.get(*c).name == name)
                .unwrap()
        };

        let inline = upl_doc(|_, _, _| {});
        let image = inline.find("/images/image-1");
        assert!(Validator::element_present(&schema, named("data"), image));
        assert!(!Validator::element_present(&schema, named("data-offset"), image));
        assert!(Validator::element_present(&schema, named("data-offset"), None));

        let external = upl_doc(|b, image, _| {
            b.add_property(image, "data-offset", u32_prop(0));
        });
        let image = external.find("/images/image-1");
        assert!(!Validator::element_present(&schema, named("data"), image));
        assert!(!Validator::element_present(&schema, named("data-offset"), image));
    }

    #[test]
    fn parent_relative_conditions() {
        let schema = Schema::new(Element::node(
            "/",
            vec![
                Element::bool("secure"),
                Element::node(
                    "keys",
                    vec![
                        Element::string("key").required().when_present("../secure"),
                        Element::string("hint").when_present("../../too-far"),
                    ],
                ),
            ],
        ))
        .unwrap();
        let keys = schema.children(schema.root())[1];
        let key = schema.children(keys)[0];
        let hint = schema.children(keys)[1];

        let mut b = DocumentBuilder::new();
        let root = b.root();
        b.add_node(root, "keys");
        let plain = b.build();

        let mut b = DocumentBuilder::new();
        let root = b.root();
        b.add_property(root, "secure", vec![]);
        b.add_node(root, "keys");
        let secure = b.build();

        assert!(!Validator::element_present(&schema, key, plain.find("/keys")));
        assert!(Validator::element_present(&schema, key, secure.find("/keys")));
        assert!(Validator::element_present(&schema, hint, plain.find("/keys")));

        let mut val = Validator::new(Arc::new(schema), false);
        assert!(val.validate(&plain).unwrap().is_empty());
        assert_eq!(
            messages(&val.validate(&secure).unwrap()),
            ["/keys: Required property 'key' missing"]
        );
    }

    #[test]
    fn unexpected_properties_and_subnodes() {
        let doc = upl_doc(|b, image, config| {
            b.add_property(image, "phandle", u32_prop(1));
            b.add_property(image, "linux,phandle", u32_prop(1));
            b.add_property(config, "bogus", vec![]);
            let sub = b.add_node(config, "sub");
            b.add_property(sub, "ignored", vec![]);
        });
        let mut val = upl_validator();
        let findings = messages(&val.validate(&doc).unwrap());
        assert_eq!(
            findings,
            [
                "/images/image-1: phandle target not valid for this node",
                "/configurations/config-1: Unexpected property 'bogus', valid list is \
                 (description, fdt, loadables, compatible, require-fit, firmware)",
                "/configurations/config-1: Unexpected subnode 'sub', valid list is ()",
            ]
        );
    }

    #[test]
    fn wildcard_names_and_missing_subnodes() {
        let mut b = DocumentBuilder::new();
        let root = b.root();
        b.add_property(root, "timestamp", u32_prop(1));
        b.add_property(root, "description", str_prop("d"));
        b.add_property(root, "#address-cells", u32_prop(2));
        let images = b.add_node(root, "images");
        let image = b.add_node(images, "kernel");
        for (name, value) in [
            ("description", "k"),
            ("arch", "arm"),
            ("type", "kernel"),
            ("os", "linux"),
            ("project", "p"),
        ] {
            b.add_property(image, name, str_prop(value));
        }
        b.add_property(image, "data-offset", u32_prop(0));
        b.add_property(image, "data-size", u32_prop(16));
        let doc = b.build();

        let mut val = upl_validator();
        assert_eq!(
            messages(&val.validate(&doc).unwrap()),
            [
                "/: Missing subnode 'configurations' in images",
                "/images/kernel: Node name 'kernel' does not match pattern '^image-\\d+$'",
            ]
        );
    }

    #[test]
    fn raise_on_error_stops_at_first_finding() {
        let doc = upl_doc(|b, image, config| {
            b.add_property(image, "bogus", vec![]);
            b.add_property(config, "bogus", vec![]);
        });
        let mut val = Validator::new(Arc::new(fit_schema(Variant::Upl).unwrap()), true);

        match val.validate(&doc) {
            Err(ValidationError::Aborted(f)) => {
                assert_eq!(f.location, "/images/image-1");
                assert!(f.message.starts_with("Unexpected property 'bogus'"));
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(val.errors().len(), 1);
    }

    #[test]
    fn models_are_recorded() {
        let schema = Schema::new(Element::node(
            "/",
            vec![Element::node(
                "models",
                vec![Element::model(vec![
                    Element::string("name"),
                    Element::submodel(vec![]),
                ])],
            )],
        ))
        .unwrap();

        let mut b = DocumentBuilder::new();
        let root = b.root();
        let models = b.add_node(root, "models");
        let model = b.add_node(models, "MODEL");
        b.add_property(model, "name", str_prop("coral"));
        b.add_node(model, "SUBMODEL");
        b.add_node(models, "anything");
        let doc = b.build();

        let mut val = Validator::new(Arc::new(schema), false);
        let errors: Vec<_> = val.validate(&doc).unwrap().iter().map(ToString::to_string).collect();
        assert_eq!(
            errors,
            ["/models: Unexpected subnode 'anything', valid list is (MODEL)"]
        );
        assert_eq!(val.model_list(), ["MODEL"]);
        assert_eq!(
            val.submodel_list().get("MODEL").map(Vec::as_slice),
            Some(&["SUBMODEL".to_string()][..])
        );

        val.validate(&upl_doc(|_, _, _| {})).unwrap();
        assert!(val.model_list().is_empty());
        assert!(val.submodel_list().is_empty());
    }
}
