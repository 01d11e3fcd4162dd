//! Schema elements.
//!
//! An [`Element`] describes one expected property or subnode. Node elements own their children,
//! so a whole schema is written as a single nested expression and then frozen into a
//! [`Schema`](crate::Schema).

use std::{fmt, sync::Arc};

use dtree::{Node, Prop, PropertyType};

use crate::{findings::Findings, schema::SchemaElement, ValidationError};

/// Name of wildcard elements.
pub const ANY: &str = "ANY";
/// Name of model container elements.
pub const MODEL: &str = "MODEL";
/// Name of submodel container elements.
pub const SUBMODEL: &str = "SUBMODEL";

type CheckFn = dyn Fn(&mut Findings, Prop<'_>) -> Result<(), ValidationError> + Send + Sync;

/// A caller-supplied property check.
#[derive(Clone)]
pub struct PropertyCheck(Arc<CheckFn>);

impl PropertyCheck {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Findings, Prop<'_>) -> Result<(), ValidationError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, findings: &mut Findings, prop: Prop<'_>) -> Result<(), ValidationError> {
        (self.0)(findings, prop)
    }
}

impl fmt::Debug for PropertyCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PropertyCheck(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Plain,
    /// A node named `MODEL`; matched nodes are collected as models.
    Model,
    /// A node named `SUBMODEL`, collected under the enclosing model.
    Submodel,
    /// Matches any node name, optionally restricted by a pattern.
    Any,
    Image,
    Config,
}

#[derive(Debug, Clone)]
pub enum ElementKind {
    String,
    /// A single 32-bit cell.
    Int,
    Timestamp,
    AddressCells,
    /// Presence only.
    Bool,
    StringList,
    /// Marks a node as something phandles may point at.
    PhandleTarget,
    Phandle {
        target_path_match: String,
    },
    Custom(PropertyCheck),
    AnyProperty(Option<PropertyCheck>),
    OneOf {
        options: Vec<Element>,
    },
    /// Any value at all.
    Opaque,
    Node(NodeKind),
}

impl ElementKind {
    pub fn is_node(&self) -> bool {
        matches!(self, ElementKind::Node(_))
    }
}

/// Declarative description of an expected property or subnode.
#[derive(Debug, Clone)]
pub struct Element {
    pub(crate) name: String,
    pub(crate) kind: ElementKind,
    pub(crate) required: bool,
    pub(crate) conditions: Vec<(String, bool)>,
    pub(crate) pattern: Option<String>,
    pub(crate) children: Vec<Element>,
}

impl Element {
    fn new(name: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            conditions: Vec::new(),
            pattern: None,
            children: Vec::new(),
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ElementKind::String)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, ElementKind::Int)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, ElementKind::Timestamp)
    }

    pub fn address_cells() -> Self {
        Self::new("#address-cells", ElementKind::AddressCells)
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, ElementKind::Bool)
    }

    pub fn string_list(name: impl Into<String>) -> Self {
        Self::new(name, ElementKind::StringList)
    }

    pub fn phandle_target() -> Self {
        Self::new("phandle", ElementKind::PhandleTarget)
    }

    /// A phandle whose target path must match `target_path_match`, where an `ANY` segment
    /// matches any single path segment.
    pub fn phandle(name: impl Into<String>, target_path_match: impl Into<String>) -> Self {
        Self::new(
            name,
            ElementKind::Phandle {
                target_path_match: target_path_match.into(),
            },
        )
    }

    pub fn custom(name: impl Into<String>, check: PropertyCheck) -> Self {
        Self::new(name, ElementKind::Custom(check))
    }

    pub fn any_property(check: Option<PropertyCheck>) -> Self {
        Self::new(ANY, ElementKind::AnyProperty(check))
    }

    pub fn one_of(name: impl Into<String>, options: Vec<Element>) -> Self {
        Self::new(name, ElementKind::OneOf { options })
    }

    pub fn opaque(name: impl Into<String>) -> Self {
        Self::new(name, ElementKind::Opaque)
    }

    pub fn node(name: impl Into<String>, children: Vec<Element>) -> Self {
        Self {
            children,
            ..Self::new(name, ElementKind::Node(NodeKind::Plain))
        }
    }

    pub fn model(children: Vec<Element>) -> Self {
        Self {
            children,
            ..Self::new(MODEL, ElementKind::Node(NodeKind::Model))
        }
    }

    pub fn submodel(children: Vec<Element>) -> Self {
        Self {
            children,
            ..Self::new(SUBMODEL, ElementKind::Node(NodeKind::Submodel))
        }
    }

    pub fn any_node(name_pattern: impl Into<String>, children: Vec<Element>) -> Self {
        Self::wildcard(NodeKind::Any, name_pattern.into(), children)
    }

    pub fn image(name_pattern: impl Into<String>, children: Vec<Element>) -> Self {
        Self::wildcard(NodeKind::Image, name_pattern.into(), children)
    }

    pub fn config(name_pattern: impl Into<String>, children: Vec<Element>) -> Self {
        Self::wildcard(NodeKind::Config, name_pattern.into(), children)
    }

    fn wildcard(kind: NodeKind, name_pattern: String, children: Vec<Element>) -> Self {
        Self {
            children,
            ..Self::new(ANY, ElementKind::Node(kind)).pattern(name_pattern)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Only expect this element when `name` is present. `../` prefixes refer to the enclosing
    /// nodes.
    pub fn when_present(mut self, name: impl Into<String>) -> Self {
        self.conditions.push((name.into(), true));
        self
    }

    /// Only expect this element when `name` is absent.
    pub fn when_absent(mut self, name: impl Into<String>) -> Self {
        self.conditions.push((name.into(), false));
        self
    }

    /// Values (or node names, for wildcard nodes) must fully match `pattern`. An empty pattern
    /// disables the check.
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        self.pattern = (!pattern.is_empty()).then_some(pattern);
        self
    }

    /// Append children, e.g. to specialise a shared node for one schema variant.
    pub fn with(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ElementKind {
        &self.kind
    }
}

/// Check that `target` lies at a path matching `template`.
///
/// Both paths must have the same number of segments; an `ANY` segment matches anything.
pub fn check_phandle_target(target: &str, template: &str) -> bool {
    let parts: Vec<_> = template.split('/').collect();
    let target: Vec<_> = target.split('/').collect();

    parts.len() == target.len()
        && parts
            .iter()
            .zip(&target)
            .all(|(part, seg)| *part == ANY || part == seg)
}

impl SchemaElement {
    /// Check a node matched by this element.
    pub(crate) fn check_node(
        &self,
        findings: &mut Findings,
        node: Node<'_>,
    ) -> Result<(), ValidationError> {
        if let Some(pattern) = &self.pattern {
            if self.is_node_wildcard() && !pattern.is_match(node.name()) {
                findings.fail(
                    node.path(),
                    format!(
                        "Node name '{}' does not match pattern '{pattern}'",
                        node.name()
                    ),
                )?;
            }
        }
        Ok(())
    }

    /// Check the value of a property matched by this element.
    pub(crate) fn check_prop(
        &self,
        findings: &mut Findings,
        prop: Prop<'_>,
    ) -> Result<(), ValidationError> {
        let location = prop.node().path();
        let name = prop.name();

        match &self.kind {
            ElementKind::String => {
                let Some(pattern) = &self.pattern else {
                    return Ok(());
                };
                // A lone NUL is the empty string.
                let value = if prop.bytes() == [0] { Some("") } else { prop.as_str() };
                match value {
                    None => {
                        findings.fail(location, format!("'{name}' value '{prop}' must be a string"))
                    }
                    Some(value) if !pattern.is_match(value) => findings.fail(
                        location,
                        format!("'{name}' value '{value}' does not match pattern '{pattern}'"),
                    ),
                    Some(_) => Ok(()),
                }
            }
            ElementKind::StringList => {
                let Some(pattern) = &self.pattern else {
                    return Ok(());
                };
                let Some(items) = prop.as_strings() else {
                    return findings
                        .fail(location, format!("'{name}' value '{prop}' must be a string"));
                };
                for item in items.into_iter().filter(|i| !pattern.is_match(i)) {
                    findings.fail(
                        location.clone(),
                        format!("'{name}' value '{item}' does not match pattern '{pattern}'"),
                    )?;
                }
                Ok(())
            }
            ElementKind::Int | ElementKind::Timestamp => {
                if prop.kind() != PropertyType::Int {
                    findings.fail(location, format!("'{name}' value '{prop}' must be a u32"))?;
                }
                Ok(())
            }
            ElementKind::AddressCells => match prop.as_u32() {
                Some(n) if prop.kind() == PropertyType::Int => {
                    if n != 1 && n != 2 {
                        findings.fail(location, format!("'{name}' value '{n}' must be 1 or 2"))?;
                    }
                    Ok(())
                }
                _ => findings.fail(location, format!("'{name}' value '{prop}' must be a u32")),
            },
            ElementKind::Phandle { target_path_match } => match prop.target() {
                None => findings.fail(
                    location,
                    format!("Phandle '{name}' value '{prop}' does not reference a node"),
                ),
                Some(target) => {
                    let path = target.path();
                    if !check_phandle_target(&path, target_path_match) {
                        findings.fail(
                            location,
                            format!(
                                "Phandle '{name}' targets node '{path}' which does not match \
                                 pattern '{target_path_match}'"
                            ),
                        )?;
                    }
                    Ok(())
                }
            },
            ElementKind::Custom(check) => check.call(findings, prop),
            ElementKind::AnyProperty(check) => match check {
                Some(check) => check.call(findings, prop),
                None => Ok(()),
            },
            ElementKind::Bool
            | ElementKind::PhandleTarget
            | ElementKind::OneOf { .. }
            | ElementKind::Opaque
            | ElementKind::Node(_) => Ok(()),
        }
    }
}
