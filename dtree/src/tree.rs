//! In-memory device tree document.
//!
//! Nodes live in an arena owned by [`Document`] and are addressed by [`NodeId`]; [`Node`] and
//! [`Prop`] are cheap borrowed handles that also know their owning document, which is what makes
//! parent lookups and phandle resolution possible.

use std::{collections::HashMap, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
struct NodeData {
    name: String,
    parent: Option<NodeId>,
    props: Vec<Property>,
    children: Vec<NodeId>,
}

/// A parsed device tree.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<NodeData>,
    phandles: HashMap<u32, NodeId>,
    memreserves: Vec<(u64, u64)>,
}

impl Document {
    pub fn root(&self) -> Node<'_> {
        self.node(NodeId(0))
    }

    pub fn node(&self, id: NodeId) -> Node<'_> {
        Node { doc: self, id }
    }

    /// Find the node a phandle value refers to.
    pub fn lookup_phandle(&self, phandle: u32) -> Option<Node<'_>> {
        self.phandles.get(&phandle).map(|id| self.node(*id))
    }

    /// Find a node by its absolute path.
    pub fn find(&self, path: &str) -> Option<Node<'_>> {
        path.split('/')
            .filter(|part| !part.is_empty())
            .try_fold(self.root(), |node, part| node.subnode(part))
    }

    /// Memory reservation entries as `(address, size)` pairs.
    pub fn memreserves(&self) -> &[(u64, u64)] {
        &self.memreserves
    }
}

/// Incrementally assembles a [`Document`], parents before children.
#[derive(Debug)]
pub struct DocumentBuilder {
    nodes: Vec<NodeData>,
    memreserves: Vec<(u64, u64)>,
}

impl DocumentBuilder {
    /// Start a document containing only the root node.
    pub fn new() -> Self {
        Self {
            nodes: vec![NodeData {
                name: "/".into(),
                parent: None,
                props: Vec::new(),
                children: Vec::new(),
            }],
            memreserves: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn add_node(&mut self, parent: NodeId, name: impl Into<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeData {
            name: name.into(),
            parent: Some(parent),
            props: Vec::new(),
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn add_property(&mut self, node: NodeId, name: impl Into<String>, value: Vec<u8>) {
        self.nodes[node.0].props.push(Property {
            name: name.into(),
            value,
        });
    }

    pub fn add_memreserve(&mut self, address: u64, size: u64) {
        self.memreserves.push((address, size));
    }

    /// Finish the document, indexing every node carrying a `phandle` or `linux,phandle`.
    pub fn build(self) -> Document {
        let mut phandles = HashMap::new();

        for (i, node) in self.nodes.iter().enumerate() {
            for prop in &node.props {
                if prop.name != "phandle" && prop.name != "linux,phandle" {
                    continue;
                }
                if let Ok(cell) = <[u8; 4]>::try_from(prop.value.as_slice()) {
                    phandles.entry(u32::from_be_bytes(cell)).or_insert(NodeId(i));
                }
            }
        }

        Document {
            nodes: self.nodes,
            phandles,
            memreserves: self.memreserves,
        }
    }
}

impl Default for DocumentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A node of a [`Document`].
#[derive(Clone, Copy)]
pub struct Node<'a> {
    doc: &'a Document,
    id: NodeId,
}

impl<'a> Node<'a> {
    fn data(&self) -> &'a NodeData {
        &self.doc.nodes[self.id.0]
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn document(&self) -> &'a Document {
        self.doc
    }

    /// Node name including its unit-address; the root node is named `/`.
    pub fn name(&self) -> &'a str {
        &self.data().name
    }

    pub fn is_root(&self) -> bool {
        self.data().parent.is_none()
    }

    pub fn parent(&self) -> Option<Node<'a>> {
        self.data().parent.map(|id| self.doc.node(id))
    }

    /// Absolute path of the node, `/` for the root.
    pub fn path(&self) -> String {
        match self.parent() {
            None => "/".into(),
            Some(parent) if parent.is_root() => format!("/{}", self.name()),
            Some(parent) => format!("{}/{}", parent.path(), self.name()),
        }
    }

    /// Child nodes in document order.
    pub fn subnodes(&self) -> impl Iterator<Item = Node<'a>> + 'a {
        let doc = self.doc;
        self.data().children.iter().map(move |id| doc.node(*id))
    }

    pub fn subnode(&self, name: &str) -> Option<Node<'a>> {
        self.subnodes().find(|n| n.name() == name)
    }

    pub fn props(&self) -> impl Iterator<Item = Prop<'a>> + 'a {
        let node = *self;
        self.data().props.iter().map(move |prop| Prop { node, prop })
    }

    pub fn prop(&self, name: &str) -> Option<Prop<'a>> {
        self.props().find(|p| p.name() == name)
    }

    pub fn has_prop(&self, name: &str) -> bool {
        self.data().props.iter().any(|p| p.name == name)
    }
}

impl PartialEq for Node<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.doc, other.doc) && self.id == other.id
    }
}

impl fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Node").field(&self.path()).finish()
    }
}

/// How the bytes of a property value read, following the usual flattened-tree heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    /// No value at all, i.e. a boolean property.
    Empty,
    String,
    StringList,
    /// Exactly one 32-bit cell.
    Int,
    /// Two or more 32-bit cells.
    Cells,
    Bytes,
}

impl PropertyType {
    pub fn of(value: &[u8]) -> Self {
        if value.is_empty() {
            return PropertyType::Empty;
        }
        match printable_strings(value) {
            Some(1) => return PropertyType::String,
            Some(_) => return PropertyType::StringList,
            None => {}
        }
        match value.len() {
            4 => PropertyType::Int,
            n if n % 4 == 0 => PropertyType::Cells,
            _ => PropertyType::Bytes,
        }
    }
}

/// Number of strings if `value` is a list of non-empty, printable, NUL-terminated strings.
fn printable_strings(value: &[u8]) -> Option<usize> {
    let body = value.strip_suffix(&[0])?;
    let mut count = 0;
    for s in body.split(|b| *b == 0) {
        if s.is_empty() || s.iter().any(|b| !(32..=127).contains(b)) {
            return None;
        }
        count += 1;
    }
    Some(count)
}

/// A property of a [`Node`].
#[derive(Clone, Copy)]
pub struct Prop<'a> {
    node: Node<'a>,
    prop: &'a Property,
}

impl<'a> Prop<'a> {
    pub fn name(&self) -> &'a str {
        &self.prop.name
    }

    /// The node owning this property.
    pub fn node(&self) -> Node<'a> {
        self.node
    }

    pub fn bytes(&self) -> &'a [u8] {
        &self.prop.value
    }

    pub fn kind(&self) -> PropertyType {
        PropertyType::of(self.bytes())
    }

    /// The value as a single string.
    pub fn as_str(&self) -> Option<&'a str> {
        match self.kind() {
            PropertyType::String => std::str::from_utf8(&self.bytes()[..self.bytes().len() - 1]).ok(),
            _ => None,
        }
    }

    /// The value as a list of strings; an empty property is an empty list.
    pub fn as_strings(&self) -> Option<Vec<&'a str>> {
        match self.kind() {
            PropertyType::Empty => Some(Vec::new()),
            PropertyType::String | PropertyType::StringList => {
                let bytes = self.bytes();
                bytes[..bytes.len() - 1]
                    .split(|b| *b == 0)
                    .map(|s| std::str::from_utf8(s).ok())
                    .collect()
            }
            _ => None,
        }
    }

    /// The value as a single big-endian 32-bit cell.
    pub fn as_u32(&self) -> Option<u32> {
        <[u8; 4]>::try_from(self.bytes()).ok().map(u32::from_be_bytes)
    }

    /// The value as a sequence of big-endian 32-bit cells.
    pub fn cells(&self) -> Option<Vec<u32>> {
        let bytes = self.bytes();
        if bytes.len() % 4 != 0 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    /// Resolve the value as a phandle to the node it points to.
    pub fn target(&self) -> Option<Node<'a>> {
        self.as_u32()
            .and_then(|phandle| self.node.doc.lookup_phandle(phandle))
    }
}

/// Formats the value the way it would be written in source, without delimiters for strings.
impl fmt::Display for Prop<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            PropertyType::Empty => Ok(()),
            PropertyType::String | PropertyType::StringList => {
                let strings = self.as_strings().unwrap_or_default();
                write!(f, "{}", strings.join("\", \""))
            }
            PropertyType::Int | PropertyType::Cells => {
                let cells = self.cells().unwrap_or_default();
                let cells: Vec<_> = cells.iter().map(|c| format!("{c:#x}")).collect();
                write!(f, "<{}>", cells.join(" "))
            }
            PropertyType::Bytes => {
                let bytes: Vec<_> = self.bytes().iter().map(|b| format!("{b:02x}")).collect();
                write!(f, "[{}]", bytes.join(" "))
            }
        }
    }
}

impl fmt::Debug for Prop<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prop")
            .field("node", &self.node.path())
            .field("name", &self.name())
            .field("value", &self.prop.value)
            .finish()
    }
}
