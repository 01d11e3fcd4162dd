//! Devicetree source compiler.
//!
//! Applies the statements of one or more source files to a mutable tree, in order, then freezes
//! that tree into a [`Document`] with the same layout `dtc` would emit.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, trace, warn};

use crate::{
    ast::{Include, Node, NodeId, NodeItem, Property, PropertyCell, PropertyValue, Reference, RootItem},
    parser,
    tree::{Document, DocumentBuilder},
    Error,
};

/// Nesting limit for `/include/`, guarding against include cycles.
const MAX_INCLUDE_DEPTH: usize = 32;

/// Compile source text. Relative `/include/` and `/incbin/` paths are resolved against `base_dir`.
pub fn compile_str(source: &str, base_dir: impl Into<PathBuf>) -> Result<Document, Error> {
    let mut tree = Tree::new(base_dir.into());
    tree.apply_source("<string>", source)?;
    tree.freeze()
}

/// Compile a source file.
pub fn compile_file(path: impl AsRef<Path>) -> Result<Document, Error> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut tree = Tree::new(base_dir);
    tree.apply_source(&path.display().to_string(), &source)?;
    tree.freeze()
}

/// One piece of a property value; references are resolved when the tree is frozen.
#[derive(Debug, Clone)]
enum Chunk {
    Bytes(Vec<u8>),
    Phandle(String),
    Path(String),
}

#[derive(Debug)]
struct TreeProp {
    name: String,
    chunks: Vec<Chunk>,
}

#[derive(Debug)]
struct TreeNode {
    name: String,
    parent: Option<usize>,
    props: Vec<TreeProp>,
    children: Vec<usize>,
    deleted: bool,
    omit_if_no_ref: bool,
}

#[derive(Debug)]
struct Tree {
    nodes: Vec<TreeNode>,
    labels: HashMap<String, usize>,
    memreserves: Vec<(u64, u64)>,
    dirs: Vec<PathBuf>,
}

impl Tree {
    fn new(base_dir: PathBuf) -> Self {
        Self {
            nodes: vec![TreeNode {
                name: "/".into(),
                parent: None,
                props: Vec::new(),
                children: Vec::new(),
                deleted: false,
                omit_if_no_ref: false,
            }],
            labels: HashMap::new(),
            memreserves: Vec::new(),
            dirs: vec![base_dir],
        }
    }

    fn base_dir(&self) -> &Path {
        self.dirs.last().map(PathBuf::as_path).unwrap_or(Path::new(""))
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir().join(path)
        }
    }

    fn apply_source(&mut self, file: &str, source: &str) -> Result<(), Error> {
        let dts = parser::parse_dts(file, source)?;
        debug!(file, items = dts.items.len(), "parsed source");

        for item in dts.items {
            match item {
                RootItem::Version(_) => {}
                RootItem::Include(inc) => self.include(inc, None)?,
                RootItem::MemReserve((address, size)) => self.memreserves.push((address, size)),
                RootItem::Node(node) => {
                    let target = match &node.id {
                        NodeId::Ref(r) => self.resolve(r)?,
                        NodeId::Name(..) => 0,
                    };
                    self.merge(target, node)?;
                }
                RootItem::DeleteNode(id) => {
                    let target = self.resolve_id(&id)?;
                    self.delete(target);
                }
                RootItem::OmitNode(id) => {
                    let target = self.resolve_id(&id)?;
                    self.nodes[target].omit_if_no_ref = true;
                }
            }
        }

        Ok(())
    }

    /// Splice another source file in, at the top level or inside the body of `node`.
    fn include(&mut self, inc: Include, node: Option<usize>) -> Result<(), Error> {
        let file = match inc {
            Include::Dts(file) => file,
            Include::C(file) => return Err(Error::Preprocessor(file.to_string())),
        };
        if self.dirs.len() > MAX_INCLUDE_DEPTH {
            return Err(Error::Value(format!("includes nested too deeply at '{file}'")));
        }

        let path = self.resolve_path(file);
        let source = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let name = path.display().to_string();
        debug!(file = %name, "including source");

        self.dirs
            .push(path.parent().map(Path::to_path_buf).unwrap_or_default());
        let res = match node {
            None => self.apply_source(&name, &source),
            Some(node) => parser::parse_node_contents(&name, &source)
                .and_then(|items| self.merge_contents(node, items)),
        };
        self.dirs.pop();
        res
    }

    fn resolve_id(&self, id: &NodeId) -> Result<usize, Error> {
        match id {
            NodeId::Ref(r) => self.resolve(r),
            NodeId::Name(..) => {
                let name = id.full_name();
                self.child(0, &name)
                    .ok_or(Error::UnresolvedReference(name))
            }
        }
    }

    /// Find the node a label or path reference points to.
    fn resolve(&self, r: &Reference) -> Result<usize, Error> {
        let found = if r.is_path() {
            r.0.split('/')
                .filter(|part| !part.is_empty())
                .try_fold(0, |node, part| self.child(node, part))
        } else {
            self.labels
                .get(r.0)
                .copied()
                .filter(|n| self.is_live(*n))
        };
        found.ok_or_else(|| Error::UnresolvedReference(r.0.to_string()))
    }

    fn child(&self, parent: usize, name: &str) -> Option<usize> {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|c| !self.nodes[*c].deleted && self.nodes[*c].name == name)
    }

    /// A node is live if neither it nor any of its ancestors was deleted.
    fn is_live(&self, mut node: usize) -> bool {
        loop {
            if self.nodes[node].deleted {
                return false;
            }
            match self.nodes[node].parent {
                Some(parent) => node = parent,
                None => return true,
            }
        }
    }

    fn delete(&mut self, node: usize) {
        self.nodes[node].deleted = true;
        self.labels.retain(|_, n| *n != node);
    }

    fn add_child(&mut self, parent: usize, name: String) -> usize {
        let id = self.nodes.len();
        self.nodes.push(TreeNode {
            name,
            parent: Some(parent),
            props: Vec::new(),
            children: Vec::new(),
            deleted: false,
            omit_if_no_ref: false,
        });
        self.nodes[parent].children.push(id);
        id
    }

    fn add_label(&mut self, label: &str, node: usize) -> Result<(), Error> {
        match self.labels.insert(label.to_string(), node) {
            Some(prev) if prev != node && self.is_live(prev) => {
                Err(Error::DuplicateLabel(label.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Merge a parsed node into an existing tree node.
    fn merge(&mut self, target: usize, node: Node) -> Result<(), Error> {
        for label in &node.labels {
            self.add_label(label, target)?;
        }
        if node.omit_if_no_ref {
            self.nodes[target].omit_if_no_ref = true;
        }
        self.merge_contents(target, node.contents)
    }

    fn merge_contents(&mut self, target: usize, items: Vec<NodeItem>) -> Result<(), Error> {
        for item in items {
            match item {
                NodeItem::Property(prop) => self.set_property(target, prop)?,
                NodeItem::Node(child) => {
                    let name = child.id.full_name();
                    let id = match self.child(target, &name) {
                        Some(id) => id,
                        None => self.add_child(target, name),
                    };
                    self.merge(id, child)?;
                }
                NodeItem::Include(inc) => self.include(inc, Some(target))?,
                NodeItem::DeleteProperty(name) => {
                    self.nodes[target].props.retain(|p| p.name != name);
                }
                NodeItem::DeleteNode(id) => {
                    let found = match &id {
                        NodeId::Ref(r) => self.resolve(r).ok(),
                        NodeId::Name(..) => self.child(target, &id.full_name()),
                    };
                    match found {
                        Some(node) => self.delete(node),
                        None => trace!(node = %id.full_name(), "nothing to delete"),
                    }
                }
            }
        }
        Ok(())
    }

    /// Set a property, replacing the value in place if it already exists.
    fn set_property(&mut self, node: usize, prop: Property) -> Result<(), Error> {
        let chunks = match &prop.value {
            Some(values) => values
                .iter()
                .map(|v| self.encode(prop.name, v))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .flatten()
                .collect(),
            None => Vec::new(),
        };

        let props = &mut self.nodes[node].props;
        match props.iter_mut().find(|p| p.name == prop.name) {
            Some(existing) => existing.chunks = chunks,
            None => props.push(TreeProp {
                name: prop.name.to_string(),
                chunks,
            }),
        }
        Ok(())
    }

    fn encode(&self, prop: &str, value: &PropertyValue) -> Result<Vec<Chunk>, Error> {
        Ok(match value {
            PropertyValue::Str(s) => {
                let mut bytes = unescape(s).into_bytes();
                bytes.push(0);
                vec![Chunk::Bytes(bytes)]
            }
            PropertyValue::Ref(r) => vec![Chunk::Path(r.0.to_string())],
            PropertyValue::Bytestring(bytes) => vec![Chunk::Bytes(bytes.clone())],
            PropertyValue::CellArray(cells) => self.encode_cells(prop, 32, cells)?,
            PropertyValue::Bits(bits, cells) => self.encode_cells(prop, *bits, cells)?,
            PropertyValue::Incbin { path, range } => {
                let path = self.resolve_path(path);
                let data = fs::read(&path).map_err(|e| Error::io(&path, e))?;
                let data = match range {
                    None => data,
                    Some((offset, len)) => {
                        let offset = offset.eval()? as usize;
                        let len = len.eval()? as usize;
                        data.get(offset..offset.saturating_add(len))
                            .ok_or_else(|| {
                                Error::Value(format!(
                                    "/incbin/ range {offset}+{len} is outside '{}'",
                                    path.display()
                                ))
                            })?
                            .to_vec()
                    }
                };
                vec![Chunk::Bytes(data)]
            }
        })
    }

    fn encode_cells(
        &self,
        prop: &str,
        bits: u32,
        cells: &[PropertyCell],
    ) -> Result<Vec<Chunk>, Error> {
        if ![8, 16, 32, 64].contains(&bits) {
            return Err(Error::BitsSize(bits));
        }

        let mut chunks = Vec::new();
        let mut bytes = Vec::new();
        for cell in cells {
            match cell {
                PropertyCell::Expr(expr) => {
                    let v = expr.eval()?;
                    let width = bits / 8;
                    if bits < 64 && v >> bits != 0 && v >> (bits - 1) != u64::MAX >> (bits - 1) {
                        warn!(prop, value = v, bits, "value truncated to fit the cell size");
                    }
                    bytes.extend_from_slice(&v.to_be_bytes()[(8 - width as usize)..]);
                }
                PropertyCell::Ref(r) if bits == 32 => {
                    if !bytes.is_empty() {
                        chunks.push(Chunk::Bytes(std::mem::take(&mut bytes)));
                    }
                    chunks.push(Chunk::Phandle(r.0.to_string()));
                }
                PropertyCell::Ref(r) => {
                    return Err(Error::Value(format!(
                        "phandle reference '&{}' in '{prop}' requires 32-bit cells",
                        r.0
                    )))
                }
            }
        }
        if !bytes.is_empty() {
            chunks.push(Chunk::Bytes(bytes));
        }
        Ok(chunks)
    }

    fn path_of(&self, node: usize) -> String {
        match self.nodes[node].parent {
            None => "/".into(),
            Some(0) => format!("/{}", self.nodes[node].name),
            Some(parent) => format!("{}/{}", self.path_of(parent), self.nodes[node].name),
        }
    }

    /// Live nodes in document order, skipping `/omit-if-no-ref/` nodes nobody references.
    fn emitted(&self, referenced: &HashSet<usize>) -> Vec<usize> {
        let mut order = Vec::new();
        let mut stack = vec![0];
        while let Some(node) = stack.pop() {
            let data = &self.nodes[node];
            if data.deleted || (data.omit_if_no_ref && !referenced.contains(&node)) {
                continue;
            }
            order.push(node);
            stack.extend(data.children.iter().rev());
        }
        order
    }

    fn freeze(mut self) -> Result<Document, Error> {
        // References made outside omittable nodes decide which of them survive.
        let mut referenced = HashSet::new();
        for node in self.emitted(&HashSet::new()) {
            for chunk in self.nodes[node].props.iter().flat_map(|p| &p.chunks) {
                if let Chunk::Phandle(r) | Chunk::Path(r) = chunk {
                    referenced.insert(self.resolve(&Reference(r.as_str()))?);
                }
            }
        }
        let order = self.emitted(&referenced);

        let mut phandle_targets = Vec::new();
        for &node in &order {
            for chunk in self.nodes[node].props.iter().flat_map(|p| &p.chunks) {
                if let Chunk::Phandle(r) = chunk {
                    phandle_targets.push(self.resolve(&Reference(r.as_str()))?);
                }
            }
        }

        let phandles = self.assign_phandles(&phandle_targets, &order);

        let mut builder = DocumentBuilder::new();
        let mut ids = HashMap::new();
        for &node in &order {
            let id = match self.nodes[node].parent {
                None => builder.root(),
                Some(parent) => builder.add_node(ids[&parent], self.nodes[node].name.clone()),
            };
            ids.insert(node, id);

            for prop in &self.nodes[node].props {
                let mut value = Vec::new();
                for chunk in &prop.chunks {
                    match chunk {
                        Chunk::Bytes(bytes) => value.extend_from_slice(bytes),
                        Chunk::Phandle(r) => {
                            let target = self.resolve(&Reference(r.as_str()))?;
                            let phandle = phandles.get(&target).copied().unwrap_or_default();
                            value.extend_from_slice(&phandle.to_be_bytes());
                        }
                        Chunk::Path(r) => {
                            let target = self.resolve(&Reference(r.as_str()))?;
                            value.extend_from_slice(self.path_of(target).as_bytes());
                            value.push(0);
                        }
                    }
                }
                builder.add_property(id, prop.name.clone(), value);
            }
        }
        for (address, size) in self.memreserves.drain(..) {
            builder.add_memreserve(address, size);
        }

        debug!(nodes = order.len(), phandles = phandles.len(), "compiled tree");
        Ok(builder.build())
    }

    /// Give every phandle target a phandle, adding a `phandle` property where none was written.
    fn assign_phandles(&mut self, targets: &[usize], order: &[usize]) -> HashMap<usize, u32> {
        let explicit = |node: &TreeNode| {
            node.props
                .iter()
                .find(|p| p.name == "phandle" || p.name == "linux,phandle")
                .and_then(|p| match p.chunks.as_slice() {
                    [Chunk::Bytes(b)] => <[u8; 4]>::try_from(b.as_slice()).ok(),
                    _ => None,
                })
                .map(u32::from_be_bytes)
        };

        let mut phandles = HashMap::new();
        let mut taken = BTreeSet::new();
        for &node in order {
            if let Some(phandle) = explicit(&self.nodes[node]) {
                phandles.insert(node, phandle);
                taken.insert(phandle);
            }
        }

        let mut next = 1;
        for &target in targets {
            if phandles.contains_key(&target) {
                continue;
            }
            while taken.contains(&next) {
                next += 1;
            }
            taken.insert(next);
            phandles.insert(target, next);
            self.nodes[target].props.push(TreeProp {
                name: "phandle".into(),
                chunks: vec![Chunk::Bytes(next.to_be_bytes().to_vec())],
            });
            trace!(node = %self.path_of(target), phandle = next, "assigned phandle");
        }
        phandles
    }
}

/// Replace C escape sequences in a string literal.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('v') => out.push('\x0b'),
            Some('f') => out.push('\x0c'),
            Some('x') => {
                let mut code = 0u32;
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(16)) {
                        Some(d) => {
                            code = code * 16 + d;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(code).unwrap_or('\0'));
            }
            Some(d @ '0'..='7') => {
                let mut code = d.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(d) => {
                            code = code * 8 + d;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(code).unwrap_or('\0'));
            }
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
