use alloc::{collections::btree_map::BTreeMap, string::String, vec::Vec};

use crate::prop::{OtherProperty, Property, PropertyKind, RegEntry, Status};

/// A parsed device tree.
///
/// Nodes live in a flat arena indexed by node id; `phandle_map` carries
/// phandle values to arena indices. Names and opaque property payloads
/// borrow from the blob the tree was parsed from, so the blob must outlive
/// the tree.
#[derive(Debug)]
pub struct DeviceTree<'a> {
    pub root_id: usize,
    pub container: Vec<Node<'a>>,
    pub phandle_map: BTreeMap<u32, usize>,
}

/// One device tree node.
///
/// `full_name` is the name as written in the blob; `node_name`/`unit_addr`
/// are its halves around the `@` separator (`unit_addr` is empty when there
/// is none). The root's `parent_id` points at the root itself.
#[derive(Debug)]
pub struct Node<'a> {
    pub node_id: usize,
    pub parent_id: usize,
    pub full_name: &'a str,
    pub node_name: &'a str,
    pub unit_addr: &'a str,
    pub children: Vec<usize>,
    pub props: Vec<Property<'a>>,
    pub others: Vec<OtherProperty<'a>>,
}

impl<'a> Node<'a> {
    /// First recognized property of the given kind.
    pub fn prop(&self, kind: PropertyKind) -> Option<&Property<'a>> {
        self.props.iter().find(|prop| prop.kind() == kind)
    }

    /// Opaque property lookup by name.
    pub fn other(&self, name: impl AsRef<str>) -> Option<&OtherProperty<'a>> {
        let name = name.as_ref();
        self.others.iter().find(|other| other.name == name)
    }

    pub fn reg(&self) -> Option<&[RegEntry]> {
        match self.prop(PropertyKind::Reg) {
            Some(Property::Reg(entries)) => Some(entries),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<Status> {
        match self.prop(PropertyKind::Status) {
            Some(Property::Status(status)) => Some(*status),
            _ => None,
        }
    }

    pub fn compatible(&self) -> Option<&'a str> {
        match self.prop(PropertyKind::Compatible) {
            Some(Property::Compatible(value)) => Some(value),
            _ => None,
        }
    }

    pub fn addr_size_cells(&self) -> Option<(u32, u32)> {
        match self.prop(PropertyKind::AddrSizeCells) {
            Some(Property::AddrSizeCells { addr_cells, size_cells }) => {
                Some((*addr_cells, *size_cells))
            }
            _ => None,
        }
    }

    pub fn interrupt_cells(&self) -> Option<u32> {
        match self.prop(PropertyKind::InterruptCells) {
            Some(Property::InterruptCells(count)) => Some(*count),
            _ => None,
        }
    }

    pub fn phandle(&self) -> Option<u32> {
        match self.prop(PropertyKind::Phandle) {
            Some(Property::Phandle(value)) => Some(*value),
            _ => None,
        }
    }
}

impl<'a> DeviceTree<'a> {
    pub fn root(&self) -> &Node<'a> {
        &self.container[self.root_id]
    }

    pub fn is_root(&self, node: &Node) -> bool {
        self.get_parent(node).node_id == node.node_id
    }

    pub fn get_parent(&self, node: &Node) -> &Node<'a> {
        &self.container[node.parent_id]
    }

    pub fn get_children<'b>(&'b self, node: &Node) -> impl Iterator<Item = &'b Node<'a>> {
        node.children.iter().map(|x| &self.container[*x])
    }

    fn full_path(&self, node: &Node) -> String {
        if self.is_root(node) {
            return String::from("");
        } else {
            return self.full_path(self.get_parent(node)) + "/" + node.full_name;
        }
    }

    pub fn get_full_path(&self, node: &Node) -> String {
        self.full_path(node)
    }

    /// Walk a `/`-separated path from the root.
    ///
    /// Each section matches a child's full name, or its base name when the
    /// section carries no unit address.
    pub fn get_node(&self, path: impl AsRef<str>) -> Option<&Node<'a>> {
        let path_str = path.as_ref();
        let mut node = &self.container[self.root_id];
        for section in path_str.split('/') {
            if section.trim().is_empty() {
                continue;
            }
            let mut found = false;
            for subnode in self.get_children(node) {
                if subnode.full_name.eq(section)
                    || (!section.contains('@') && subnode.node_name.eq(section))
                {
                    node = subnode;
                    found = true;
                    break;
                }
            }
            if !found {
                return None;
            }
        }
        Some(node)
    }

    /// Resolve a phandle to the node that declared it.
    pub fn node_by_phandle(&self, phandle: u32) -> Option<&Node<'a>> {
        self.phandle_map.get(&phandle).map(|id| &self.container[*id])
    }
}
