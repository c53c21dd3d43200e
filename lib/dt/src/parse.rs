//! Builds a [DeviceTree] from an FDT blob.
//!
//! Construction runs in two passes. The first walks the node hierarchy,
//! decoding every recognized property and registering phandles; raw
//! `interrupt-map` payloads are set aside because they may name phandles of
//! nodes the walk has not reached yet. The second pass resolves those
//! deferred maps against the completed phandle index. Any failure in either
//! pass drops all partially built state.

use alloc::{collections::btree_map::BTreeMap, string::String, vec::Vec};

use crate::error::DtError;
use crate::fdt::{
    Fdt, RawProperty,
    reader::{ADDRESS_CELLS_DEFAULT, SIZE_CELLS_DEFAULT},
};
use crate::node::{DeviceTree, Node};
use crate::prop::{
    IntDescriptor, InterruptMapEntry, OtherProperty, Polarity, Property, RangeEntry, RegEntry,
    SpecifierMapEntry, Status, TriggerMode,
};
use utils::endian::{BigEndian32, EndianData};

/// Cursor over a property payload, consumed as 32-bit big-endian cells.
pub(crate) struct Cells<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cells<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Result<Cells<'a>, DtError> {
        if data.len() % 4 != 0 {
            return Err(DtError::MalformedProperty);
        }
        Ok(Cells { data, pos: 0 })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn next_word(&mut self) -> Result<u32, DtError> {
        let end = self.pos + 4;
        if end > self.data.len() {
            return Err(DtError::OutOfBounds);
        }
        let word = BigEndian32::from_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ])
        .value();
        self.pos = end;
        Ok(word)
    }

    /// Fold `n` cells into a `u64`, most significant word first.
    ///
    /// Each word after the first is folded in as
    /// `acc = (acc << (64 / n)) | word`; the shift width splits the 64-bit
    /// result evenly across the cells. `n == 0` yields 0 without consuming
    /// anything (a context may legitimately declare zero cells).
    pub(crate) fn next_cells(&mut self, n: u32) -> Result<u64, DtError> {
        if n == 0 {
            return Ok(0);
        }
        let end = (n as usize)
            .checked_mul(4)
            .and_then(|bytes| self.pos.checked_add(bytes))
            .ok_or(DtError::OutOfBounds)?;
        if end > self.data.len() {
            return Err(DtError::OutOfBounds);
        }
        if n == 1 {
            return Ok(self.next_word()? as u64);
        }
        let shift = 64 / n;
        let mut acc = 0u64;
        for _ in 0..n {
            acc = acc << shift | self.next_word()? as u64;
        }
        Ok(acc)
    }
}

fn push<T>(list: &mut Vec<T>, value: T) -> Result<(), DtError> {
    list.try_reserve(1)?;
    list.push(value);
    Ok(())
}

/// View a payload as a string, up to its NUL terminator.
fn prop_string(data: &[u8]) -> Result<&str, DtError> {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    core::str::from_utf8(&data[..end]).map_err(|_| DtError::MalformedProperty)
}

fn parse_u32(data: &[u8]) -> Result<u32, DtError> {
    if data.len() != 4 {
        return Err(DtError::MalformedProperty);
    }
    Ok(BigEndian32::from_bytes([data[0], data[1], data[2], data[3]]).value())
}

fn parse_u32_list(data: &[u8]) -> Result<Vec<u32>, DtError> {
    let mut cells = Cells::new(data)?;
    let mut list = Vec::new();
    list.try_reserve(data.len() / 4)?;
    while !cells.is_empty() {
        list.push(cells.next_word()?);
    }
    Ok(list)
}

fn parse_reg(data: &[u8], addr_cells: u32, size_cells: u32) -> Result<Vec<RegEntry>, DtError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let entry_size = (addr_cells + size_cells) as usize * 4;
    if entry_size == 0 || data.len() % entry_size != 0 {
        return Err(DtError::MalformedProperty);
    }
    let mut cells = Cells::new(data)?;
    let mut entries = Vec::new();
    entries.try_reserve(data.len() / entry_size)?;
    while !cells.is_empty() {
        let address = cells.next_cells(addr_cells)?;
        let size = cells.next_cells(size_cells)?;
        entries.push(RegEntry { address, size });
    }
    Ok(entries)
}

fn parse_ranges(
    data: &[u8],
    child_addr_cells: u32,
    parent_addr_cells: u32,
    size_cells: u32,
) -> Result<Vec<RangeEntry>, DtError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let entry_size = (child_addr_cells + parent_addr_cells + size_cells) as usize * 4;
    if entry_size == 0 || data.len() % entry_size != 0 {
        return Err(DtError::MalformedProperty);
    }
    let mut cells = Cells::new(data)?;
    let mut entries = Vec::new();
    entries.try_reserve(data.len() / entry_size)?;
    while !cells.is_empty() {
        let child_bus_address = cells.next_cells(child_addr_cells)?;
        let parent_bus_address = cells.next_cells(parent_addr_cells)?;
        let size = cells.next_cells(size_cells)?;
        entries.push(RangeEntry { child_bus_address, parent_bus_address, size });
    }
    Ok(entries)
}

/// Split a `model` value at its manufacturer,model separator.
fn parse_model(data: &[u8]) -> Result<(&str, &str), DtError> {
    prop_string(data)?.split_once(',').ok_or(DtError::MalformedProperty)
}

fn parse_specifier_map(data: &[u8], cells: u32) -> Result<Vec<SpecifierMapEntry>, DtError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    // one entry is child[cells], parent phandle, parent[cells]
    let entry_size = (2 * cells + 1) as usize * 4;
    if cells == 0 || data.len() % entry_size != 0 {
        return Err(DtError::MalformedProperty);
    }
    let mut cursor = Cells::new(data)?;
    let mut entries = Vec::new();
    entries.try_reserve(data.len() / entry_size)?;
    while !cursor.is_empty() {
        let child_specifier = cursor.next_cells(cells)?;
        let specifier_parent = cursor.next_word()?;
        let parent_specifier = cursor.next_cells(cells)?;
        entries.push(SpecifierMapEntry { child_specifier, specifier_parent, parent_specifier });
    }
    Ok(entries)
}

fn parse_int_descriptor(cursor: &mut Cells<'_>) -> Result<IntDescriptor, DtError> {
    let is_ppi = cursor.next_word()? != 0;
    let id = cursor.next_word()? + if is_ppi { 16 } else { 32 };
    let flags = cursor.next_word()?;
    let (polarity, trigger_mode) = match flags & 0xF {
        1 => (Polarity::High, TriggerMode::Edge),
        2 => (Polarity::Low, TriggerMode::Edge),
        4 => (Polarity::High, TriggerMode::Level),
        8 => (Polarity::Low, TriggerMode::Level),
        _ => {
            log::warn!(
                "devicetree: unrecognized polarity/trigger-mode information of interrupt"
            );
            return Err(DtError::UnrecognizedInterruptFlags { flags });
        }
    };
    Ok(IntDescriptor { id, polarity, trigger_mode })
}

/// An `interrupt-map` payload held back for the resolver pass.
struct DeferredInterruptMap<'a> {
    node_id: usize,
    node_off: usize,
    data: &'a [u8],
}

/// Per-node scratch state while its property list is being decoded.
struct NodeScratch<'a> {
    props: Vec<Property<'a>>,
    others: Vec<OtherProperty<'a>>,
    addr_cells: Option<u32>,
    size_cells: Option<u32>,
}

struct TreeBuilder<'a, 'f> {
    fdt: &'f Fdt<'a>,
    container: Vec<Node<'a>>,
    phandle_map: BTreeMap<u32, usize>,
    deferred: Vec<DeferredInterruptMap<'a>>,
}

impl<'a> TreeBuilder<'a, '_> {
    /// Cell context a node's `reg`/`ranges` inherit from its parent.
    fn parent_cells(&self, parent_off: Option<usize>) -> Result<(u32, u32), DtError> {
        match parent_off {
            Some(off) => Ok((self.fdt.address_cells(off)?, self.fdt.size_cells(off)?)),
            None => Ok((ADDRESS_CELLS_DEFAULT, SIZE_CELLS_DEFAULT)),
        }
    }

    fn parse_node(
        &mut self,
        node_off: usize,
        parent_id: usize,
        parent_off: Option<usize>,
    ) -> Result<usize, DtError> {
        let fdt = self.fdt;
        let full_name = fdt.node_name(node_off)?;
        let (node_name, unit_addr) = match full_name.split_once('@') {
            Some((base, unit)) => (base, unit),
            None => (full_name, ""),
        };

        let node_id = self.container.len();
        self.container.try_reserve(1)?;
        self.container.push(Node {
            node_id,
            parent_id,
            full_name,
            node_name,
            unit_addr,
            children: Vec::new(),
            props: Vec::new(),
            others: Vec::new(),
        });

        let mut scratch = NodeScratch {
            props: Vec::new(),
            others: Vec::new(),
            addr_cells: None,
            size_cells: None,
        };
        for prop in fdt.properties(node_off)? {
            self.parse_prop(node_id, node_off, parent_off, node_name, prop?, &mut scratch)?;
        }

        match (scratch.addr_cells, scratch.size_cells) {
            (Some(addr_cells), Some(size_cells)) => {
                push(&mut scratch.props, Property::AddrSizeCells { addr_cells, size_cells })?;
            }
            (Some(_), None) => {
                log::warn!(
                    "devicetree: node {full_name} has #address-cells prop but no #size-cells prop"
                );
                return Err(DtError::MissingCompanionCellsProperty);
            }
            (None, Some(_)) => {
                log::warn!(
                    "devicetree: node {full_name} has #size-cells prop but no #address-cells prop"
                );
                return Err(DtError::MissingCompanionCellsProperty);
            }
            (None, None) => {}
        }

        let mut children = Vec::new();
        for subnode in fdt.subnodes(node_off)? {
            let child_id = self.parse_node(subnode?, node_id, Some(node_off))?;
            push(&mut children, child_id)?;
        }

        let node = &mut self.container[node_id];
        node.props = scratch.props;
        node.others = scratch.others;
        node.children = children;
        Ok(node_id)
    }

    fn parse_prop(
        &mut self,
        node_id: usize,
        node_off: usize,
        parent_off: Option<usize>,
        node_name: &'a str,
        prop: RawProperty<'a>,
        scratch: &mut NodeScratch<'a>,
    ) -> Result<(), DtError> {
        let fdt = self.fdt;
        let data = prop.data;
        match prop.name {
            "compatible" => {
                push(&mut scratch.props, Property::Compatible(prop_string(data)?))?;
            }
            "reg" => {
                let (addr_cells, size_cells) = self.parent_cells(parent_off)?;
                push(&mut scratch.props, Property::Reg(parse_reg(data, addr_cells, size_cells)?))?;
            }
            "ranges" | "dma-ranges" => {
                let (parent_addr_cells, _) = self.parent_cells(parent_off)?;
                let child_addr_cells = fdt.address_cells(node_off)?;
                let size_cells = fdt.size_cells(node_off)?;
                let entries =
                    parse_ranges(data, child_addr_cells, parent_addr_cells, size_cells)?;
                let parsed = if prop.name == "ranges" {
                    Property::Ranges(entries)
                } else {
                    Property::DmaRanges(entries)
                };
                push(&mut scratch.props, parsed)?;
            }
            "model" => {
                let (manufacturer, model) = parse_model(data)?;
                push(&mut scratch.props, Property::Model { manufacturer, model })?;
            }
            "status" => {
                let status =
                    Status::from_value(prop_string(data)?).ok_or(DtError::MalformedProperty)?;
                push(&mut scratch.props, Property::Status(status))?;
            }
            "phandle" | "linux,phandle" => {
                let phandle = parse_u32(data)?;
                push(&mut scratch.props, Property::Phandle(phandle))?;
                // duplicate phandle values are not rejected; the last
                // declaration in blob order wins
                self.phandle_map.insert(phandle, node_id);
            }
            "#address-cells" => {
                let count = parse_u32(data)?;
                if count == 0 {
                    return Err(DtError::MalformedProperty);
                }
                scratch.addr_cells = Some(count);
            }
            "#size-cells" => {
                scratch.size_cells = Some(parse_u32(data)?);
            }
            "virtual-reg" => {
                push(&mut scratch.props, Property::VirtualReg(parse_u32(data)?))?;
            }
            "dma-coherent" => {
                push(&mut scratch.props, Property::DmaCoherent)?;
            }
            "interrupts" => {
                push(&mut scratch.props, Property::Interrupts(parse_u32_list(data)?))?;
            }
            "interrupt-parent" => {
                push(&mut scratch.props, Property::InterruptParent(parse_u32(data)?))?;
            }
            "#interrupt-cells" => {
                push(&mut scratch.props, Property::InterruptCells(parse_u32(data)?))?;
            }
            "interrupt-map" => {
                push(&mut self.deferred, DeferredInterruptMap { node_id, node_off, data })?;
            }
            "interrupt-map-mask" => {
                // as wide as the node's address plus interrupt cells
                push(&mut scratch.props, Property::InterruptMapMask(parse_u32_list(data)?))?;
            }
            name if name.ends_with("-map") => {
                let Some(parent_off) = parent_off else {
                    return Ok(());
                };
                let mut key = String::new();
                key.try_reserve("#-cells".len() + node_name.len())?;
                key.push('#');
                key.push_str(node_name);
                key.push_str("-cells");
                let cells = match fdt.cells(parent_off, &key) {
                    Ok(Some(cells)) => cells,
                    // no usable cells prop on the parent, so we assume this
                    // isn't a specifier-map prop
                    Ok(None) | Err(_) => return Ok(()),
                };
                let entries = parse_specifier_map(data, cells)?;
                if !entries.is_empty() {
                    push(&mut scratch.props, Property::SpecifierMap { name: prop.name, entries })?;
                }
            }
            name if name.ends_with("-cells") => {
                let count = parse_u32(data)?;
                push(&mut scratch.props, Property::SpecifierCells { name: prop.name, count })?;
            }
            _ => {
                push(&mut scratch.others, OtherProperty { name: prop.name, data })?;
            }
        }
        Ok(())
    }

    fn resolve_interrupt_maps(&mut self) -> Result<(), DtError> {
        let fdt = self.fdt;
        let deferred = core::mem::take(&mut self.deferred);
        for map in deferred {
            let child_addr_cells = fdt.address_cells(map.node_off)?;
            let child_int_cells = match fdt.cells(map.node_off, "#interrupt-cells")? {
                Some(cells) => cells,
                None => {
                    log::warn!(
                        "devicetree: node {} has an interrupt-map but no #interrupt-cells prop",
                        self.container[map.node_id].full_name
                    );
                    return Err(DtError::MalformedProperty);
                }
            };
            if map.data.is_empty() {
                continue;
            }

            let mut cursor = Cells::new(map.data)?;
            let mut entries = Vec::new();
            while !cursor.is_empty() {
                let child_unit_address = cursor.next_cells(child_addr_cells)?;
                let child_int_specifier = cursor.next_cells(child_int_cells)? as u32;
                let phandle = cursor.next_word()?;

                let parent_id = match self.phandle_map.get(&phandle) {
                    Some(id) => *id,
                    None => {
                        log::warn!(
                            "devicetree: interrupt-map refers to a phandle {phandle:#x} w/o a \
                             corresponding node"
                        );
                        return Err(DtError::UnresolvedPhandle { phandle });
                    }
                };
                let parent = &self.container[parent_id];

                let parent_unit_cells =
                    parent.addr_size_cells().map(|(addr, _)| addr).unwrap_or(0);
                let parent_unit_address = cursor.next_cells(parent_unit_cells)?;

                let int_cells = match parent.interrupt_cells() {
                    Some(count) => count,
                    None => {
                        log::warn!(
                            "devicetree: interrupt-map's phandle {phandle:#x}'s corresponding \
                             node is missing the #interrupt-cells property"
                        );
                        return Err(DtError::UnsupportedInterruptCellCount {
                            phandle,
                            count: None,
                        });
                    }
                };
                if parent.other("interrupt-controller").is_none() {
                    log::warn!(
                        "devicetree: interrupt-map's phandle {phandle:#x}'s corresponding node \
                         is missing the interrupt-controller property"
                    );
                    return Err(DtError::NotAnInterruptController { phandle });
                }
                if int_cells != 3 {
                    log::warn!(
                        "devicetree: interrupt-map's phandle {phandle:#x}'s corresponding node \
                         #interrupt-cells property doesn't have a value of 3"
                    );
                    return Err(DtError::UnsupportedInterruptCellCount {
                        phandle,
                        count: Some(int_cells),
                    });
                }

                let descriptor = parse_int_descriptor(&mut cursor)?;
                push(
                    &mut entries,
                    InterruptMapEntry {
                        child_unit_address,
                        child_int_specifier,
                        parent_phandle: phandle,
                        parent_unit_address,
                        descriptor,
                    },
                )?;
            }

            if !entries.is_empty() {
                push(&mut self.container[map.node_id].props, Property::InterruptMap(entries))?;
            }
        }
        Ok(())
    }
}

impl<'a> DeviceTree<'a> {
    /// Parse the blob behind `fdt` into a typed tree.
    ///
    /// On any failure every node and property built so far is dropped; no
    /// partial tree is observable. The returned tree borrows names and
    /// opaque payloads from the blob.
    pub fn parse(fdt: &Fdt<'a>) -> Result<DeviceTree<'a>, DtError> {
        let mut builder = TreeBuilder {
            fdt,
            container: Vec::new(),
            phandle_map: BTreeMap::new(),
            deferred: Vec::new(),
        };
        let root_off = fdt.root_offset()?;
        let root_id = builder.parse_node(root_off, 0, None)?;
        builder.resolve_interrupt_maps()?;
        Ok(DeviceTree {
            root_id,
            container: builder.container,
            phandle_map: builder.phandle_map,
        })
    }
}
