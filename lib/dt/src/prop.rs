use alloc::vec::Vec;

/// One `reg` entry: a bus address and the size of the region at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegEntry {
    pub address: u64,
    pub size: u64,
}

/// One `ranges`/`dma-ranges` entry mapping a child bus window onto the parent bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeEntry {
    pub child_bus_address: u64,
    pub parent_bus_address: u64,
    pub size: u64,
}

/// Operational status of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Okay,
    Disabled,
    Reserved,
    Fail,
    FailSss,
}

impl Status {
    /// Match one of the five recognized status strings.
    pub fn from_value(value: &str) -> Option<Status> {
        match value {
            "okay" => Some(Status::Okay),
            "disabled" => Some(Status::Disabled),
            "reserved" => Some(Status::Reserved),
            "fail" => Some(Status::Fail),
            "fail-sss" => Some(Status::FailSss),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Edge,
    Level,
}

/// A fully decoded parent-side interrupt descriptor.
///
/// `id` is already offset-adjusted: +16 for a PPI, +32 for an SPI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntDescriptor {
    pub id: u32,
    pub polarity: Polarity,
    pub trigger_mode: TriggerMode,
}

/// One resolved `interrupt-map` entry. Created only by the resolver pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptMapEntry {
    pub child_unit_address: u64,
    pub child_int_specifier: u32,
    pub parent_phandle: u32,
    pub parent_unit_address: u64,
    pub descriptor: IntDescriptor,
}

/// One `<name>-map` specifier triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecifierMapEntry {
    pub child_specifier: u64,
    pub specifier_parent: u32,
    pub parent_specifier: u64,
}

/// An unrecognized property kept verbatim; name and data borrow from the blob.
#[derive(Debug, Clone, Copy)]
pub struct OtherProperty<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
}

/// A recognized, fully decoded property.
///
/// String payloads borrow from the blob; list payloads own their decoded
/// entries. `#address-cells`/`#size-cells` pairs are merged into a single
/// [Property::AddrSizeCells] once both have been seen on a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Property<'a> {
    Compatible(&'a str),
    Model { manufacturer: &'a str, model: &'a str },
    Reg(Vec<RegEntry>),
    Ranges(Vec<RangeEntry>),
    DmaRanges(Vec<RangeEntry>),
    Status(Status),
    Phandle(u32),
    VirtualReg(u32),
    DmaCoherent,
    Interrupts(Vec<u32>),
    InterruptParent(u32),
    InterruptCells(u32),
    AddrSizeCells { addr_cells: u32, size_cells: u32 },
    InterruptMap(Vec<InterruptMapEntry>),
    InterruptMapMask(Vec<u32>),
    SpecifierMap { name: &'a str, entries: Vec<SpecifierMapEntry> },
    SpecifierCells { name: &'a str, count: u32 },
}

/// Discriminant of a [Property], for lookup without matching on payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Compatible,
    Model,
    Reg,
    Ranges,
    DmaRanges,
    Status,
    Phandle,
    VirtualReg,
    DmaCoherent,
    Interrupts,
    InterruptParent,
    InterruptCells,
    AddrSizeCells,
    InterruptMap,
    InterruptMapMask,
    SpecifierMap,
    SpecifierCells,
}

impl Property<'_> {
    pub fn kind(&self) -> PropertyKind {
        match self {
            Property::Compatible(..) => PropertyKind::Compatible,
            Property::Model { .. } => PropertyKind::Model,
            Property::Reg(..) => PropertyKind::Reg,
            Property::Ranges(..) => PropertyKind::Ranges,
            Property::DmaRanges(..) => PropertyKind::DmaRanges,
            Property::Status(..) => PropertyKind::Status,
            Property::Phandle(..) => PropertyKind::Phandle,
            Property::VirtualReg(..) => PropertyKind::VirtualReg,
            Property::DmaCoherent => PropertyKind::DmaCoherent,
            Property::Interrupts(..) => PropertyKind::Interrupts,
            Property::InterruptParent(..) => PropertyKind::InterruptParent,
            Property::InterruptCells(..) => PropertyKind::InterruptCells,
            Property::AddrSizeCells { .. } => PropertyKind::AddrSizeCells,
            Property::InterruptMap(..) => PropertyKind::InterruptMap,
            Property::InterruptMapMask(..) => PropertyKind::InterruptMapMask,
            Property::SpecifierMap { .. } => PropertyKind::SpecifierMap,
            Property::SpecifierCells { .. } => PropertyKind::SpecifierCells,
        }
    }
}
