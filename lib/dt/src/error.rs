use core::fmt;

use alloc::collections::TryReserveError;

use crate::fdt::FdtError;

/// Errors produced while building or resolving a device tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtError {
    /// The blob's structure block is malformed.
    Structure(FdtError),
    /// A decode cursor ran past the end of a property's byte range.
    OutOfBounds,
    /// A property payload does not match its expected shape (length not a
    /// multiple of the computed entry size, a bad integer width, or an
    /// unrecognized string value).
    MalformedProperty,
    /// A node declares exactly one of `#address-cells`/`#size-cells`.
    MissingCompanionCellsProperty,
    /// An `interrupt-map` entry names a phandle no node declared.
    UnresolvedPhandle { phandle: u32 },
    /// The interrupt parent's `#interrupt-cells` is absent or not 3.
    UnsupportedInterruptCellCount { phandle: u32, count: Option<u32> },
    /// The node an `interrupt-map` phandle resolved to has no
    /// `interrupt-controller` marker property.
    NotAnInterruptController { phandle: u32 },
    /// An interrupt descriptor's flags nibble is outside the known set.
    UnrecognizedInterruptFlags { flags: u32 },
    /// An allocation failed while building the tree.
    AllocationFailure,
}

impl fmt::Display for DtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DtError::Structure(err) => write!(f, "malformed blob: {err}"),
            DtError::OutOfBounds => write!(f, "cursor ran past the property's end"),
            DtError::MalformedProperty => write!(f, "malformed property"),
            DtError::MissingCompanionCellsProperty => {
                write!(f, "#address-cells and #size-cells must be declared together")
            }
            DtError::UnresolvedPhandle { phandle } => {
                write!(f, "no node declares phandle {phandle:#x}")
            }
            DtError::UnsupportedInterruptCellCount { phandle, count } => match count {
                Some(count) => write!(
                    f,
                    "interrupt parent {phandle:#x} has #interrupt-cells = {count}, expected 3"
                ),
                None => write!(f, "interrupt parent {phandle:#x} has no #interrupt-cells"),
            },
            DtError::NotAnInterruptController { phandle } => {
                write!(f, "node with phandle {phandle:#x} is not an interrupt controller")
            }
            DtError::UnrecognizedInterruptFlags { flags } => {
                write!(f, "unrecognized interrupt flags {flags:#x}")
            }
            DtError::AllocationFailure => write!(f, "allocation failure"),
        }
    }
}

impl From<FdtError> for DtError {
    fn from(err: FdtError) -> Self {
        DtError::Structure(err)
    }
}

impl From<TryReserveError> for DtError {
    fn from(_: TryReserveError) -> Self {
        DtError::AllocationFailure
    }
}
