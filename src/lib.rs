pub mod format;
pub mod version;
pub mod cipher;
pub mod register;
pub mod extract;
pub mod depot;
pub mod staging;
pub mod pipeline;

pub use format::{FormatDescriptor, FormatId, CATALOG};
pub use version::DetectionOutcome;
pub use cipher::{CipherError, ResolvedCipher};
pub use register::{DecodeError, Register, Segment};
pub use depot::{ArchiveHandle, Depot};
pub use pipeline::{DepotError, DepotReport, Options, RunError, RunReport, Task};
