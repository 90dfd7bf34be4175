//! Built-in document families.

pub mod generic;
pub mod sop;

use std::sync::Arc;

use crate::error::Result;
use crate::registry::Registry;

pub use generic::GenericFilenameParser;
pub use sop::SopFilenameParser;

/// Registers the `generic` and `sop` families and their reference extractors.
pub fn register_builtin(registry: &mut Registry) -> Result<()> {
    registry.register_reference_extractor(
        generic::REFERENCE_EXTRACTOR,
        Arc::new(generic::reference_extractor()?),
    );
    registry.register_reference_extractor(
        sop::REFERENCE_EXTRACTOR,
        Arc::new(sop::reference_extractor()?),
    );

    registry.register_family(generic::FAMILY, generic::build);
    registry.register_family(sop::FAMILY, sop::build);
    Ok(())
}
