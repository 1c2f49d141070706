//! The game finder: request registry, matching passes, ready checks and
//! resolution

pub mod broadcast;
pub mod extractor;
pub mod pass;
pub mod ready_check;
pub mod registry;
pub mod request;
pub mod resolution;
pub mod service;
pub mod stats;

pub use broadcast::Broadcaster;
pub use extractor::{DataExtractor, GroupDraft, ParametersExtractor};
pub use pass::{PassOutcome, PassRunner};
pub use ready_check::{ReadyCheck, ReadyCheckCoordinator, ReadyCheckResult};
pub use registry::RequestRegistry;
pub use request::{PendingRequest, Settlement};
pub use resolution::{GameResolution, Resolver, ResolutionWriter, WriterContext};
pub use service::{FindGameOutcome, GameFinderService, GameFinderServiceBuilder};
pub use stats::{GameFinderStats, GameFinderStatsSnapshot};
