//! Archiving object subgraphs reachable from static fields.
//!
//! `heap-archive` captures, at build ("dump") time, the object graphs
//! reachable from a curated set of static fields and writes them into a
//! compact, position-independent archive. A later process maps the archive,
//! fixes up its embedded references and populates those static fields
//! straight from the archived objects instead of re-running initializers.
//!
//! # Pipeline
//!
//! - **Eligibility**: candidates whose graphs reach identity-sensitive or
//!   externally-resourced objects are dropped, never archived.
//! - **Recording**: each entry field's graph is copied once into a closed
//!   (read-only) or open (mutable) region, with an object cache preserving
//!   sharing and terminating cycles.
//! - **Compaction**: per-class subgraph infos become records in a read-only
//!   hash table addressed entirely by relative offsets.
//! - **Fixup**: after mapping, every reference word flagged in a region's
//!   bitmap is decoded and relocated to wherever the regions landed.
//!
//! # Quick Start
//!
//! ```
//! use heap_archive::{
//!     ArchiveConfig, ArchiveSession, ClassDesc, HeapStatics, InitOutcome, LiveHeap,
//!     MmapRegionMapper, RegionKind, RuntimeArchive, Slot,
//! };
//!
//! // Dump time.
//! let mut heap = LiveHeap::new();
//! let config = heap.define_class(ClassDesc::new("Config").static_ref("INSTANCE"));
//! let obj = heap.alloc(config, vec![Slot::Prim(8080)]);
//! heap.set_static(config, "INSTANCE", Slot::Ref(Some(obj)));
//!
//! let mut session = ArchiveSession::new(ArchiveConfig::new(), &heap).unwrap();
//! session.add_preservable_static_field("Config", "INSTANCE", RegionKind::Open);
//! session.archive_all();
//! let archive = session.finish().unwrap().unwrap();
//!
//! // Load time.
//! let mut runtime =
//!     RuntimeArchive::map(archive, &ArchiveConfig::new(), &MmapRegionMapper::new()).unwrap();
//! runtime.fixup_mapped_regions().unwrap();
//!
//! let mut fresh = LiveHeap::new();
//! fresh.define_class(ClassDesc::new("Config").static_ref("INSTANCE"));
//! let outcome = runtime.initialize_from_archive("Config", &mut HeapStatics::new(&mut fresh));
//! assert_eq!(outcome, InitOutcome::Initialized { partial: true });
//! ```
//!
//! # Thread Safety
//!
//! Dumping is single-threaded over a quiesced graph. A loaded
//! [`CompactTable`] is `Sync` and may be queried from any number of
//! threads. Region fixup publishes each region with release ordering;
//! readers observe it through [`MappedRegion::state`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod archive;
mod bitmap;
mod cache;
mod candidate;
pub mod codec;
mod config;
mod eligibility;
mod error;
mod fixup;
mod heap;
mod materialize;
pub mod metrics;
mod model;
mod record;
mod recorder;
mod region;
mod runtime;
mod session;
mod subgraph;
pub mod table;
mod tracing;
mod writer;

// Re-export public API
pub use archive::{HeapArchive, ARCHIVE_MAGIC, ARCHIVE_VERSION};
pub use bitmap::RefBitmap;
pub use cache::{ArchivedAddr, ObjectCache};
pub use candidate::CandidateField;
pub use codec::{NarrowCodec, NarrowRef};
pub use config::ArchiveConfig;
pub use eligibility::{Eligibility, EligibilityAnalyzer};
pub use error::{ArchiveError, Result};
pub use fixup::{FixupStats, RegionFixup, RelocationMap};
pub use heap::LiveHeap;
pub use materialize::{HeapStatics, Materializer};
pub use metrics::{ArchiveMetrics, DumpReport, RecordingStats};
pub use model::{ClassDesc, ClassFlags, ClassId, ObjectGraph, ObjectId, Slot, StaticField};
pub use record::ArchivedRecord;
pub use recorder::SubgraphRecorder;
pub use region::{MappedRegion, MmapRegionMapper, RegionImage, RegionKind, RegionMapper, RegionState};
pub use runtime::{ArchivedObject, ArchivedValue, ClassLoaderHooks, InitOutcome, RuntimeArchive};
pub use session::ArchiveSession;
pub use subgraph::{EntryField, EntryKind, SubgraphInfo, SubgraphInfoTable};
pub use table::{CompactTable, CompactTableWriter, RecordView};
pub use crate::tracing::{ArchivePhase, SessionId};
pub use writer::HeapWriter;

/// Configuration defaults.
pub mod defaults {
    pub use crate::config::{
        DEFAULT_BUCKET_SIZE, DEFAULT_NARROW_SHIFT, DEFAULT_REGION_CAPACITY, DEFAULT_REQUESTED_BASE,
    };
}
