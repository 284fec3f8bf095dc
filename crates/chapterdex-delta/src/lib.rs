//! Delta-coded associative index.
//!
//! Keys are stored in sorted delta lists as Huffman-coded gaps with a fixed
//! width payload per entry. Lists live in zones that rebalance their free
//! space on demand, can be packed into immutable pages, and can be saved to
//! and restored from one stream per zone.

pub mod bits;
pub mod coding;
pub mod entry;
pub mod index;
pub mod page;
pub mod restore;
pub mod save;
pub mod stats;
pub mod zone;

pub use coding::{DeltaCoding, delta_memory_size};
pub use entry::{COLLISION_BITS, COLLISION_BYTES, DeltaIndexEntry};
pub use index::{DeltaIndex, ListRouting, zone_memory_size};
pub use page::{DeltaIndexPage, PAGE_TAG, pack_page, page_count};
pub use restore::{DeltaIndexRestore, RestorePhase};
pub use save::{
    DELTA_INDEX_HEADER_SIZE, DELTA_LIST_MAX_BYTE_COUNT, check_guard_lists, compute_save_bytes,
    write_guard_list,
};
pub use stats::DeltaIndexStats;
pub use zone::{DEFAULT_TAG, DELTA_LIST_MAX_BITS, DeltaList, DeltaZone};
