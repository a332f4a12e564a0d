//! The two allocation engines (spec.md §4.8): [`physical`] backs each
//! size class with OS-committed pages inside a process-reserved virtual
//! arena; [`virtual_engine`] backs every size class with pseudo-pages
//! multiplexed over a small pool of physical pages borrowed from an
//! external kernel page-allocation service.

pub mod physical;
pub mod virtual_engine;
