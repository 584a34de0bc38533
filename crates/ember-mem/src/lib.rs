//! Guest virtual memory for the kernel emulator.
//!
//! Memory is organised as *chunks*: contiguous virtual ranges that are reserved up front and
//! committed page by page. Every process owns an address space; process-local chunks live in its
//! private region while shared and code chunks are global and appear at the same address in every
//! space they are attached to.
//!
//! All guest accesses go through [`MemorySystem`] (or a [`SpaceView`] over it), which enforces
//! commit state, chunk permissions and natural alignment for typed accesses.
#![forbid(unsafe_code)]

mod bus;
mod chunk;
mod error;
mod layout;
mod manager;
mod snapshot;
mod space;

pub use crate::bus::{FlatMemory, GuestMemory, GuestMemoryResult, SpaceView};
pub use crate::chunk::{Backing, Chunk, ChunkId, ChunkSpec, SpaceId};
pub use crate::error::{AccessType, FaultKind, MemError, MemFault, Result};
pub use crate::layout::{AddrRange, MemoryLayout, Perms, Region, PAGE_SIZE};
pub use crate::manager::{MemoryConfig, MemorySystem, Translation};
pub use crate::space::AddressSpace;
