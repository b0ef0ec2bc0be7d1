//! Blockdelta: block-image transfer lists in Rust.
//!
//! Given a source and a target block-device image, the crate plans an
//! ordered list of block operations (`new`, `zero`, `move`, `bsdiff`,
//! `imgdiff`, `stash`, `free`, `erase`) that rewrites the source into the
//! target in place, never needing more temporary stash than the configured
//! cache allows.
//!
//! The crate provides:
//! - Block range algebra (`rangeset`)
//! - The image abstraction and in-memory images (`image`)
//! - The planner and transfer-list writer (`plan`)
//! - File-oriented helpers (`io`)
//! - An optional CLI (`cli` feature)
//!
//! # Quick Start
//!
//! ```no_run
//! use blockdelta::image::{Alignment, DataImage};
//! use blockdelta::plan::{BlockImageDiff, DiffOptions};
//!
//! let source = DataImage::new(vec![1u8; 8 * 4096], Alignment::Exact).unwrap();
//! let target = DataImage::new(vec![2u8; 8 * 4096], Alignment::Exact).unwrap();
//!
//! let mut diff = BlockImageDiff::new(&target, Some(&source), DiffOptions::default()).unwrap();
//! let (mut list, mut new_data, mut patches) = (Vec::<u8>::new(), Vec::<u8>::new(), Vec::<u8>::new());
//! let stats = diff.compute(&mut list, &mut new_data, &mut patches).unwrap();
//! println!("{} blocks written", stats.blocks_written);
//! ```

pub mod error;
pub mod image;
pub mod io;
pub mod plan;
pub mod rangeset;
pub mod transfer;

#[cfg(feature = "cli")]
pub mod cli;

pub use error::{Error, Result};
pub use rangeset::RangeSet;
