// File-level helpers around the planner.
//
// `compute_to_prefix()` writes the three update artifacts next to each other
// (`<prefix>.transfer.list`, `<prefix>.new.dat`, `<prefix>.patch.dat`) with
// buffered I/O. `read_image()` loads a raw image file into memory.

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::image::{Alignment, DataImage};
use crate::plan::{BlockImageDiff, ComputeStats};

const BUF_SIZE: usize = 64 * 1024; // 64 KiB

// ---------------------------------------------------------------------------
// Artifact paths
// ---------------------------------------------------------------------------

/// Output files for one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub transfer_list: PathBuf,
    pub new_data: PathBuf,
    pub patch_data: PathBuf,
}

impl Artifacts {
    pub fn for_prefix(prefix: &Path) -> Self {
        let with = |suffix: &str| {
            let mut name = OsString::from(prefix.as_os_str());
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            transfer_list: with(".transfer.list"),
            new_data: with(".new.dat"),
            patch_data: with(".patch.dat"),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Load a raw image file. Block alignment is handled per `alignment`.
pub fn read_image(path: &Path, alignment: Alignment) -> Result<DataImage> {
    let data = std::fs::read(path)?;
    Ok(DataImage::new(data, alignment)?)
}

/// Run `diff` and write its artifacts under `prefix`.
pub fn compute_to_prefix(diff: &mut BlockImageDiff<'_>, prefix: &Path) -> Result<ComputeStats> {
    let paths = Artifacts::for_prefix(prefix);
    let mut transfer_list = BufWriter::with_capacity(BUF_SIZE, File::create(&paths.transfer_list)?);
    let mut new_data = BufWriter::with_capacity(BUF_SIZE, File::create(&paths.new_data)?);
    let mut patch_data = BufWriter::with_capacity(BUF_SIZE, File::create(&paths.patch_data)?);

    let stats = diff.compute(&mut transfer_list, &mut new_data, &mut patch_data)?;

    transfer_list.flush()?;
    new_data.flush()?;
    patch_data.flush()?;
    Ok(stats)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
